//! Network namespace flag parsing.
//!
//! The network family understands more than the generic literals:
//! `none`, `bridge[:opts]`, `slirp4netns[:opts]`, `pasta[:opts]`, and a bare
//! comma-separated list of network names (which implies bridge mode).

use super::{Namespace, NamespaceFamily, NamespaceMode};
use serde::{Deserialize, Serialize};
use specgen_shared::constants::container::DEFAULT_NETWORK;
use specgen_shared::{NamespaceError, SpecgenResult};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Per-network attachment options given with `bridge:` or `name:`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerNetworkOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
}

/// Result of parsing one or more `--network` flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSelection {
    pub namespace: Namespace,
    /// Networks to attach in bridge mode.
    pub networks: BTreeMap<String, PerNetworkOptions>,
    /// Options for user-mode network helpers, keyed by helper name.
    pub options: BTreeMap<String, Vec<String>>,
}

impl NetworkSelection {
    fn mode(mode: NamespaceMode) -> Self {
        Self {
            namespace: Namespace::new(mode),
            ..Default::default()
        }
    }
}

/// Parse a single `--network` value.
pub fn parse_network_namespace(raw: &str) -> SpecgenResult<NetworkSelection> {
    parse_network_flags(&[raw])
}

/// Parse every `--network` value given to one container.
///
/// The first value selects the mode; additional values name extra networks
/// and are only legal in bridge mode.
pub fn parse_network_flags<S: AsRef<str>>(flags: &[S]) -> SpecgenResult<NetworkSelection> {
    let first = flags.first().map(|s| s.as_ref()).unwrap_or("");
    let mut selection = parse_first(first)?;

    if flags.len() > 1 {
        if selection.namespace.mode != NamespaceMode::Bridge {
            return Err(NamespaceError::NetworkOption(format!(
                "cannot set multiple networks without bridge network mode, selected mode {}",
                selection.namespace.mode
            ))
            .into());
        }
        for extra in &flags[1..] {
            let (name, opts) = parse_named_network(extra.as_ref())?;
            if selection.networks.insert(name.clone(), opts).is_some() {
                return Err(NamespaceError::NetworkOption(format!(
                    "network {:?} is specified multiple times",
                    name
                ))
                .into());
            }
        }
    }

    selection.namespace.validate(NamespaceFamily::Network)?;
    Ok(selection)
}

fn parse_first(raw: &str) -> SpecgenResult<NetworkSelection> {
    let (head, opts) = match raw.split_once(':') {
        Some((h, o)) => (h, Some(o)),
        None => (raw, None),
    };

    let selection = match (head, opts) {
        ("" | "default", None) => NetworkSelection::mode(NamespaceMode::Default),
        ("private", None) => NetworkSelection::mode(NamespaceMode::Private),
        ("host", None) => NetworkSelection::mode(NamespaceMode::Host),
        ("none", None) => NetworkSelection::mode(NamespaceMode::NoNetwork),
        ("pod", None) => NetworkSelection::mode(NamespaceMode::FromPod),
        ("default" | "private" | "host" | "none" | "pod", Some(value)) => {
            return Err(NamespaceError::unexpected_value(head, value).into());
        }
        ("slirp4netns" | "pasta", _) => {
            let mode = if head == "pasta" {
                NamespaceMode::Pasta
            } else {
                NamespaceMode::Slirp4netns
            };
            let mut selection = NetworkSelection::mode(mode);
            if let Some(o) = opts {
                let list: Vec<String> = o
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                selection.options.insert(head.to_string(), list);
            }
            selection
        }
        ("bridge", _) => {
            let mut selection = NetworkSelection::mode(NamespaceMode::Bridge);
            let per = match opts {
                Some(o) => parse_bridge_options(o)?,
                None => PerNetworkOptions::default(),
            };
            selection.networks.insert(DEFAULT_NETWORK.to_string(), per);
            selection
        }
        ("ns", Some(path)) => NetworkSelection {
            namespace: Namespace::with_value(NamespaceMode::Path, path),
            ..Default::default()
        },
        ("container", Some(id)) => NetworkSelection {
            namespace: Namespace::with_value(NamespaceMode::FromContainer, id),
            ..Default::default()
        },
        _ => {
            // A bare list of networks: "net1,net2" or "net1:ip=10.0.0.2".
            let mut selection = NetworkSelection::mode(NamespaceMode::Bridge);
            for item in split_network_list(raw) {
                let (name, opts) = parse_named_network(item)?;
                selection.networks.insert(name, opts);
            }
            selection
        }
    };

    Ok(selection)
}

/// Split a network list on commas that start a new network name.
///
/// Commas inside an option list (`net1:ip=1.2.3.4,mac=...`) belong to the
/// preceding network, so a segment containing `=` but no `:` is glued back.
fn split_network_list(raw: &str) -> Vec<&str> {
    let mut items: Vec<&str> = Vec::new();
    let mut start = 0;
    for (idx, _) in raw.match_indices(',') {
        let next = &raw[idx + 1..];
        let next_segment = next.split(',').next().unwrap_or("");
        let continues_options = next_segment.contains('=') && !next_segment.contains(':');
        if !continues_options {
            items.push(&raw[start..idx]);
            start = idx + 1;
        }
    }
    items.push(&raw[start..]);
    items
}

fn parse_named_network(raw: &str) -> SpecgenResult<(String, PerNetworkOptions)> {
    let (name, opts) = match raw.split_once(':') {
        Some((n, o)) => (n, Some(o)),
        None => (raw, None),
    };
    if name.is_empty() {
        return Err(NamespaceError::NetworkOption(format!(
            "network name cannot be empty in {:?}",
            raw
        ))
        .into());
    }
    let per = match opts {
        Some(o) => parse_bridge_options(o)?,
        None => PerNetworkOptions::default(),
    };
    Ok((name.to_string(), per))
}

/// Parse `ip=`, `ip6=`, `mac=`, `alias=` and `interface_name=` options.
pub fn parse_bridge_options(opts: &str) -> SpecgenResult<PerNetworkOptions> {
    let mut per = PerNetworkOptions::default();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        let (key, value) = opt.split_once('=').ok_or_else(|| {
            NamespaceError::NetworkOption(format!("invalid option {:?}, expected key=value", opt))
        })?;
        match key {
            "ip" | "ip6" => {
                let ip: IpAddr = value.parse().map_err(|_| {
                    NamespaceError::NetworkOption(format!("invalid ip address {:?}", value))
                })?;
                if (key == "ip" && !ip.is_ipv4()) || (key == "ip6" && !ip.is_ipv6()) {
                    return Err(NamespaceError::NetworkOption(format!(
                        "{} address family mismatch for {:?}",
                        key, value
                    ))
                    .into());
                }
                per.static_ips.push(ip);
            }
            "mac" => {
                if !is_mac_address(value) {
                    return Err(NamespaceError::NetworkOption(format!(
                        "invalid mac address {:?}",
                        value
                    ))
                    .into());
                }
                per.static_mac = Some(value.to_ascii_lowercase());
            }
            "alias" => per.aliases.push(value.to_string()),
            "interface_name" => per.interface_name = Some(value.to_string()),
            _ => {
                return Err(NamespaceError::NetworkOption(format!(
                    "unknown bridge network option: {}",
                    key
                ))
                .into());
            }
        }
    }
    Ok(per)
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_modes() {
        assert_eq!(
            parse_network_namespace("host").unwrap().namespace.mode,
            NamespaceMode::Host
        );
        assert_eq!(
            parse_network_namespace("none").unwrap().namespace.mode,
            NamespaceMode::NoNetwork
        );
        assert_eq!(
            parse_network_namespace("").unwrap().namespace.mode,
            NamespaceMode::Default
        );
        assert_eq!(
            parse_network_namespace("container:web").unwrap().namespace,
            Namespace::with_value(NamespaceMode::FromContainer, "web")
        );
        assert!(parse_network_namespace("container:").is_err());
    }

    #[test]
    fn test_slirp_options() {
        let sel = parse_network_namespace("slirp4netns:allow_host_loopback=true,mtu=1500").unwrap();
        assert_eq!(sel.namespace.mode, NamespaceMode::Slirp4netns);
        assert_eq!(
            sel.options["slirp4netns"],
            vec!["allow_host_loopback=true", "mtu=1500"]
        );
    }

    #[test]
    fn test_bridge_with_options() {
        let sel = parse_network_namespace("bridge:ip=10.88.0.5,mac=AA:bb:cc:dd:ee:ff,alias=web")
            .unwrap();
        assert_eq!(sel.namespace.mode, NamespaceMode::Bridge);
        let per = &sel.networks[DEFAULT_NETWORK];
        assert_eq!(per.static_ips, vec!["10.88.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(per.static_mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(per.aliases, vec!["web"]);
    }

    #[test]
    fn test_network_list_implies_bridge() {
        let sel = parse_network_namespace("front,back:ip=10.0.0.2,alias=db").unwrap();
        assert_eq!(sel.namespace.mode, NamespaceMode::Bridge);
        assert_eq!(sel.networks.len(), 2);
        assert_eq!(sel.networks["back"].aliases, vec!["db"]);
    }

    #[test]
    fn test_multiple_flags_require_bridge() {
        let sel = parse_network_flags(&["front", "back"]).unwrap();
        assert_eq!(sel.networks.len(), 2);
        assert!(parse_network_flags(&["host", "back"]).is_err());
        assert!(parse_network_flags(&["front", "front"]).is_err());
    }

    #[test]
    fn test_bad_bridge_options() {
        assert!(parse_bridge_options("ip=not-an-ip").is_err());
        assert!(parse_bridge_options("ip=fd00::1").is_err());
        assert!(parse_bridge_options("mac=zz").is_err());
        assert!(parse_bridge_options("color=blue").is_err());
        assert!(parse_bridge_options("interface_name=eth1").is_ok());
    }
}

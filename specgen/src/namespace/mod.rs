//! Namespace mode parsing and validation.
//!
//! Every namespace family (pid, ipc, uts, user, cgroup, network, mount) is
//! described by a [`Namespace`]: a closed [`NamespaceMode`] plus an optional
//! value (a path, a container ID, or an option string for the modes that take
//! one). Each family has its own parse function because the legal literals
//! differ between families.
//!
//! ```text
//! ""/"private"       → Private
//! "host"             → Host
//! "pod"              → FromPod
//! "ns:<path>"        → Path         (value = path)
//! "container:<id>"   → FromContainer (value = id)
//! ```
//!
//! Parsing never touches the host, with one exception: the cgroup namespace
//! default depends on the cgroup version, which callers pass in.

pub mod network;

use crate::host::CgroupVersion;
use oci_spec::runtime::LinuxNamespaceType;
use serde::{Deserialize, Serialize};
use specgen_shared::{NamespaceError, SpecgenResult};
use std::fmt;

pub use network::{
    NetworkSelection, PerNetworkOptions, parse_network_flags, parse_network_namespace,
};

// ============================================================================
// Namespace Mode
// ============================================================================

/// How a namespace is set up for the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    /// Resolved later from the engine configuration.
    #[default]
    Default,
    /// Join the host's namespace.
    Host,
    /// Join the namespace at a filesystem path.
    Path,
    /// Join another container's namespace.
    #[serde(rename = "container")]
    FromContainer,
    /// Join the pod's namespace.
    #[serde(rename = "pod")]
    FromPod,
    /// Create a fresh namespace.
    Private,
    /// Fresh IPC namespace that other containers may join.
    Shareable,
    /// Network namespace with loopback only.
    #[serde(rename = "none")]
    NoNetwork,
    /// Network namespace attached to one or more bridge networks.
    Bridge,
    /// Rootless user-mode networking via slirp4netns.
    Slirp4netns,
    /// Rootless user-mode networking via pasta.
    Pasta,
    /// User namespace mapping the invoking user to the same ID inside.
    #[serde(rename = "keep-id")]
    KeepId,
    /// User namespace without mapping the invoking user.
    #[serde(rename = "nomap")]
    NoMap,
    /// User namespace with automatically chosen ID ranges.
    Auto,
}

impl NamespaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceMode::Default => "default",
            NamespaceMode::Host => "host",
            NamespaceMode::Path => "path",
            NamespaceMode::FromContainer => "container",
            NamespaceMode::FromPod => "pod",
            NamespaceMode::Private => "private",
            NamespaceMode::Shareable => "shareable",
            NamespaceMode::NoNetwork => "none",
            NamespaceMode::Bridge => "bridge",
            NamespaceMode::Slirp4netns => "slirp4netns",
            NamespaceMode::Pasta => "pasta",
            NamespaceMode::KeepId => "keep-id",
            NamespaceMode::NoMap => "nomap",
            NamespaceMode::Auto => "auto",
        }
    }

    /// Modes that only make sense for the network namespace.
    pub fn is_network_only(&self) -> bool {
        matches!(
            self,
            NamespaceMode::NoNetwork
                | NamespaceMode::Bridge
                | NamespaceMode::Slirp4netns
                | NamespaceMode::Pasta
        )
    }

    /// Modes that only make sense for the user namespace.
    pub fn is_user_only(&self) -> bool {
        matches!(
            self,
            NamespaceMode::KeepId | NamespaceMode::NoMap | NamespaceMode::Auto
        )
    }

    /// Whether a value is mandatory.
    fn requires_value(&self) -> bool {
        matches!(self, NamespaceMode::Path | NamespaceMode::FromContainer)
    }

    /// Modes whose value carries an option string.
    fn accepts_options(&self) -> bool {
        matches!(
            self,
            NamespaceMode::Bridge
                | NamespaceMode::Slirp4netns
                | NamespaceMode::Pasta
                | NamespaceMode::KeepId
                | NamespaceMode::Auto
        )
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Namespace Family
// ============================================================================

/// The kernel namespace a [`Namespace`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceFamily {
    Pid,
    Ipc,
    Uts,
    User,
    Cgroup,
    Network,
    Mount,
}

impl NamespaceFamily {
    pub const ALL: [NamespaceFamily; 7] = [
        NamespaceFamily::Pid,
        NamespaceFamily::Ipc,
        NamespaceFamily::Uts,
        NamespaceFamily::User,
        NamespaceFamily::Cgroup,
        NamespaceFamily::Network,
        NamespaceFamily::Mount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceFamily::Pid => "pid",
            NamespaceFamily::Ipc => "ipc",
            NamespaceFamily::Uts => "uts",
            NamespaceFamily::User => "user",
            NamespaceFamily::Cgroup => "cgroup",
            NamespaceFamily::Network => "network",
            NamespaceFamily::Mount => "mount",
        }
    }

    pub fn oci_type(&self) -> LinuxNamespaceType {
        match self {
            NamespaceFamily::Pid => LinuxNamespaceType::Pid,
            NamespaceFamily::Ipc => LinuxNamespaceType::Ipc,
            NamespaceFamily::Uts => LinuxNamespaceType::Uts,
            NamespaceFamily::User => LinuxNamespaceType::User,
            NamespaceFamily::Cgroup => LinuxNamespaceType::Cgroup,
            NamespaceFamily::Network => LinuxNamespaceType::Network,
            NamespaceFamily::Mount => LinuxNamespaceType::Mount,
        }
    }

    /// Parse a family name as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pid" => Some(NamespaceFamily::Pid),
            "ipc" => Some(NamespaceFamily::Ipc),
            "uts" => Some(NamespaceFamily::Uts),
            "user" | "userns" => Some(NamespaceFamily::User),
            "cgroup" | "cgroupns" => Some(NamespaceFamily::Cgroup),
            "net" | "network" => Some(NamespaceFamily::Network),
            "mnt" | "mount" => Some(NamespaceFamily::Mount),
            _ => None,
        }
    }
}

impl fmt::Display for NamespaceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Namespace
// ============================================================================

/// A namespace mode plus its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "nsmode", default)]
    pub mode: NamespaceMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl Namespace {
    pub fn new(mode: NamespaceMode) -> Self {
        Self {
            mode,
            value: String::new(),
        }
    }

    pub fn with_value(mode: NamespaceMode, value: impl Into<String>) -> Self {
        Self {
            mode,
            value: value.into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.mode == NamespaceMode::Default
    }

    pub fn is_host(&self) -> bool {
        self.mode == NamespaceMode::Host
    }

    pub fn is_private(&self) -> bool {
        self.mode == NamespaceMode::Private
    }

    pub fn is_container(&self) -> bool {
        self.mode == NamespaceMode::FromContainer
    }

    pub fn is_pod(&self) -> bool {
        self.mode == NamespaceMode::FromPod
    }

    pub fn is_path(&self) -> bool {
        self.mode == NamespaceMode::Path
    }

    /// Container ID for `container:<id>` namespaces.
    pub fn container_id(&self) -> Option<&str> {
        if self.is_container() {
            Some(self.value.as_str())
        } else {
            None
        }
    }

    /// Check the value rules and the family restrictions.
    ///
    /// Path and container modes require a value, option-carrying modes
    /// tolerate one, everything else rejects it. Network-only and user-only
    /// modes are rejected outside their family; `shareable` is IPC only.
    pub fn validate(&self, family: NamespaceFamily) -> SpecgenResult<()> {
        let mode = self.mode;

        if mode.is_network_only() && family != NamespaceFamily::Network {
            return Err(NamespaceError::not_allowed(mode.as_str(), family.as_str()).into());
        }
        if mode.is_user_only() && family != NamespaceFamily::User {
            return Err(NamespaceError::not_allowed(mode.as_str(), family.as_str()).into());
        }
        if mode == NamespaceMode::Shareable && family != NamespaceFamily::Ipc {
            return Err(NamespaceError::not_allowed(mode.as_str(), family.as_str()).into());
        }

        if mode.requires_value() {
            if self.value.is_empty() {
                return Err(NamespaceError::missing_value(mode.as_str()).into());
            }
        } else if !self.value.is_empty() && !mode.accepts_options() {
            return Err(NamespaceError::unexpected_value(mode.as_str(), &self.value).into());
        }

        Ok(())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            NamespaceMode::Path => write!(f, "ns:{}", self.value),
            _ if self.value.is_empty() => f.write_str(self.mode.as_str()),
            _ => write!(f, "{}:{}", self.mode, self.value),
        }
    }
}

// ============================================================================
// Parsers
// ============================================================================

/// Parse the literals shared by every family.
///
/// Returns `None` for literals the generic grammar does not know, so the
/// family parsers can layer their own literals on top.
fn parse_common(raw: &str) -> Option<Namespace> {
    match raw {
        "" | "private" => Some(Namespace::new(NamespaceMode::Private)),
        "host" => Some(Namespace::new(NamespaceMode::Host)),
        "pod" => Some(Namespace::new(NamespaceMode::FromPod)),
        _ => {
            if let Some(path) = raw.strip_prefix("ns:") {
                Some(Namespace::with_value(NamespaceMode::Path, path))
            } else {
                raw.strip_prefix("container:")
                    .map(|id| Namespace::with_value(NamespaceMode::FromContainer, id))
            }
        }
    }
}

fn finish(ns: Namespace, family: NamespaceFamily) -> SpecgenResult<Namespace> {
    ns.validate(family)?;
    Ok(ns)
}

/// Parse a pid/uts/mount namespace literal.
pub fn parse_namespace(raw: &str) -> SpecgenResult<Namespace> {
    parse_for_family(raw, NamespaceFamily::Pid)
}

/// Parse a literal with the generic grammar, validated for `family`.
pub fn parse_for_family(raw: &str, family: NamespaceFamily) -> SpecgenResult<Namespace> {
    match parse_common(raw) {
        Some(ns) => finish(ns, family),
        None => Err(NamespaceError::invalid(family.as_str(), raw).into()),
    }
}

/// Parse an IPC namespace literal. Empty and `shareable` select a shareable namespace.
pub fn parse_ipc_namespace(raw: &str) -> SpecgenResult<Namespace> {
    match raw {
        "" | "shareable" => Ok(Namespace::new(NamespaceMode::Shareable)),
        _ => parse_for_family(raw, NamespaceFamily::Ipc),
    }
}

/// Parse a cgroup namespace literal.
///
/// The empty literal resolves to the host namespace on cgroup v1 and a
/// private namespace on v2.
pub fn parse_cgroup_namespace(raw: &str, version: CgroupVersion) -> SpecgenResult<Namespace> {
    if raw.is_empty() {
        let mode = match version {
            CgroupVersion::V1 => NamespaceMode::Host,
            CgroupVersion::V2 => NamespaceMode::Private,
        };
        return Ok(Namespace::new(mode));
    }
    parse_for_family(raw, NamespaceFamily::Cgroup)
}

/// Parse a user namespace literal.
///
/// Understands `auto[:opts]`, `keep-id[:opts]` and `nomap` on top of the
/// generic literals. The empty literal means the host user namespace.
pub fn parse_user_namespace(raw: &str) -> SpecgenResult<Namespace> {
    let ns = match raw {
        "" => Namespace::new(NamespaceMode::Host),
        "auto" => Namespace::new(NamespaceMode::Auto),
        "keep-id" => Namespace::new(NamespaceMode::KeepId),
        "nomap" => Namespace::new(NamespaceMode::NoMap),
        _ => {
            if let Some(opts) = raw.strip_prefix("auto:") {
                parse_auto_options(opts)?;
                Namespace::with_value(NamespaceMode::Auto, opts)
            } else if let Some(opts) = raw.strip_prefix("keep-id:") {
                parse_keep_id_options(opts)?;
                Namespace::with_value(NamespaceMode::KeepId, opts)
            } else {
                return parse_for_family(raw, NamespaceFamily::User);
            }
        }
    };
    finish(ns, NamespaceFamily::User)
}

/// Options accepted by `keep-id:`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepIdOptions {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Options accepted by `auto:`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoUserNsOptions {
    pub size: Option<u32>,
    pub uid_mapping: Vec<String>,
    pub gid_mapping: Vec<String>,
}

fn parse_id(key: &str, value: &str) -> SpecgenResult<u32> {
    value.parse::<u32>().map_err(|_| {
        NamespaceError::invalid("user", format!("{}={}", key, value)).into()
    })
}

/// Parse the comma-separated options of `keep-id:`.
pub fn parse_keep_id_options(opts: &str) -> SpecgenResult<KeepIdOptions> {
    let mut parsed = KeepIdOptions::default();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt.split_once('=') {
            Some(("uid", v)) => parsed.uid = Some(parse_id("uid", v)?),
            Some(("gid", v)) => parsed.gid = Some(parse_id("gid", v)?),
            _ => return Err(NamespaceError::invalid("user", format!("keep-id:{}", opt)).into()),
        }
    }
    Ok(parsed)
}

/// Parse the comma-separated options of `auto:`.
pub fn parse_auto_options(opts: &str) -> SpecgenResult<AutoUserNsOptions> {
    let mut parsed = AutoUserNsOptions::default();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt.split_once('=') {
            Some(("size", v)) => parsed.size = Some(parse_id("size", v)?),
            Some(("uidmapping", v)) => parsed.uid_mapping.push(v.to_string()),
            Some(("gidmapping", v)) => parsed.gid_mapping.push(v.to_string()),
            _ => return Err(NamespaceError::invalid("user", format!("auto:{}", opt)).into()),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgen_shared::{ErrorKind, SpecgenError};

    fn ns_err(result: SpecgenResult<Namespace>) -> NamespaceError {
        match result {
            Err(SpecgenError::Namespace(e)) => e,
            other => panic!("expected namespace error, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_literals() {
        assert_eq!(parse_namespace("").unwrap().mode, NamespaceMode::Private);
        assert_eq!(parse_namespace("private").unwrap().mode, NamespaceMode::Private);
        assert_eq!(parse_namespace("host").unwrap().mode, NamespaceMode::Host);
        assert_eq!(parse_namespace("pod").unwrap().mode, NamespaceMode::FromPod);
        assert_eq!(
            parse_namespace("ns:/proc/1/ns/pid").unwrap(),
            Namespace::with_value(NamespaceMode::Path, "/proc/1/ns/pid")
        );
    }

    #[test]
    fn test_container_value() {
        assert_eq!(
            parse_namespace("container:abc").unwrap(),
            Namespace::with_value(NamespaceMode::FromContainer, "abc")
        );
        assert_eq!(
            ns_err(parse_namespace("container:")),
            NamespaceError::missing_value("container")
        );
        assert_eq!(ns_err(parse_namespace("ns:")), NamespaceError::missing_value("path"));
    }

    #[test]
    fn test_unrecognized_literal() {
        let err = parse_namespace("bogus").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn test_network_modes_rejected_elsewhere() {
        for raw in ["none", "bridge", "slirp4netns"] {
            assert!(parse_namespace(raw).is_err(), "{raw} must not parse for pid");
        }
        let ns = Namespace::new(NamespaceMode::Bridge);
        assert_eq!(
            ns.validate(NamespaceFamily::Uts).unwrap_err().kind(),
            ErrorKind::InvalidConfig
        );
        assert!(ns.validate(NamespaceFamily::Network).is_ok());
    }

    #[test]
    fn test_unexpected_value() {
        let ns = Namespace::with_value(NamespaceMode::Host, "x");
        match ns.validate(NamespaceFamily::Pid) {
            Err(SpecgenError::Namespace(NamespaceError::UnexpectedValue { mode, value })) => {
                assert_eq!(mode, "host");
                assert_eq!(value, "x");
            }
            other => panic!("unexpected {:?}", other),
        }
        // Option-carrying modes tolerate a value.
        let ns = Namespace::with_value(NamespaceMode::Slirp4netns, "port_handler=slirp4netns");
        assert!(ns.validate(NamespaceFamily::Network).is_ok());
    }

    #[test]
    fn test_ipc_namespace() {
        assert_eq!(parse_ipc_namespace("").unwrap().mode, NamespaceMode::Shareable);
        assert_eq!(
            parse_ipc_namespace("shareable").unwrap().mode,
            NamespaceMode::Shareable
        );
        assert_eq!(parse_ipc_namespace("host").unwrap().mode, NamespaceMode::Host);
        assert!(parse_namespace("shareable").is_err());
    }

    #[test]
    fn test_cgroup_namespace_default_follows_version() {
        assert_eq!(
            parse_cgroup_namespace("", CgroupVersion::V1).unwrap().mode,
            NamespaceMode::Host
        );
        assert_eq!(
            parse_cgroup_namespace("", CgroupVersion::V2).unwrap().mode,
            NamespaceMode::Private
        );
        assert_eq!(
            parse_cgroup_namespace("host", CgroupVersion::V2).unwrap().mode,
            NamespaceMode::Host
        );
    }

    #[test]
    fn test_user_namespace() {
        assert_eq!(parse_user_namespace("").unwrap().mode, NamespaceMode::Host);
        assert_eq!(parse_user_namespace("auto").unwrap().mode, NamespaceMode::Auto);
        assert_eq!(
            parse_user_namespace("auto:size=65536").unwrap(),
            Namespace::with_value(NamespaceMode::Auto, "size=65536")
        );
        assert_eq!(parse_user_namespace("keep-id").unwrap().mode, NamespaceMode::KeepId);
        assert_eq!(
            parse_user_namespace("keep-id:uid=1000,gid=1000").unwrap().value,
            "uid=1000,gid=1000"
        );
        assert_eq!(parse_user_namespace("nomap").unwrap().mode, NamespaceMode::NoMap);
        assert!(parse_user_namespace("keep-id:foo=1").is_err());
        assert!(parse_namespace("keep-id").is_err());
    }

    #[test]
    fn test_keep_id_options() {
        let opts = parse_keep_id_options("uid=1000,gid=100").unwrap();
        assert_eq!(opts.uid, Some(1000));
        assert_eq!(opts.gid, Some(100));
        assert!(parse_keep_id_options("uid=abc").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["host", "private", "pod", "ns:/run/netns/x", "container:abc"] {
            let ns = parse_namespace(raw).unwrap();
            assert_eq!(parse_namespace(&ns.to_string()).unwrap(), ns);
        }
    }

    #[test]
    fn test_serde_mode_names() {
        let ns = Namespace::with_value(NamespaceMode::FromContainer, "abc");
        let json = serde_json::to_string(&ns).unwrap();
        assert_eq!(json, r#"{"nsmode":"container","value":"abc"}"#);
        let back: Namespace = serde_json::from_str(r#"{"nsmode":"keep-id"}"#).unwrap();
        assert_eq!(back.mode, NamespaceMode::KeepId);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn literal() -> impl Strategy<Value = String> {
            prop_oneof![
                Just(String::new()),
                Just("host".to_string()),
                Just("private".to_string()),
                Just("pod".to_string()),
                Just("none".to_string()),
                Just("bridge".to_string()),
                "[a-z]{0,8}".prop_map(|s| format!("ns:{}", s)),
                "[a-z0-9]{0,8}".prop_map(|s| format!("container:{}", s)),
                "[a-z:]{0,12}",
            ]
        }

        proptest! {
            #[test]
            fn parse_is_pure(raw in literal()) {
                let a = parse_namespace(&raw);
                let b = parse_namespace(&raw);
                match (a, b) {
                    (Ok(x), Ok(y)) => prop_assert_eq!(x, y),
                    (Err(x), Err(y)) => prop_assert_eq!(x.to_string(), y.to_string()),
                    _ => prop_assert!(false, "parse results diverged for {:?}", raw),
                }
            }

            #[test]
            fn value_rules_hold(value in "[a-z]{0,6}") {
                for mode in [NamespaceMode::Path, NamespaceMode::FromContainer] {
                    let ok = Namespace::with_value(mode, value.clone())
                        .validate(NamespaceFamily::Pid)
                        .is_ok();
                    prop_assert_eq!(ok, !value.is_empty());
                }
                for mode in [NamespaceMode::Host, NamespaceMode::Private, NamespaceMode::FromPod] {
                    let ok = Namespace::with_value(mode, value.clone())
                        .validate(NamespaceFamily::Pid)
                        .is_ok();
                    prop_assert_eq!(ok, value.is_empty());
                }
            }
        }
    }
}

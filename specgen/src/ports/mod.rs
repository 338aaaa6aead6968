//! Port mapping validation, merging and host-port allocation.
//!
//! ```text
//! requested mappings ──validate──► buckets by (host ip, protocol)
//!                                      │
//!                    sorted: concrete host ports first, host port 0 last
//!                                      │
//!          concrete: join ranges with equal offsets, reject overlaps
//!          host 0:   join overlapping container ranges, pick random host port
//!                                      │
//!                      exposed ports (publish-all only) ──► random host port
//! ```
//!
//! Random allocation only avoids ports claimed by this container. Two
//! compilations racing for the same free port is an accepted limitation.

pub mod parse;
pub mod picker;

pub use parse::parse_port_spec;
pub use picker::{BindPortPicker, PortAllocation, PortPicker, RandomPortPicker};

use serde::{Deserialize, Serialize};
use specgen_shared::constants::limits::PORT_ALLOCATION_TRIES;
use specgen_shared::{PortError, SpecgenResult};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

const PROTOCOLS: &[&str] = &["tcp", "udp", "sctp"];

/// One host-to-container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind; empty means every address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    /// Host port; 0 requests a random one.
    #[serde(default)]
    pub host_port: u16,
    pub container_port: u16,
    /// One protocol, or a comma-separated list on input. Empty means tcp.
    #[serde(default)]
    pub protocol: String,
    /// Number of consecutive ports. 0 is treated as 1.
    #[serde(default = "default_range")]
    pub range: u16,
}

fn default_range() -> u16 {
    1
}

impl PortMapping {
    /// A single tcp mapping.
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: String::new(),
            host_port,
            container_port,
            protocol: "tcp".to_string(),
            range: 1,
        }
    }

    pub fn with_range(mut self, range: u16) -> Self {
        self.range = range;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_host_ip(mut self, host_ip: impl Into<String>) -> Self {
        self.host_ip = host_ip.into();
        self
    }

    fn container_end(&self) -> u32 {
        self.container_port as u32 + self.range as u32
    }

    fn host_end(&self) -> u32 {
        self.host_port as u32 + self.range as u32
    }

    /// Whether this mapping covers `port` inside the container.
    pub fn covers_container_port(&self, port: u16) -> bool {
        self.container_port <= port && (port as u32) < self.container_end()
    }
}

/// Split a protocol list, dropping duplicates. Empty means tcp.
pub fn parse_protocols(raw: &str) -> SpecgenResult<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut protocols = Vec::new();
    for proto in raw.split(',') {
        let proto = proto.trim().to_ascii_lowercase();
        if proto.is_empty() {
            continue;
        }
        if !PROTOCOLS.contains(&proto.as_str()) {
            return Err(PortError::invalid(format!("unrecognized protocol {:?} in port mapping", proto)).into());
        }
        if seen.insert(proto.clone()) {
            protocols.push(proto);
        }
    }
    if protocols.is_empty() {
        protocols.push("tcp".to_string());
    }
    Ok(protocols)
}

fn validate(mapping: &PortMapping) -> SpecgenResult<u16> {
    if mapping.container_port == 0 {
        return Err(PortError::invalid("container port number must be non-0").into());
    }
    let range = mapping.range.max(1);
    if mapping.container_port as u32 + range as u32 - 1 > 65535 {
        return Err(PortError::invalid("container port range exceeds maximum allowable port number").into());
    }
    if mapping.host_port != 0 && mapping.host_port as u32 + range as u32 - 1 > 65535 {
        return Err(PortError::invalid("host port range exceeds maximum allowable port number").into());
    }
    if !mapping.host_ip.is_empty() && mapping.host_ip.parse::<IpAddr>().is_err() {
        return Err(PortError::invalid(format!(
            "invalid IP address {:?} in port mapping",
            mapping.host_ip
        ))
        .into());
    }
    Ok(range)
}

/// Host ports 0 sort last; ties break on container port.
fn bucket_order(a: &PortMapping, b: &PortMapping) -> Ordering {
    match (a.host_port, b.host_port) {
        (0, 0) => a.container_port.cmp(&b.container_port),
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (x, y) => x.cmp(&y).then(a.container_port.cmp(&b.container_port)),
    }
}

/// Host ports claimed so far in one (host ip, protocol) bucket.
#[derive(Default)]
struct UsedPorts(HashSet<u16>);

impl UsedPorts {
    fn claim(&mut self, start: u16, range: u16) {
        for offset in 0..range as u32 {
            self.0.insert((start as u32 + offset) as u16);
        }
    }

    fn is_free(&self, start: u16, range: u16) -> bool {
        (0..range as u32).all(|offset| !self.0.contains(&((start as u32 + offset) as u16)))
    }
}

/// Pick a random host port with room for `range` consecutive ports.
fn random_host_port(
    picker: &dyn PortPicker,
    used: &UsedPorts,
    container_port: u16,
    range: u16,
) -> SpecgenResult<u16> {
    for _ in 0..PORT_ALLOCATION_TRIES {
        let candidate = match picker.candidate() {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!(error = %e, "port candidate lookup failed");
                continue;
            }
        };
        if candidate == 0 || candidate as u32 + range as u32 > 65536 {
            continue;
        }
        if used.is_free(candidate, range) {
            return Ok(candidate);
        }
    }
    Err(PortError::NoFreePort {
        container_port,
        range: range as u32,
    }
    .into())
}

/// Merge the concrete host-port entries of one sorted bucket.
fn merge_concrete(
    entries: &[PortMapping],
    protocol: &str,
    used: &mut UsedPorts,
    out: &mut Vec<PortMapping>,
) -> SpecgenResult<()> {
    let mut acc: Option<PortMapping> = None;
    for cur in entries {
        let Some(prev) = acc.as_mut() else {
            acc = Some(cur.clone());
            continue;
        };

        if prev.host_end() >= cur.host_port as u32 {
            let host_offset = cur.host_port as i64 - prev.host_port as i64;
            let container_offset = cur.container_port as i64 - prev.container_port as i64;
            if host_offset == container_offset {
                let joined = (host_offset as u32 + cur.range as u32).max(prev.range as u32);
                prev.range = joined as u16;
                continue;
            }
            if prev.host_end() > cur.host_port as u32 {
                return Err(PortError::Conflict {
                    host_port: cur.host_port,
                    protocol: protocol.to_string(),
                }
                .into());
            }
        }

        if let Some(done) = acc.replace(cur.clone()) {
            used.claim(done.host_port, done.range);
            out.push(done);
        }
    }
    if let Some(done) = acc {
        used.claim(done.host_port, done.range);
        out.push(done);
    }
    Ok(())
}

/// Merge the host-port-0 entries of one bucket and give each result a host port.
///
/// Container ranges that overlap or touch are joined into one mapping.
fn merge_random(
    entries: &[PortMapping],
    picker: &dyn PortPicker,
    used: &mut UsedPorts,
    out: &mut Vec<PortMapping>,
) -> SpecgenResult<()> {
    let mut acc: Option<PortMapping> = None;
    let flush = |done: PortMapping, used: &mut UsedPorts| -> SpecgenResult<PortMapping> {
        let mut done = done;
        let host_port = random_host_port(picker, used, done.container_port, done.range)?;
        used.claim(host_port, done.range);
        tracing::debug!(
            container_port = done.container_port,
            host_port,
            range = done.range,
            protocol = %done.protocol,
            "assigned random host port"
        );
        done.host_port = host_port;
        Ok(done)
    };

    for cur in entries {
        if let Some(prev) = acc.as_mut() {
            if prev.container_end() >= cur.container_port as u32 {
                let end = prev.container_end().max(cur.container_end());
                prev.range = (end - prev.container_port as u32) as u16;
                continue;
            }
        }
        if let Some(done) = acc.replace(cur.clone()) {
            out.push(flush(done, used)?);
        }
    }
    if let Some(done) = acc {
        out.push(flush(done, used)?);
    }
    Ok(())
}

/// Validate, merge and allocate the port mappings of one container.
///
/// `exposed` maps container ports to protocols (image `EXPOSE` plus
/// `--expose`). Exposed ports are only published when `publish_all` is set,
/// and only when no requested mapping already covers them.
pub fn allocate_ports(
    requested: &[PortMapping],
    exposed: &BTreeMap<u16, Vec<String>>,
    publish_all: bool,
    picker: &dyn PortPicker,
) -> SpecgenResult<Vec<PortMapping>> {
    let mut buckets: BTreeMap<(String, String), Vec<PortMapping>> = BTreeMap::new();
    for mapping in requested {
        let range = validate(mapping)?;
        for protocol in parse_protocols(&mapping.protocol)? {
            let entry = PortMapping {
                host_ip: mapping.host_ip.clone(),
                host_port: mapping.host_port,
                container_port: mapping.container_port,
                protocol: protocol.clone(),
                range,
            };
            buckets
                .entry((mapping.host_ip.clone(), protocol))
                .or_default()
                .push(entry);
        }
    }

    let mut out = Vec::new();
    let mut used_by_bucket: BTreeMap<(String, String), UsedPorts> = BTreeMap::new();
    for (key, mut entries) in buckets {
        entries.sort_by(bucket_order);
        let split = entries
            .iter()
            .position(|m| m.host_port == 0)
            .unwrap_or(entries.len());
        let (concrete, random) = entries.split_at(split);

        let used = used_by_bucket.entry(key.clone()).or_default();
        merge_concrete(concrete, &key.1, used, &mut out)?;
        merge_random(random, picker, used, &mut out)?;
    }

    if publish_all {
        for (&port, protocols) in exposed {
            if port == 0 {
                return Err(PortError::invalid("exposed port number must be non-0").into());
            }
            for protocol in parse_protocols(&protocols.join(","))? {
                let covered = out
                    .iter()
                    .any(|m| m.protocol == protocol && m.covers_container_port(port));
                if covered {
                    continue;
                }
                let used = used_by_bucket
                    .entry((String::new(), protocol.clone()))
                    .or_default();
                let host_port = random_host_port(picker, used, port, 1)?;
                used.claim(host_port, 1);
                tracing::debug!(container_port = port, host_port, protocol = %protocol, "published exposed port");
                out.push(PortMapping {
                    host_ip: String::new(),
                    host_port,
                    container_port: port,
                    protocol,
                    range: 1,
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use specgen_shared::{ErrorKind, SpecgenError};
    use std::sync::atomic::{AtomicU16, Ordering as AtomicOrdering};

    /// Hands out 40000, 40001, ... in order.
    struct CountingPicker(AtomicU16);

    impl CountingPicker {
        fn new() -> Self {
            Self(AtomicU16::new(40000))
        }
    }

    impl PortPicker for CountingPicker {
        fn candidate(&self) -> SpecgenResult<u16> {
            Ok(self.0.fetch_add(1, AtomicOrdering::SeqCst))
        }
    }

    fn no_exposed() -> BTreeMap<u16, Vec<String>> {
        BTreeMap::new()
    }

    fn allocate(requested: &[PortMapping]) -> SpecgenResult<Vec<PortMapping>> {
        allocate_ports(requested, &no_exposed(), false, &CountingPicker::new())
    }

    #[test]
    fn test_adjacent_mappings_join() {
        let out = allocate(&[PortMapping::tcp(8080, 80), PortMapping::tcp(8081, 81)]).unwrap();
        assert_eq!(out, vec![PortMapping::tcp(8080, 80).with_range(2)]);
    }

    #[test]
    fn test_overlap_with_different_offset_conflicts() {
        let err = allocate(&[
            PortMapping::tcp(8080, 80).with_range(10),
            PortMapping::tcp(8081, 60),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictError);
        match err {
            SpecgenError::Port(PortError::Conflict { host_port, protocol }) => {
                assert_eq!(host_port, 8081);
                assert_eq!(protocol, "tcp");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_contiguous_with_different_offset_stays_separate() {
        let out = allocate(&[PortMapping::tcp(8080, 80), PortMapping::tcp(8081, 90)]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_duplicate_mapping_collapses() {
        let out = allocate(&[PortMapping::tcp(8080, 80), PortMapping::tcp(8080, 80)]).unwrap();
        assert_eq!(out, vec![PortMapping::tcp(8080, 80)]);
    }

    #[test]
    fn test_contained_range_keeps_larger() {
        let out = allocate(&[
            PortMapping::tcp(8080, 80).with_range(10),
            PortMapping::tcp(8082, 82).with_range(2),
        ])
        .unwrap();
        assert_eq!(out, vec![PortMapping::tcp(8080, 80).with_range(10)]);
    }

    #[test]
    fn test_multiple_protocols_split() {
        let out = allocate(&[PortMapping::tcp(53, 53).with_protocol("udp,tcp,udp")]).unwrap();
        let protocols: Vec<&str> = out.iter().map(|m| m.protocol.as_str()).collect();
        assert_eq!(protocols, vec!["tcp", "udp"]);
    }

    #[test]
    fn test_host_ip_separates_buckets() {
        let out = allocate(&[
            PortMapping::tcp(8080, 80).with_host_ip("127.0.0.1"),
            PortMapping::tcp(8080, 90).with_host_ip("10.0.0.1"),
        ])
        .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(allocate(&[PortMapping::tcp(80, 0)]).is_err());
        assert!(allocate(&[PortMapping::tcp(80, 65535).with_range(2)]).is_err());
        assert!(allocate(&[PortMapping::tcp(65535, 80).with_range(2)]).is_err());
        assert!(allocate(&[PortMapping::tcp(80, 80).with_protocol("icmp")]).is_err());
        assert!(allocate(&[PortMapping::tcp(80, 80).with_host_ip("not-an-ip")]).is_err());
    }

    #[test]
    fn test_random_neighbours_joined() {
        let out = allocate(&[PortMapping::tcp(0, 80), PortMapping::tcp(0, 81)]).unwrap();
        assert_eq!(out, vec![PortMapping::tcp(40000, 80).with_range(2)]);

        let out = allocate(&[
            PortMapping::tcp(0, 80).with_range(2),
            PortMapping::tcp(0, 82).with_range(2),
        ])
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].container_port, 80);
        assert_eq!(out[0].range, 4);
    }

    #[test]
    fn test_random_gap_stays_separate() {
        let out = allocate(&[PortMapping::tcp(0, 80), PortMapping::tcp(0, 82)]).unwrap();
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].host_port, out[1].host_port);
    }

    #[test]
    fn test_random_overlapping_joined() {
        let out = allocate(&[
            PortMapping::tcp(0, 80).with_range(3),
            PortMapping::tcp(0, 81),
            PortMapping::tcp(0, 82).with_range(10),
        ])
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].container_port, 80);
        assert_eq!(out[0].range, 12);
    }

    #[test]
    fn test_random_avoids_claimed_ports() {
        let out = allocate(&[PortMapping::tcp(40000, 80), PortMapping::tcp(0, 90)]).unwrap();
        assert_eq!(out[0].host_port, 40000);
        assert_eq!(out[1].host_port, 40001);
    }

    #[test]
    fn test_exhaustion() {
        let err = allocate_ports(
            &[PortMapping::tcp(0, 1).with_range(65535)],
            &no_exposed(),
            false,
            &RandomPortPicker,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);
        let message = err.to_string();
        assert!(message.contains("container port 1"));
        assert!(message.contains("range 65535"));
    }

    #[test]
    fn test_exposed_ports_need_publish_all() {
        let mut exposed = BTreeMap::new();
        exposed.insert(80, vec!["tcp".to_string()]);
        exposed.insert(443, vec!["tcp".to_string(), "udp".to_string()]);

        let requested = [PortMapping::tcp(8080, 80)];
        let picker = CountingPicker::new();

        let without = allocate_ports(&requested, &exposed, false, &picker).unwrap();
        assert_eq!(without.len(), 1);

        let with = allocate_ports(&requested, &exposed, true, &picker).unwrap();
        assert_eq!(with.len(), 3);
        assert!(with.iter().filter(|m| m.container_port == 80).count() == 1);
        assert!(with.iter().any(|m| m.container_port == 443 && m.protocol == "udp"));
    }

    fn mapping_strategy() -> impl Strategy<Value = PortMapping> {
        (0u16..40, 1u16..4).prop_map(|(offset, range)| {
            PortMapping::tcp(10000 + offset, 20000 + offset).with_range(range)
        })
    }

    fn coverage(mappings: &[PortMapping]) -> BTreeSet<(u32, u32)> {
        mappings
            .iter()
            .flat_map(|m| {
                (0..m.range as u32).map(move |i| (m.host_port as u32 + i, m.container_port as u32 + i))
            })
            .collect()
    }

    proptest! {
        #[test]
        fn coverage_is_order_independent(mut mappings in proptest::collection::vec(mapping_strategy(), 1..12)) {
            let forward = allocate(&mappings).unwrap();
            mappings.reverse();
            let backward = allocate(&mappings).unwrap();
            prop_assert_eq!(coverage(&forward), coverage(&backward));
            prop_assert_eq!(coverage(&forward), coverage(&mappings));
            prop_assert!(forward.iter().all(|m| m.range >= 1));
        }
    }
}

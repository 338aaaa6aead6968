//! `--publish` syntax: `[[ip:]hostport[-end]:]ctrport[-end][/proto]`.

use super::{PortMapping, parse_protocols};
use specgen_shared::{PortError, SpecgenResult};
use std::net::IpAddr;

fn parse_port(raw: &str, what: &str) -> SpecgenResult<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| PortError::invalid(format!("invalid {} port {:?}", what, raw)).into())
}

/// Parse `start[-end]` into a start port and a range length.
fn parse_range(raw: &str, what: &str) -> SpecgenResult<(u16, u16)> {
    match raw.split_once('-') {
        None => Ok((parse_port(raw, what)?, 1)),
        Some((start, end)) => {
            let start = parse_port(start, what)?;
            let end = parse_port(end, what)?;
            if end < start {
                return Err(PortError::invalid(format!(
                    "invalid {} port range {:?}: end is before start",
                    what, raw
                ))
                .into());
            }
            Ok((start, end - start + 1))
        }
    }
}

/// Split off a leading host IP; IPv6 addresses are bracketed.
fn split_host_ip(raw: &str) -> SpecgenResult<(String, &str)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let (ip, rest) = rest
            .split_once(']')
            .ok_or_else(|| PortError::invalid(format!("unterminated IPv6 address in {:?}", raw)))?;
        let rest = rest
            .strip_prefix(':')
            .ok_or_else(|| PortError::invalid(format!("missing port after host IP in {:?}", raw)))?;
        return Ok((ip.to_string(), rest));
    }

    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() == 3 {
        let ip_len = parts[0].len();
        return Ok((parts[0].to_string(), &raw[ip_len + 1..]));
    }
    if parts.len() > 3 {
        return Err(PortError::invalid(format!("invalid port format {:?}", raw)).into());
    }
    Ok((String::new(), raw))
}

/// Parse one `--publish` value.
///
/// A host port range must be as long as the container port range; a single
/// host port with a container range publishes consecutive host ports.
pub fn parse_port_spec(raw: &str) -> SpecgenResult<PortMapping> {
    let (ports, protocol) = match raw.split_once('/') {
        Some((p, proto)) => (p, proto),
        None => (raw, ""),
    };
    let protocol = parse_protocols(protocol)?.join(",");

    let (host_ip, rest) = split_host_ip(ports)?;
    if !host_ip.is_empty() && host_ip.parse::<IpAddr>().is_err() {
        return Err(PortError::invalid(format!("invalid host IP {:?}", host_ip)).into());
    }

    let (host, container) = match rest.split_once(':') {
        Some((h, c)) => (Some(h), c),
        None => (None, rest),
    };

    let (container_port, container_range) = parse_range(container, "container")?;
    let (host_port, host_range) = match host {
        Some(h) if !h.is_empty() => parse_range(h, "host")?,
        _ => (0, container_range),
    };

    if host_range != 1 && host_range != container_range {
        return Err(PortError::invalid(format!(
            "host and container port ranges differ in length in {:?}",
            raw
        ))
        .into());
    }

    Ok(PortMapping {
        host_ip,
        host_port,
        container_port,
        protocol,
        range: container_range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_only() {
        let m = parse_port_spec("80").unwrap();
        assert_eq!(m, PortMapping::tcp(0, 80));
    }

    #[test]
    fn test_host_and_container() {
        assert_eq!(parse_port_spec("8080:80").unwrap(), PortMapping::tcp(8080, 80));
        assert_eq!(
            parse_port_spec("8080:80/udp").unwrap(),
            PortMapping::tcp(8080, 80).with_protocol("udp")
        );
    }

    #[test]
    fn test_host_ip() {
        let m = parse_port_spec("127.0.0.1:8080:80").unwrap();
        assert_eq!(m.host_ip, "127.0.0.1");
        assert_eq!((m.host_port, m.container_port), (8080, 80));

        let m = parse_port_spec("127.0.0.1::80").unwrap();
        assert_eq!(m.host_port, 0);

        let m = parse_port_spec("[::1]:8080:80/tcp,udp").unwrap();
        assert_eq!(m.host_ip, "::1");
        assert_eq!(m.protocol, "tcp,udp");
    }

    #[test]
    fn test_ranges() {
        let m = parse_port_spec("8080-8082:80-82").unwrap();
        assert_eq!(m, PortMapping::tcp(8080, 80).with_range(3));

        let m = parse_port_spec("9000:80-81").unwrap();
        assert_eq!(m.range, 2);

        assert!(parse_port_spec("8080-8081:80-83").is_err());
        assert!(parse_port_spec("82-80").is_err());
    }

    #[test]
    fn test_invalid() {
        assert!(parse_port_spec("http").is_err());
        assert!(parse_port_spec("80/icmp").is_err());
        assert!(parse_port_spec("nonsense:8080:80").is_err());
        assert!(parse_port_spec("1:2:3:4").is_err());
    }
}

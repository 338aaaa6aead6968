//! Parsers for human-readable resource flags.

use specgen_shared::{ResourceError, SpecgenResult};

/// Parse a size with an optional binary unit suffix.
///
/// Accepts `1024`, `512k`, `64m`, `1.5g`, `2t`, with an optional trailing `b`
/// or `ib` (`64mb`, `64MiB`). Units are powers of 1024.
pub fn parse_size(field: &str, raw: &str) -> SpecgenResult<i64> {
    let lower = raw.trim().to_ascii_lowercase();
    let trimmed = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let (number, multiplier): (&str, f64) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024.0),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0 * 1024.0),
        Some('t') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0 * 1024.0 * 1024.0),
        _ => (trimmed, 1.0),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| ResourceError::parse(field, raw, "expected a size such as 512m or 1g"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ResourceError::parse(field, raw, "size must be a non-negative number").into());
    }
    let bytes = value * multiplier;
    if bytes > i64::MAX as f64 {
        return Err(ResourceError::parse(field, raw, "size is too large").into());
    }
    Ok(bytes as i64)
}

/// Parse a memory swap value, where `-1` means unlimited.
pub fn parse_swap(raw: &str) -> SpecgenResult<i64> {
    if raw.trim() == "-1" {
        return Ok(-1);
    }
    parse_size("memory-swap", raw)
}

/// Split `/dev/<path>:<value>`.
fn split_device<'a>(field: &str, raw: &'a str) -> SpecgenResult<(&'a str, &'a str)> {
    let (path, value) = raw
        .rsplit_once(':')
        .ok_or_else(|| ResourceError::parse(field, raw, "expected <device-path>:<value>"))?;
    if !path.starts_with("/dev/") {
        return Err(ResourceError::parse(field, raw, "device path must start with /dev/").into());
    }
    Ok((path, value))
}

/// `--blkio-weight-device /dev/sda:500`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightDevice {
    pub path: String,
    pub weight: u16,
}

/// Check a block I/O weight: 0 disables, otherwise 10 to 1000.
pub fn check_blkio_weight(weight: u16) -> SpecgenResult<()> {
    if weight > 0 && !(10..=1000).contains(&weight) {
        return Err(ResourceError::invalid_value("range of blkio weight is from 10 to 1000").into());
    }
    Ok(())
}

pub fn parse_weight_device(raw: &str) -> SpecgenResult<WeightDevice> {
    let (path, value) = split_device("blkio-weight-device", raw)?;
    let weight: u16 = value
        .parse()
        .map_err(|_| ResourceError::parse("blkio-weight-device", raw, "weight is not a number"))?;
    check_blkio_weight(weight)?;
    Ok(WeightDevice {
        path: path.to_string(),
        weight,
    })
}

/// `--device-read-bps /dev/sda:10mb` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleDevice {
    pub path: String,
    pub rate: u64,
}

/// Parse a bytes-per-second throttle; the rate accepts size suffixes.
pub fn parse_bps_device(field: &str, raw: &str) -> SpecgenResult<ThrottleDevice> {
    let (path, value) = split_device(field, raw)?;
    let rate = parse_size(field, value)?;
    Ok(ThrottleDevice {
        path: path.to_string(),
        rate: rate as u64,
    })
}

/// Parse an operations-per-second throttle.
pub fn parse_iops_device(field: &str, raw: &str) -> SpecgenResult<ThrottleDevice> {
    let (path, value) = split_device(field, raw)?;
    let rate: u64 = value
        .parse()
        .map_err(|_| ResourceError::parse(field, raw, "rate is not a number"))?;
    Ok(ThrottleDevice {
        path: path.to_string(),
        rate,
    })
}

/// `--cgroup-conf memory.high=1073741824`.
pub fn parse_cgroup_conf(raw: &str) -> SpecgenResult<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ResourceError::parse("cgroup-conf", raw, "expected KEY=VALUE").into()),
    }
}

/// `--cpus 1.5` as a quota over the default period.
pub fn parse_cpus(raw: &str) -> SpecgenResult<f64> {
    let cpus: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ResourceError::parse("cpus", raw, "expected a number of CPUs"))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(ResourceError::parse("cpus", raw, "must be greater than zero").into());
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("memory", "1024").unwrap(), 1024);
        assert_eq!(parse_size("memory", "512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("memory", "64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("memory", "64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("memory", "1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("memory", "1.5g").unwrap(), 3 << 29);
        assert_eq!(parse_size("memory", "10b").unwrap(), 10);
        assert!(parse_size("memory", "lots").is_err());
        assert!(parse_size("memory", "-5m").is_err());
    }

    #[test]
    fn test_parse_swap() {
        assert_eq!(parse_swap("-1").unwrap(), -1);
        assert_eq!(parse_swap("1g").unwrap(), 1 << 30);
    }

    #[test]
    fn test_weight_device() {
        assert_eq!(
            parse_weight_device("/dev/sda:500").unwrap(),
            WeightDevice {
                path: "/dev/sda".into(),
                weight: 500
            }
        );
        assert!(parse_weight_device("/dev/sda:5").is_err());
        assert!(parse_weight_device("/dev/sda:1500").is_err());
        assert!(parse_weight_device("sda:500").is_err());
        assert!(parse_weight_device("/dev/sda").is_err());
    }

    #[test]
    fn test_throttle_devices() {
        assert_eq!(parse_bps_device("device-read-bps", "/dev/sda:1mb").unwrap().rate, 1 << 20);
        assert_eq!(parse_iops_device("device-read-iops", "/dev/sda:1000").unwrap().rate, 1000);
        assert!(parse_iops_device("device-read-iops", "/dev/sda:1k").is_err());
    }

    #[test]
    fn test_cgroup_conf_and_cpus() {
        assert_eq!(
            parse_cgroup_conf("memory.high=1G").unwrap(),
            ("memory.high".to_string(), "1G".to_string())
        );
        assert!(parse_cgroup_conf("=1").is_err());
        assert_eq!(parse_cpus("1.5").unwrap(), 1.5);
        assert!(parse_cpus("0").is_err());
    }
}

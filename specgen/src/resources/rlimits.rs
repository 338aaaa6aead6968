//! POSIX rlimits from `--ulimit name=soft[:hard]`.

use oci_spec::runtime::{PosixRlimit, PosixRlimitBuilder, PosixRlimitType};
use serde::{Deserialize, Serialize};
use specgen_shared::constants::limits::DEFAULT_RLIMIT_MAX;
use specgen_shared::{ResourceError, SpecgenError, SpecgenResult};

/// Rlimit names understood by the OCI runtime spec, without the `RLIMIT_` prefix.
const RLIMIT_NAMES: &[&str] = &[
    "as", "core", "cpu", "data", "fsize", "locks", "memlock", "msgqueue", "nice", "nofile",
    "nproc", "rss", "rtprio", "rttime", "sigpending", "stack",
];

fn rlimit_type(name: &str) -> Option<PosixRlimitType> {
    let typ = match name {
        "as" => PosixRlimitType::RlimitAs,
        "core" => PosixRlimitType::RlimitCore,
        "cpu" => PosixRlimitType::RlimitCpu,
        "data" => PosixRlimitType::RlimitData,
        "fsize" => PosixRlimitType::RlimitFsize,
        "locks" => PosixRlimitType::RlimitLocks,
        "memlock" => PosixRlimitType::RlimitMemlock,
        "msgqueue" => PosixRlimitType::RlimitMsgqueue,
        "nice" => PosixRlimitType::RlimitNice,
        "nofile" => PosixRlimitType::RlimitNofile,
        "nproc" => PosixRlimitType::RlimitNproc,
        "rss" => PosixRlimitType::RlimitRss,
        "rtprio" => PosixRlimitType::RlimitRtprio,
        "rttime" => PosixRlimitType::RlimitRttime,
        "sigpending" => PosixRlimitType::RlimitSigpending,
        "stack" => PosixRlimitType::RlimitStack,
        _ => return None,
    };
    Some(typ)
}

/// One resource limit, keyed by its short lowercase name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    pub fn to_oci(&self) -> SpecgenResult<PosixRlimit> {
        let typ = rlimit_type(&self.name)
            .ok_or_else(|| ResourceError::parse("ulimit", &self.name, "unknown rlimit"))?;
        PosixRlimitBuilder::default()
            .typ(typ)
            .soft(self.soft)
            .hard(self.hard)
            .build()
            .map_err(|e| SpecgenError::Internal(format!("Failed to build rlimit: {}", e)))
    }
}

fn normalize_name(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    lower
        .strip_prefix("rlimit_")
        .map(str::to_string)
        .unwrap_or(lower)
}

fn parse_limit_value(raw: &str, whole: &str) -> SpecgenResult<u64> {
    match raw.trim() {
        "unlimited" | "-1" => Ok(u64::MAX),
        v => v
            .parse()
            .map_err(|_| ResourceError::parse("ulimit", whole, "limit is not a number").into()),
    }
}

/// Parse `name=soft[:hard]`. A missing hard limit equals the soft one.
pub fn parse_ulimit(raw: &str) -> SpecgenResult<Rlimit> {
    let (name, values) = raw
        .split_once('=')
        .ok_or_else(|| ResourceError::parse("ulimit", raw, "expected name=soft[:hard]"))?;
    let name = normalize_name(name);
    if !RLIMIT_NAMES.contains(&name.as_str()) {
        return Err(ResourceError::parse("ulimit", raw, "unknown rlimit").into());
    }

    let (soft, hard) = match values.split_once(':') {
        Some((s, h)) => (parse_limit_value(s, raw)?, parse_limit_value(h, raw)?),
        None => {
            let v = parse_limit_value(values, raw)?;
            (v, v)
        }
    };
    if soft > hard {
        return Err(ResourceError::invalid_value(format!(
            "ulimit soft limit must be less than or equal to hard limit: {} > {}",
            soft, hard
        ))
        .into());
    }

    Ok(Rlimit { name, soft, hard })
}

/// Merge user rlimits over engine defaults, adding the nofile/nproc
/// defaults for rootful containers.
///
/// Later entries with the same name replace earlier ones.
pub fn default_rlimits(
    engine_defaults: &[String],
    user: &[String],
    rootless: bool,
) -> SpecgenResult<Vec<Rlimit>> {
    let mut merged: Vec<Rlimit> = Vec::new();
    for raw in engine_defaults.iter().chain(user.iter()) {
        let limit = parse_ulimit(raw)?;
        match merged.iter_mut().find(|r| r.name == limit.name) {
            Some(existing) => *existing = limit,
            None => merged.push(limit),
        }
    }

    if !rootless {
        for name in ["nofile", "nproc"] {
            if !merged.iter().any(|r| r.name == name) {
                merged.push(Rlimit {
                    name: name.to_string(),
                    soft: DEFAULT_RLIMIT_MAX,
                    hard: DEFAULT_RLIMIT_MAX,
                });
            }
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ulimit() {
        assert_eq!(
            parse_ulimit("nofile=1024:2048").unwrap(),
            Rlimit {
                name: "nofile".into(),
                soft: 1024,
                hard: 2048
            }
        );
        let core = parse_ulimit("RLIMIT_CORE=unlimited").unwrap();
        assert_eq!(core.name, "core");
        assert_eq!(core.soft, u64::MAX);
        assert!(parse_ulimit("nofile=2048:1024").is_err());
        assert!(parse_ulimit("bogus=1").is_err());
        assert!(parse_ulimit("nofile").is_err());
    }

    #[test]
    fn test_every_name_maps_to_oci() {
        for name in RLIMIT_NAMES {
            assert!(rlimit_type(name).is_some(), "{}", name);
        }
    }

    #[test]
    fn test_defaults_rootful() {
        let limits = default_rlimits(&[], &["nofile=1024".to_string()], false).unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].soft, 1024);
        assert_eq!(limits[1].name, "nproc");
        assert_eq!(limits[1].hard, DEFAULT_RLIMIT_MAX);
    }

    #[test]
    fn test_defaults_rootless_and_override() {
        let limits = default_rlimits(
            &["nofile=4096".to_string()],
            &["nofile=8192".to_string()],
            true,
        )
        .unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].soft, 8192);
        assert!(limits[0].to_oci().is_ok());
    }
}

//! Resource limit translation.
//!
//! Raw flags go through three stages:
//!
//! 1. [`translate`]: parse and check value ranges and relationships. Pure,
//!    fails fast.
//! 2. [`verify`]: drop every limit the host cannot enforce, with a warning.
//! 3. [`ResourceLimits::to_oci`]: resolve device paths and build the OCI
//!    `LinuxResources` section.
//!
//! Each category is optional as a whole, so "not requested" and "dropped by
//! verification" are both `None` rather than a half-filled struct.

pub mod parse;
pub mod rlimits;
pub mod verify;

pub use parse::{ThrottleDevice, WeightDevice};
pub use rlimits::{Rlimit, default_rlimits, parse_ulimit};
pub use verify::verify;

use crate::host::{CgroupVersion, HostIntrospector};
use oci_spec::runtime::{
    LinuxBlockIoBuilder, LinuxCpuBuilder, LinuxDeviceCgroup, LinuxMemoryBuilder,
    LinuxPidsBuilder, LinuxResources, LinuxResourcesBuilder, LinuxThrottleDevice,
    LinuxThrottleDeviceBuilder, LinuxWeightDeviceBuilder,
};
use serde::{Deserialize, Serialize};
use specgen_shared::constants::limits::{DEFAULT_CPU_PERIOD, MIN_MEMORY};
use specgen_shared::{ResourceError, SpecgenError, SpecgenResult};
use std::collections::BTreeMap;
use std::path::Path;

/// Resource flags as the user typed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceFlags {
    pub memory: Option<String>,
    pub memory_reservation: Option<String>,
    /// `-1` for unlimited swap.
    pub memory_swap: Option<String>,
    pub memory_swappiness: Option<i64>,
    pub oom_kill_disable: bool,
    /// Fractional CPUs, converted to a CFS quota.
    pub cpus: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_rt_period: Option<u64>,
    pub cpu_rt_runtime: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub blkio_weight: Option<u16>,
    pub blkio_weight_device: Vec<String>,
    pub device_read_bps: Vec<String>,
    pub device_write_bps: Vec<String>,
    pub device_read_iops: Vec<String>,
    pub device_write_iops: Vec<String>,
    pub pids_limit: Option<i64>,
    /// `KEY=VALUE` entries for the unified (v2) hierarchy.
    pub cgroup_conf: Vec<String>,
    /// `name=soft[:hard]`.
    pub ulimit: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLimits {
    pub limit: Option<i64>,
    pub reservation: Option<i64>,
    pub swap: Option<i64>,
    pub swappiness: Option<u64>,
    pub disable_oom_killer: bool,
}

impl MemoryLimits {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuLimits {
    pub shares: Option<u64>,
    pub period: Option<u64>,
    pub quota: Option<i64>,
    pub realtime_period: Option<u64>,
    pub realtime_runtime: Option<i64>,
    pub cpus: Option<String>,
    pub mems: Option<String>,
}

impl CpuLimits {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockIoLimits {
    pub weight: Option<u16>,
    pub weight_device: Vec<WeightDevice>,
    pub read_bps: Vec<ThrottleDevice>,
    pub write_bps: Vec<ThrottleDevice>,
    pub read_iops: Vec<ThrottleDevice>,
    pub write_iops: Vec<ThrottleDevice>,
}

impl BlockIoLimits {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Validated resource limits, one optional value per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: Option<MemoryLimits>,
    pub cpu: Option<CpuLimits>,
    pub block_io: Option<BlockIoLimits>,
    pub pids: Option<i64>,
    pub unified: BTreeMap<String, String>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none()
            && self.cpu.is_none()
            && self.block_io.is_none()
            && self.pids.is_none()
            && self.unified.is_empty()
    }

    /// Build the OCI resources section.
    ///
    /// Block I/O device paths are resolved to major:minor here, so a missing
    /// device fails only once the rest of the request is known to be valid.
    pub fn to_oci(
        &self,
        host: &dyn HostIntrospector,
        devices: Vec<LinuxDeviceCgroup>,
    ) -> SpecgenResult<LinuxResources> {
        let mut builder = LinuxResourcesBuilder::default().devices(devices);

        if let Some(memory) = &self.memory {
            let mut mb = LinuxMemoryBuilder::default();
            if let Some(limit) = memory.limit {
                mb = mb.limit(limit);
            }
            if let Some(reservation) = memory.reservation {
                mb = mb.reservation(reservation);
            }
            if let Some(swap) = memory.swap {
                mb = mb.swap(swap);
            }
            if let Some(swappiness) = memory.swappiness {
                mb = mb.swappiness(swappiness);
            }
            if memory.disable_oom_killer {
                mb = mb.disable_oom_killer(true);
            }
            builder = builder.memory(mb.build().map_err(internal("memory"))?);
        }

        if let Some(cpu) = &self.cpu {
            let mut cb = LinuxCpuBuilder::default();
            if let Some(shares) = cpu.shares {
                cb = cb.shares(shares);
            }
            if let Some(period) = cpu.period {
                cb = cb.period(period);
            }
            if let Some(quota) = cpu.quota {
                cb = cb.quota(quota);
            }
            if let Some(rt_period) = cpu.realtime_period {
                cb = cb.realtime_period(rt_period);
            }
            if let Some(rt_runtime) = cpu.realtime_runtime {
                cb = cb.realtime_runtime(rt_runtime);
            }
            if let Some(cpus) = &cpu.cpus {
                cb = cb.cpus(cpus.clone());
            }
            if let Some(mems) = &cpu.mems {
                cb = cb.mems(mems.clone());
            }
            builder = builder.cpu(cb.build().map_err(internal("cpu"))?);
        }

        if let Some(blkio) = &self.block_io {
            let mut bb = LinuxBlockIoBuilder::default();
            if let Some(weight) = blkio.weight {
                bb = bb.weight(weight);
            }
            if !blkio.weight_device.is_empty() {
                let mut devices = Vec::new();
                for wd in &blkio.weight_device {
                    let dev = host.stat_device(Path::new(&wd.path))?;
                    devices.push(
                        LinuxWeightDeviceBuilder::default()
                            .major(dev.major)
                            .minor(dev.minor)
                            .weight(wd.weight)
                            .build()
                            .map_err(internal("weight device"))?,
                    );
                }
                bb = bb.weight_device(devices);
            }
            if !blkio.read_bps.is_empty() {
                bb = bb.throttle_read_bps_device(throttle(host, &blkio.read_bps)?);
            }
            if !blkio.write_bps.is_empty() {
                bb = bb.throttle_write_bps_device(throttle(host, &blkio.write_bps)?);
            }
            if !blkio.read_iops.is_empty() {
                bb = bb.throttle_read_iops_device(throttle(host, &blkio.read_iops)?);
            }
            if !blkio.write_iops.is_empty() {
                bb = bb.throttle_write_iops_device(throttle(host, &blkio.write_iops)?);
            }
            builder = builder.block_io(bb.build().map_err(internal("block io"))?);
        }

        if let Some(limit) = self.pids {
            builder = builder.pids(
                LinuxPidsBuilder::default()
                    .limit(limit)
                    .build()
                    .map_err(internal("pids"))?,
            );
        }

        if !self.unified.is_empty() {
            builder = builder.unified(
                self.unified
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<std::collections::HashMap<_, _>>(),
            );
        }

        builder.build().map_err(internal("resources"))
    }
}

fn internal<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> SpecgenError {
    move |e| SpecgenError::Internal(format!("Failed to build {} resources: {}", what, e))
}

fn throttle(
    host: &dyn HostIntrospector,
    devices: &[ThrottleDevice],
) -> SpecgenResult<Vec<LinuxThrottleDevice>> {
    devices
        .iter()
        .map(|td| {
            let dev = host.stat_device(Path::new(&td.path))?;
            LinuxThrottleDeviceBuilder::default()
                .major(dev.major)
                .minor(dev.minor)
                .rate(td.rate)
                .build()
                .map_err(internal("throttle device"))
        })
        .collect()
}

fn parse_all<T>(
    raw: &[String],
    parse: impl Fn(&str) -> SpecgenResult<T>,
) -> SpecgenResult<Vec<T>> {
    raw.iter().map(|r| parse(r)).collect()
}

fn translate_memory(flags: &ResourceFlags) -> SpecgenResult<Option<MemoryLimits>> {
    let mut memory = MemoryLimits {
        disable_oom_killer: flags.oom_kill_disable,
        ..Default::default()
    };

    if let Some(raw) = &flags.memory {
        let limit = parse::parse_size("memory", raw)?;
        if limit > 0 && limit < MIN_MEMORY {
            return Err(ResourceError::invalid_value("minimum memory limit allowed is 6MB").into());
        }
        memory.limit = Some(limit).filter(|l| *l > 0);
    }
    if let Some(raw) = &flags.memory_reservation {
        let reservation = parse::parse_size("memory-reservation", raw)?;
        if reservation > 0 && reservation < MIN_MEMORY {
            return Err(ResourceError::invalid_value(
                "minimum memory reservation allowed is 6MB",
            )
            .into());
        }
        memory.reservation = Some(reservation).filter(|r| *r > 0);
    }
    if let Some(raw) = &flags.memory_swap {
        memory.swap = Some(parse::parse_swap(raw)?);
    }
    if let Some(swappiness) = flags.memory_swappiness {
        if swappiness != -1 {
            if !(0..=100).contains(&swappiness) {
                return Err(ResourceError::invalid_value(format!(
                    "invalid value: {}, valid memory swappiness range is 0-100",
                    swappiness
                ))
                .into());
            }
            memory.swappiness = Some(swappiness as u64);
        }
    }

    match (memory.limit, memory.swap) {
        (None, Some(swap)) if swap > 0 => {
            return Err(ResourceError::inconsistent(
                "you should always set the memory limit when using memoryswap limit",
            )
            .into());
        }
        (Some(limit), Some(swap)) if swap > 0 && swap < limit => {
            return Err(ResourceError::inconsistent(
                "minimum memoryswap limit should be larger than memory limit, see usage",
            )
            .into());
        }
        _ => {}
    }
    if let (Some(limit), Some(reservation)) = (memory.limit, memory.reservation) {
        if limit < reservation {
            return Err(ResourceError::inconsistent(
                "minimum memory limit cannot be less than memory reservation limit, see usage",
            )
            .into());
        }
    }

    Ok(Some(memory).filter(|m| !m.is_empty()))
}

fn translate_cpu(flags: &ResourceFlags) -> SpecgenResult<Option<CpuLimits>> {
    let mut cpu = CpuLimits {
        shares: flags.cpu_shares.filter(|s| *s > 0),
        period: flags.cpu_period.filter(|p| *p > 0),
        quota: flags.cpu_quota.filter(|q| *q != 0),
        realtime_period: flags.cpu_rt_period.filter(|p| *p > 0),
        realtime_runtime: flags.cpu_rt_runtime.filter(|r| *r != 0),
        cpus: flags.cpuset_cpus.clone().filter(|s| !s.is_empty()),
        mems: flags.cpuset_mems.clone().filter(|s| !s.is_empty()),
    };

    if let Some(raw) = &flags.cpus {
        if cpu.period.is_some() || cpu.quota.is_some() {
            return Err(SpecgenError::invalid_config(
                "--cpus and --cpu-period/--cpu-quota cannot be set together",
            ));
        }
        let cpus = parse::parse_cpus(raw)?;
        cpu.period = Some(DEFAULT_CPU_PERIOD);
        cpu.quota = Some((cpus * DEFAULT_CPU_PERIOD as f64) as i64);
    }

    if let Some(period) = cpu.period {
        if !(1000..=1_000_000).contains(&period) {
            return Err(ResourceError::invalid_value(
                "CPU cfs period cannot be less than 1ms (i.e. 1000) or larger than 1s (i.e. 1000000)",
            )
            .into());
        }
    }
    if let Some(quota) = cpu.quota {
        if quota > 0 && quota < 1000 {
            return Err(
                ResourceError::invalid_value("CPU cfs quota cannot be less than 1ms (i.e. 1000)").into(),
            );
        }
    }

    Ok(Some(cpu).filter(|c| !c.is_empty()))
}

fn translate_block_io(flags: &ResourceFlags) -> SpecgenResult<Option<BlockIoLimits>> {
    if let Some(weight) = flags.blkio_weight {
        parse::check_blkio_weight(weight)?;
    }
    let blkio = BlockIoLimits {
        weight: flags.blkio_weight.filter(|w| *w > 0),
        weight_device: parse_all(&flags.blkio_weight_device, parse::parse_weight_device)?,
        read_bps: parse_all(&flags.device_read_bps, |r| {
            parse::parse_bps_device("device-read-bps", r)
        })?,
        write_bps: parse_all(&flags.device_write_bps, |r| {
            parse::parse_bps_device("device-write-bps", r)
        })?,
        read_iops: parse_all(&flags.device_read_iops, |r| {
            parse::parse_iops_device("device-read-iops", r)
        })?,
        write_iops: parse_all(&flags.device_write_iops, |r| {
            parse::parse_iops_device("device-write-iops", r)
        })?,
    };
    Ok(Some(blkio).filter(|b| !b.is_empty()))
}

/// Parse resource flags and check every hard constraint.
///
/// Runs without touching the host. `version` is only consulted to reject
/// unified entries on a v1 hierarchy.
pub fn translate(flags: &ResourceFlags, version: CgroupVersion) -> SpecgenResult<ResourceLimits> {
    let mut unified = BTreeMap::new();
    for raw in &flags.cgroup_conf {
        let (key, value) = parse::parse_cgroup_conf(raw)?;
        unified.insert(key, value);
    }
    if !unified.is_empty() && version == CgroupVersion::V1 {
        return Err(SpecgenError::invalid_config(
            "cgroup-conf entries are only supported on cgroup v2",
        ));
    }

    Ok(ResourceLimits {
        memory: translate_memory(flags)?,
        cpu: translate_cpu(flags)?,
        block_io: translate_block_io(flags)?,
        pids: flags.pids_limit.map(|p| if p <= 0 { -1 } else { p }),
        unified,
    })
}

/// Translated limits plus the warnings produced while verifying them.
#[derive(Debug, Clone, Default)]
pub struct Translated {
    pub limits: ResourceLimits,
    pub warnings: Vec<String>,
}

/// Translate and verify against the host in one call.
pub struct ResourceTranslator<'a> {
    host: &'a dyn HostIntrospector,
}

impl<'a> ResourceTranslator<'a> {
    pub fn new(host: &'a dyn HostIntrospector) -> Self {
        Self { host }
    }

    pub fn translate(&self, flags: &ResourceFlags) -> SpecgenResult<Translated> {
        let version = self.host.cgroup_version()?;
        let limits = translate(flags, version)?;
        let features = self.host.cgroup_features()?;
        let (limits, warnings) = verify(limits, version, &features)?;
        Ok(Translated { limits, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgen_shared::ErrorKind;

    fn flags() -> ResourceFlags {
        ResourceFlags::default()
    }

    #[test]
    fn test_empty_flags() {
        let limits = translate(&flags(), CgroupVersion::V2).unwrap();
        assert!(limits.is_empty());
    }

    #[test]
    fn test_memory_limit() {
        let f = ResourceFlags {
            memory: Some("512m".into()),
            memory_reservation: Some("256m".into()),
            ..flags()
        };
        let memory = translate(&f, CgroupVersion::V2).unwrap().memory.unwrap();
        assert_eq!(memory.limit, Some(512 << 20));
        assert_eq!(memory.reservation, Some(256 << 20));
        assert_eq!(memory.swap, None);
    }

    #[test]
    fn test_memory_minimum() {
        let f = ResourceFlags {
            memory: Some("4m".into()),
            ..flags()
        };
        let err = translate(&f, CgroupVersion::V2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_swap_rules() {
        let swap_only = ResourceFlags {
            memory_swap: Some("1g".into()),
            ..flags()
        };
        assert!(translate(&swap_only, CgroupVersion::V2)
            .unwrap_err()
            .to_string()
            .contains("always set the memory limit"));

        let swap_too_small = ResourceFlags {
            memory: Some("1g".into()),
            memory_swap: Some("512m".into()),
            ..flags()
        };
        assert!(translate(&swap_too_small, CgroupVersion::V2).is_err());

        let unlimited = ResourceFlags {
            memory_swap: Some("-1".into()),
            ..flags()
        };
        assert_eq!(
            translate(&unlimited, CgroupVersion::V2).unwrap().memory.unwrap().swap,
            Some(-1)
        );
    }

    #[test]
    fn test_reservation_above_limit() {
        let f = ResourceFlags {
            memory: Some("128m".into()),
            memory_reservation: Some("256m".into()),
            ..flags()
        };
        assert!(translate(&f, CgroupVersion::V2).is_err());
    }

    #[test]
    fn test_swappiness_range() {
        let f = ResourceFlags {
            memory_swappiness: Some(101),
            ..flags()
        };
        assert!(translate(&f, CgroupVersion::V1).is_err());
        let f = ResourceFlags {
            memory_swappiness: Some(-1),
            ..flags()
        };
        assert!(translate(&f, CgroupVersion::V1).unwrap().memory.is_none());
    }

    #[test]
    fn test_cpus_to_quota() {
        let f = ResourceFlags {
            cpus: Some("1.5".into()),
            ..flags()
        };
        let cpu = translate(&f, CgroupVersion::V2).unwrap().cpu.unwrap();
        assert_eq!(cpu.period, Some(100_000));
        assert_eq!(cpu.quota, Some(150_000));

        let both = ResourceFlags {
            cpus: Some("1".into()),
            cpu_quota: Some(50_000),
            ..flags()
        };
        assert_eq!(
            translate(&both, CgroupVersion::V2).unwrap_err().kind(),
            ErrorKind::InvalidConfig
        );
    }

    #[test]
    fn test_cpu_period_and_quota_ranges() {
        let f = ResourceFlags {
            cpu_period: Some(500),
            ..flags()
        };
        assert!(translate(&f, CgroupVersion::V2).is_err());
        let f = ResourceFlags {
            cpu_quota: Some(999),
            ..flags()
        };
        assert!(translate(&f, CgroupVersion::V2).is_err());
        let f = ResourceFlags {
            cpu_quota: Some(-1),
            ..flags()
        };
        assert_eq!(translate(&f, CgroupVersion::V2).unwrap().cpu.unwrap().quota, Some(-1));
    }

    #[test]
    fn test_blkio_weight() {
        for (weight, ok) in [(0u16, true), (10, true), (1000, true), (5, false), (1500, false)] {
            let f = ResourceFlags {
                blkio_weight: Some(weight),
                ..flags()
            };
            assert_eq!(translate(&f, CgroupVersion::V2).is_ok(), ok, "weight {}", weight);
        }
    }

    #[test]
    fn test_weight_device_validation() {
        let f = ResourceFlags {
            blkio_weight_device: vec!["/dev/sda:500".into()],
            ..flags()
        };
        let blkio = translate(&f, CgroupVersion::V2).unwrap().block_io.unwrap();
        assert_eq!(blkio.weight_device[0].weight, 500);

        for bad in ["/dev/sda:5", "/dev/sda:1500"] {
            let f = ResourceFlags {
                blkio_weight_device: vec![bad.into()],
                ..flags()
            };
            assert!(translate(&f, CgroupVersion::V2).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_unified_rejected_on_v1() {
        let f = ResourceFlags {
            cgroup_conf: vec!["memory.high=1073741824".into()],
            ..flags()
        };
        assert_eq!(translate(&f, CgroupVersion::V2).unwrap().unified.len(), 1);
        assert_eq!(
            translate(&f, CgroupVersion::V1).unwrap_err().kind(),
            ErrorKind::InvalidConfig
        );
    }

    #[test]
    fn test_pids_limit() {
        let f = ResourceFlags {
            pids_limit: Some(0),
            ..flags()
        };
        assert_eq!(translate(&f, CgroupVersion::V2).unwrap().pids, Some(-1));
    }
}

//! Host feasibility pass for translated resource limits.
//!
//! Limits the host cannot enforce are removed and reported as warnings. The
//! only hard failure here is a cpuset naming CPUs or memory nodes the host
//! does not have.

use super::{BlockIoLimits, CpuLimits, MemoryLimits, ResourceLimits};
use crate::host::{CgroupFeatures, CgroupVersion};
use specgen_shared::{ResourceError, SpecgenResult};
use std::collections::BTreeSet;

fn discard(warnings: &mut Vec<String>, what: &str) {
    let warning = format!(
        "Your kernel does not support {} or the cgroup is not mounted. Limitation discarded.",
        what
    );
    tracing::warn!(limit = %what, "{}", warning);
    warnings.push(warning);
}

/// Clear `field` with a warning unless `supported`.
macro_rules! require {
    ($warnings:expr, $supported:expr, $field:expr, $what:expr) => {
        if $field.is_some() && !$supported {
            discard($warnings, $what);
            $field = None;
        }
    };
}

fn verify_memory(
    mut memory: MemoryLimits,
    features: &CgroupFeatures,
    warnings: &mut Vec<String>,
) -> Option<MemoryLimits> {
    require!(warnings, features.memory_limit, memory.limit, "memory limit capabilities");
    // swap only makes sense on top of a memory limit
    if memory.limit.is_none() && memory.swap.is_some_and(|s| s > 0) {
        let warning = "Swap limit requires a memory limit. Swap limit discarded.".to_string();
        tracing::warn!("{}", warning);
        warnings.push(warning);
        memory.swap = None;
    }
    require!(warnings, features.swap_limit, memory.swap, "swap limit capabilities");
    require!(
        warnings,
        features.memory_reservation,
        memory.reservation,
        "memory soft limit capabilities"
    );
    require!(
        warnings,
        features.memory_swappiness,
        memory.swappiness,
        "memory swappiness capabilities"
    );
    if memory.disable_oom_killer && !features.oom_kill_disable {
        discard(warnings, "oom kill disable capabilities");
        memory.disable_oom_killer = false;
    }

    if let (Some(limit), None) = (memory.limit, memory.swap) {
        if features.swap_limit {
            memory.swap = Some(limit.saturating_mul(2));
        }
    }

    Some(memory).filter(|m| !m.is_empty())
}

/// Highest CPU or memory node index a cpuset may name, exclusive.
const CPUSET_INDEX_LIMIT: u32 = 8192;

/// Expand a cpuset list (`0-3,6`) into its members.
pub fn parse_cpuset(list: &str) -> SpecgenResult<BTreeSet<u32>> {
    let mut members = BTreeSet::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bad = || ResourceError::parse("cpuset", list, "expected a list such as 0-3,6");
        let out_of_range = || {
            ResourceError::parse(
                "cpuset",
                list,
                format!("indexes must be below {}", CPUSET_INDEX_LIMIT),
            )
        };
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.parse().map_err(|_| bad())?;
                let end: u32 = end.parse().map_err(|_| bad())?;
                if end < start {
                    return Err(bad().into());
                }
                if end >= CPUSET_INDEX_LIMIT {
                    return Err(out_of_range().into());
                }
                members.extend(start..=end);
            }
            None => {
                let index: u32 = part.parse().map_err(|_| bad())?;
                if index >= CPUSET_INDEX_LIMIT {
                    return Err(out_of_range().into());
                }
                members.insert(index);
            }
        }
    }
    Ok(members)
}

fn check_cpuset(requested: &str, available: Option<&str>, what: &str) -> SpecgenResult<()> {
    let wanted = parse_cpuset(requested)?;
    let Some(available) = available else {
        return Ok(());
    };
    let have = parse_cpuset(available)?;
    if !wanted.is_subset(&have) {
        return Err(ResourceError::invalid_value(format!(
            "requested {} are not available - requested {}, available: {}",
            what, requested, available
        ))
        .into());
    }
    Ok(())
}

fn verify_cpu(
    mut cpu: CpuLimits,
    version: CgroupVersion,
    features: &CgroupFeatures,
    warnings: &mut Vec<String>,
) -> SpecgenResult<Option<CpuLimits>> {
    require!(warnings, features.cpu_shares, cpu.shares, "CPU shares");
    require!(warnings, features.cpu_cfs_period, cpu.period, "CPU cfs period");
    require!(warnings, features.cpu_cfs_quota, cpu.quota, "CPU cfs quota");

    if version == CgroupVersion::V2 {
        if cpu.realtime_period.take().is_some() {
            let warning = "Realtime period not supported on cgroups V2 systems".to_string();
            tracing::warn!("{}", warning);
            warnings.push(warning);
        }
        if cpu.realtime_runtime.take().is_some() {
            let warning = "Realtime runtime not supported on cgroups V2 systems".to_string();
            tracing::warn!("{}", warning);
            warnings.push(warning);
        }
    } else {
        require!(warnings, features.cpu_realtime, cpu.realtime_period, "CPU realtime period");
        require!(warnings, features.cpu_realtime, cpu.realtime_runtime, "CPU realtime runtime");
    }

    if (cpu.cpus.is_some() || cpu.mems.is_some()) && !features.cpuset {
        discard(warnings, "cpuset");
        cpu.cpus = None;
        cpu.mems = None;
    }
    if let Some(cpus) = &cpu.cpus {
        check_cpuset(cpus, features.cpus.as_deref(), "CPUs")?;
    }
    if let Some(mems) = &cpu.mems {
        check_cpuset(mems, features.mems.as_deref(), "memory nodes")?;
    }

    Ok(Some(cpu).filter(|c| !c.is_empty()))
}

fn verify_block_io(
    mut blkio: BlockIoLimits,
    features: &CgroupFeatures,
    warnings: &mut Vec<String>,
) -> Option<BlockIoLimits> {
    require!(warnings, features.blkio_weight, blkio.weight, "Block I/O weight");

    let lists = [
        (features.blkio_weight_device, !blkio.weight_device.is_empty(), "Block I/O weight_device"),
        (features.blkio_read_bps_device, !blkio.read_bps.is_empty(), "BPS Block I/O for read"),
        (features.blkio_write_bps_device, !blkio.write_bps.is_empty(), "BPS Block I/O for write"),
        (features.blkio_read_iops_device, !blkio.read_iops.is_empty(), "IOPS Block I/O for read"),
        (features.blkio_write_iops_device, !blkio.write_iops.is_empty(), "IOPS Block I/O for write"),
    ];
    for (index, (supported, present, what)) in lists.into_iter().enumerate() {
        if present && !supported {
            discard(warnings, what);
            match index {
                0 => blkio.weight_device.clear(),
                1 => blkio.read_bps.clear(),
                2 => blkio.write_bps.clear(),
                3 => blkio.read_iops.clear(),
                _ => blkio.write_iops.clear(),
            }
        }
    }

    Some(blkio).filter(|b| !b.is_empty())
}

/// Drop every limit the host cannot enforce.
///
/// Returns the surviving limits and one warning per dropped limit.
pub fn verify(
    limits: ResourceLimits,
    version: CgroupVersion,
    features: &CgroupFeatures,
) -> SpecgenResult<(ResourceLimits, Vec<String>)> {
    let mut warnings = Vec::new();

    let memory = limits
        .memory
        .and_then(|m| verify_memory(m, features, &mut warnings));
    let cpu = match limits.cpu {
        Some(c) => verify_cpu(c, version, features, &mut warnings)?,
        None => None,
    };
    let block_io = limits
        .block_io
        .and_then(|b| verify_block_io(b, features, &mut warnings));

    let mut pids = limits.pids;
    require!(&mut warnings, features.pids_limit, pids, "pids limit capabilities");

    Ok((
        ResourceLimits {
            memory,
            cpu,
            block_io,
            pids,
            unified: limits.unified,
        },
        warnings,
    ))
}

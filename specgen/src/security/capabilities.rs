//! Linux capabilities
//!
//! Name table for the 41 capabilities known to the OCI runtime spec, plus the
//! add/drop merge used for every container.

use oci_spec::runtime::Capability;
use specgen_shared::constants::capabilities::ALL;
use specgen_shared::{SecurityError, SpecgenError, SpecgenResult};
use std::collections::{BTreeSet, HashSet};

/// Canonical `CAP_*` name of each capability, in kernel order.
pub const CAPABILITIES: &[(&str, Capability)] = &[
    // File operations (CAP 0-4)
    ("CAP_CHOWN", Capability::Chown),
    ("CAP_DAC_OVERRIDE", Capability::DacOverride),
    ("CAP_DAC_READ_SEARCH", Capability::DacReadSearch),
    ("CAP_FOWNER", Capability::Fowner),
    ("CAP_FSETID", Capability::Fsetid),
    // Process capabilities (CAP 5-9)
    ("CAP_KILL", Capability::Kill),
    ("CAP_SETGID", Capability::Setgid),
    ("CAP_SETUID", Capability::Setuid),
    ("CAP_SETPCAP", Capability::Setpcap),
    ("CAP_LINUX_IMMUTABLE", Capability::LinuxImmutable),
    // Network capabilities (CAP 10-13)
    ("CAP_NET_BIND_SERVICE", Capability::NetBindService),
    ("CAP_NET_BROADCAST", Capability::NetBroadcast),
    ("CAP_NET_ADMIN", Capability::NetAdmin),
    ("CAP_NET_RAW", Capability::NetRaw),
    // IPC capabilities (CAP 14-15)
    ("CAP_IPC_LOCK", Capability::IpcLock),
    ("CAP_IPC_OWNER", Capability::IpcOwner),
    // System operations (CAP 16-26)
    ("CAP_SYS_MODULE", Capability::SysModule),
    ("CAP_SYS_RAWIO", Capability::SysRawio),
    ("CAP_SYS_CHROOT", Capability::SysChroot),
    ("CAP_SYS_PTRACE", Capability::SysPtrace),
    ("CAP_SYS_PACCT", Capability::SysPacct),
    ("CAP_SYS_ADMIN", Capability::SysAdmin),
    ("CAP_SYS_BOOT", Capability::SysBoot),
    ("CAP_SYS_NICE", Capability::SysNice),
    ("CAP_SYS_RESOURCE", Capability::SysResource),
    ("CAP_SYS_TIME", Capability::SysTime),
    ("CAP_SYS_TTY_CONFIG", Capability::SysTtyConfig),
    // Device operations (CAP 27)
    ("CAP_MKNOD", Capability::Mknod),
    // File leases (CAP 28)
    ("CAP_LEASE", Capability::Lease),
    // Audit capabilities (CAP 29-30)
    ("CAP_AUDIT_WRITE", Capability::AuditWrite),
    ("CAP_AUDIT_CONTROL", Capability::AuditControl),
    // Filesystem capabilities (CAP 31)
    ("CAP_SETFCAP", Capability::Setfcap),
    // MAC (CAP 32-33)
    ("CAP_MAC_OVERRIDE", Capability::MacOverride),
    ("CAP_MAC_ADMIN", Capability::MacAdmin),
    // Modern capabilities (CAP 34-40)
    ("CAP_SYSLOG", Capability::Syslog),
    ("CAP_WAKE_ALARM", Capability::WakeAlarm),
    ("CAP_BLOCK_SUSPEND", Capability::BlockSuspend),
    ("CAP_AUDIT_READ", Capability::AuditRead),
    ("CAP_PERFMON", Capability::Perfmon),
    ("CAP_BPF", Capability::Bpf),
    ("CAP_CHECKPOINT_RESTORE", Capability::CheckpointRestore),
];

/// Every capability name in the table.
pub fn all_capability_names() -> Vec<String> {
    CAPABILITIES.iter().map(|(n, _)| n.to_string()).collect()
}

fn is_known(name: &str) -> bool {
    CAPABILITIES.iter().any(|(n, _)| *n == name)
}

/// Normalize a user-supplied capability name.
///
/// Accepts any case and an optional `CAP_` prefix. `ALL` is passed through.
pub fn normalize_capability(raw: &str) -> SpecgenResult<String> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper == ALL {
        return Ok(upper);
    }
    let name = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    if is_known(&name) {
        Ok(name)
    } else {
        Err(SecurityError::UnknownCapability(raw.to_string()).into())
    }
}

fn normalize_all(raw: &[String]) -> SpecgenResult<BTreeSet<String>> {
    raw.iter().map(|r| normalize_capability(r)).collect()
}

/// Merge a base set with add and drop lists.
///
/// `final = (base ∪ add) \ drop`, with drop winning when a name appears in
/// both lists. `ALL` in `add` expands to `all`; `ALL` in `drop` empties the
/// base before explicit adds are applied. Requesting `ALL` in both lists is
/// rejected.
pub fn merge_capabilities(
    base: &[String],
    add: &[String],
    drop: &[String],
    all: &[String],
) -> SpecgenResult<BTreeSet<String>> {
    let add = normalize_all(add)?;
    let drop = normalize_all(drop)?;

    let add_all = add.contains(ALL);
    let drop_all = drop.contains(ALL);
    if add_all && drop_all {
        return Err(SpecgenError::from(SecurityError::Conflict(
            "adding all capabilities and dropping all capabilities is not allowed".into(),
        )));
    }

    let mut result: BTreeSet<String> = if drop_all {
        BTreeSet::new()
    } else {
        normalize_all(base)?
    };

    if add_all {
        result.extend(all.iter().filter(|n| is_known(n)).cloned());
    }
    result.extend(add.into_iter().filter(|n| n != ALL));

    for name in drop.iter().filter(|n| *n != ALL) {
        result.remove(name);
    }

    Ok(result)
}

/// Convert names to the OCI capability type. Unknown names are skipped.
pub fn to_oci(names: &BTreeSet<String>) -> HashSet<Capability> {
    names
        .iter()
        .filter_map(|name| {
            CAPABILITIES
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, cap)| cap.clone())
        })
        .collect()
}

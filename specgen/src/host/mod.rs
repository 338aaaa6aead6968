//! Host introspection.
//!
//! The compiler never reads host state directly. Everything it needs (cgroup
//! version and controllers, device nodes, hostname, LSM availability) goes
//! through the [`HostIntrospector`] trait so the core algorithms stay the same
//! on every platform and tests can substitute a fake.
//!
//! ```text
//! HostIntrospector (trait)
//!     ├── LinuxHost        → /sys/fs/cgroup, stat(2), /proc
//!     ├── StaticHost       → fixed answers loaded from a profile
//!     └── UnsupportedHost  → conservative answers for other platforms
//! ```

pub mod fixed;
#[cfg(target_os = "linux")]
pub mod linux;

use serde::{Deserialize, Serialize};
use specgen_shared::SpecgenResult;
use std::fmt;
use std::path::Path;

pub use fixed::StaticHost;

/// Generation of the control-group hierarchy mounted on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => f.write_str("v1"),
            CgroupVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Kernel feature flags for resource limits.
///
/// Each flag says whether the corresponding limit can be applied on this
/// host. Limits whose flag is false are dropped with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupFeatures {
    pub memory_limit: bool,
    pub swap_limit: bool,
    pub memory_reservation: bool,
    pub memory_swappiness: bool,
    pub oom_kill_disable: bool,
    pub pids_limit: bool,
    pub cpu_shares: bool,
    pub cpu_cfs_period: bool,
    pub cpu_cfs_quota: bool,
    pub cpu_realtime: bool,
    pub cpuset: bool,
    pub blkio_weight: bool,
    pub blkio_weight_device: bool,
    pub blkio_read_bps_device: bool,
    pub blkio_write_bps_device: bool,
    pub blkio_read_iops_device: bool,
    pub blkio_write_iops_device: bool,
    /// CPUs usable by containers, in cpuset list format (`0-3,6`).
    pub cpus: Option<String>,
    /// Memory nodes usable by containers, in cpuset list format.
    pub mems: Option<String>,
}

impl CgroupFeatures {
    /// Every limit supported, no cpuset restriction.
    pub fn all() -> Self {
        Self {
            memory_limit: true,
            swap_limit: true,
            memory_reservation: true,
            memory_swappiness: true,
            oom_kill_disable: true,
            pids_limit: true,
            cpu_shares: true,
            cpu_cfs_period: true,
            cpu_cfs_quota: true,
            cpu_realtime: true,
            cpuset: true,
            blkio_weight: true,
            blkio_weight_device: true,
            blkio_read_bps_device: true,
            blkio_write_bps_device: true,
            blkio_read_iops_device: true,
            blkio_write_iops_device: true,
            cpus: None,
            mems: None,
        }
    }

    /// No limit supported.
    pub fn none() -> Self {
        Self {
            memory_limit: false,
            swap_limit: false,
            memory_reservation: false,
            memory_swappiness: false,
            oom_kill_disable: false,
            pids_limit: false,
            cpu_shares: false,
            cpu_cfs_period: false,
            cpu_cfs_quota: false,
            cpu_realtime: false,
            cpuset: false,
            blkio_weight: false,
            blkio_weight_device: false,
            blkio_read_bps_device: false,
            blkio_write_bps_device: false,
            blkio_read_iops_device: false,
            blkio_write_iops_device: false,
            cpus: None,
            mems: None,
        }
    }
}

impl Default for CgroupFeatures {
    fn default() -> Self {
        Self::all()
    }
}

/// Device node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    /// Single-letter type used in cgroup device rules.
    pub fn letter(&self) -> &'static str {
        match self {
            DeviceKind::Char => "c",
            DeviceKind::Block => "b",
        }
    }
}

/// A device node as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDevice {
    pub path: String,
    pub kind: DeviceKind,
    pub major: i64,
    pub minor: i64,
    /// Permission bits of the node.
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Host state the compiler may consult.
///
/// Implementations must be cheap to call repeatedly; the compiler does not
/// cache answers across calls.
pub trait HostIntrospector: Send + Sync {
    /// Platform name for logging/debugging.
    fn name(&self) -> &'static str;

    /// Active cgroup hierarchy version.
    fn cgroup_version(&self) -> SpecgenResult<CgroupVersion>;

    /// Which resource limits the host can enforce.
    fn cgroup_features(&self) -> SpecgenResult<CgroupFeatures>;

    /// Stat a device node.
    fn stat_device(&self, path: &Path) -> SpecgenResult<HostDevice>;

    /// Every device node below `dir`, skipping pseudo-filesystems.
    fn devices_under(&self, dir: &Path) -> SpecgenResult<Vec<HostDevice>>;

    /// Whether `path` is a directory on the host.
    fn is_dir(&self, path: &Path) -> bool;

    /// Host paths matching a glob pattern, sorted.
    fn glob(&self, pattern: &str) -> SpecgenResult<Vec<String>>;

    /// Hostname of the host.
    fn hostname(&self) -> SpecgenResult<String>;

    /// Whether the kernel supports seccomp filtering.
    fn supports_seccomp(&self) -> bool;

    /// Whether SELinux is enabled.
    fn selinux_enabled(&self) -> bool;

    /// Whether AppArmor is enabled.
    fn apparmor_enabled(&self) -> bool;

    /// Whether the compiler runs without root privileges.
    fn is_rootless(&self) -> bool;

    /// Names of every capability the host knows (`CAP_*`).
    fn capabilities(&self) -> Vec<String>;

    /// Current working directory, used to absolutize relative bind sources.
    fn current_dir(&self) -> SpecgenResult<String>;
}

// ============================================================================
// Current Host
// ============================================================================

/// Get the introspector for the running platform.
#[cfg(target_os = "linux")]
pub fn current() -> &'static dyn HostIntrospector {
    static HOST: linux::LinuxHost = linux::LinuxHost;
    &HOST
}

#[cfg(not(target_os = "linux"))]
pub fn current() -> &'static dyn HostIntrospector {
    static HOST: UnsupportedHost = UnsupportedHost;
    &HOST
}

/// Fallback for platforms without Linux containers.
///
/// Reports cgroup v2 with no controllers so every limit is downgraded
/// to a warning, and refuses device lookups.
#[cfg(not(target_os = "linux"))]
struct UnsupportedHost;

#[cfg(not(target_os = "linux"))]
impl HostIntrospector for UnsupportedHost {
    fn name(&self) -> &'static str {
        "Unsupported"
    }

    fn cgroup_version(&self) -> SpecgenResult<CgroupVersion> {
        Ok(CgroupVersion::V2)
    }

    fn cgroup_features(&self) -> SpecgenResult<CgroupFeatures> {
        Ok(CgroupFeatures::none())
    }

    fn stat_device(&self, path: &Path) -> SpecgenResult<HostDevice> {
        Err(specgen_shared::ResourceError::device(
            path.display().to_string(),
            "device nodes are not supported on this platform",
        )
        .into())
    }

    fn devices_under(&self, _dir: &Path) -> SpecgenResult<Vec<HostDevice>> {
        Ok(Vec::new())
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn glob(&self, pattern: &str) -> SpecgenResult<Vec<String>> {
        crate::mounts::glob::expand(pattern)
    }

    fn hostname(&self) -> SpecgenResult<String> {
        Ok("localhost".to_string())
    }

    fn supports_seccomp(&self) -> bool {
        false
    }

    fn selinux_enabled(&self) -> bool {
        false
    }

    fn apparmor_enabled(&self) -> bool {
        false
    }

    fn is_rootless(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Vec<String> {
        crate::security::capabilities::all_capability_names()
    }

    fn current_dir(&self) -> SpecgenResult<String> {
        Ok(std::env::current_dir()?.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_presets() {
        let all = CgroupFeatures::all();
        assert!(all.memory_limit && all.blkio_write_iops_device && all.cpu_realtime);
        let none = CgroupFeatures::none();
        assert!(!none.memory_limit && !none.pids_limit);
        assert_eq!(CgroupFeatures::default(), all);
    }

    #[test]
    fn test_device_letter() {
        assert_eq!(DeviceKind::Char.letter(), "c");
        assert_eq!(DeviceKind::Block.letter(), "b");
    }

    #[test]
    fn test_current_host_has_name() {
        assert!(!current().name().is_empty());
    }
}

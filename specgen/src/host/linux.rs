//! Linux host introspection backed by `/sys/fs/cgroup`, `stat(2)` and `/proc`.

use super::{CgroupFeatures, CgroupVersion, DeviceKind, HostDevice, HostIntrospector};
use nix::sys::stat::{SFlag, major, minor, stat};
use specgen_shared::{ResourceError, SpecgenError, SpecgenResult};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Directories under /dev that never hold real device nodes.
const SKIPPED_DEV_DIRS: &[&str] = &["pts", "shm", "fd", "mqueue", ".lxc", ".lxd-mounts", ".udev"];

/// Linux implementation of [`HostIntrospector`].
pub struct LinuxHost;

impl HostIntrospector for LinuxHost {
    fn name(&self) -> &'static str {
        "Linux"
    }

    fn cgroup_version(&self) -> SpecgenResult<CgroupVersion> {
        detect_cgroup_version(Path::new(CGROUP_ROOT))
    }

    fn cgroup_features(&self) -> SpecgenResult<CgroupFeatures> {
        let root = Path::new(CGROUP_ROOT);
        match detect_cgroup_version(root)? {
            CgroupVersion::V2 => probe_v2(root),
            CgroupVersion::V1 => Ok(probe_v1(root)),
        }
    }

    fn stat_device(&self, path: &Path) -> SpecgenResult<HostDevice> {
        stat_device(path)
    }

    fn devices_under(&self, dir: &Path) -> SpecgenResult<Vec<HostDevice>> {
        devices_under(dir)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn glob(&self, pattern: &str) -> SpecgenResult<Vec<String>> {
        crate::mounts::glob::expand(pattern)
    }

    fn hostname(&self) -> SpecgenResult<String> {
        let name = nix::unistd::gethostname()
            .map_err(|e| SpecgenError::Internal(format!("unable to retrieve hostname: {}", e)))?;
        name.into_string()
            .map_err(|_| SpecgenError::Internal("hostname is not valid UTF-8".into()))
    }

    fn supports_seccomp(&self) -> bool {
        fs::read_to_string("/proc/self/status")
            .map(|s| s.lines().any(|l| l.starts_with("Seccomp:")))
            .unwrap_or(false)
    }

    fn selinux_enabled(&self) -> bool {
        Path::new("/sys/fs/selinux/enforce").exists()
    }

    fn apparmor_enabled(&self) -> bool {
        fs::read_to_string("/sys/module/apparmor/parameters/enabled")
            .map(|s| s.trim_start().starts_with('Y'))
            .unwrap_or(false)
    }

    fn is_rootless(&self) -> bool {
        !nix::unistd::geteuid().is_root()
    }

    fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = caps::all().iter().map(|c| c.to_string()).collect();
        names.sort();
        names
    }

    fn current_dir(&self) -> SpecgenResult<String> {
        Ok(std::env::current_dir()?.display().to_string())
    }
}

/// Detect the cgroup version mounted at `root`.
///
/// A unified hierarchy exposes `cgroup.controllers` at its root.
pub fn detect_cgroup_version(root: &Path) -> SpecgenResult<CgroupVersion> {
    if root.join("cgroup.controllers").exists() {
        Ok(CgroupVersion::V2)
    } else if root.exists() {
        Ok(CgroupVersion::V1)
    } else {
        Err(ResourceError::Probe(format!("{} is not mounted", root.display())).into())
    }
}

/// Probe a unified (v2) hierarchy from its enabled controllers.
pub fn probe_v2(root: &Path) -> SpecgenResult<CgroupFeatures> {
    let controllers = fs::read_to_string(root.join("cgroup.controllers")).map_err(|e| {
        ResourceError::Probe(format!("reading {}/cgroup.controllers: {}", root.display(), e))
    })?;
    let enabled: HashSet<&str> = controllers.split_whitespace().collect();

    let memory = enabled.contains("memory");
    let cpu = enabled.contains("cpu");
    let io = enabled.contains("io");

    Ok(CgroupFeatures {
        memory_limit: memory,
        swap_limit: memory,
        memory_reservation: memory,
        // memory.swappiness does not exist on v2
        memory_swappiness: false,
        oom_kill_disable: false,
        pids_limit: enabled.contains("pids"),
        cpu_shares: cpu,
        cpu_cfs_period: cpu,
        cpu_cfs_quota: cpu,
        cpu_realtime: false,
        cpuset: enabled.contains("cpuset"),
        blkio_weight: io,
        blkio_weight_device: io,
        blkio_read_bps_device: io,
        blkio_write_bps_device: io,
        blkio_read_iops_device: io,
        blkio_write_iops_device: io,
        cpus: read_trimmed(&root.join("cpuset.cpus.effective")),
        mems: read_trimmed(&root.join("cpuset.mems.effective")),
    })
}

/// Probe a legacy (v1) hierarchy by looking for each controller file.
pub fn probe_v1(root: &Path) -> CgroupFeatures {
    let has = |controller: &str, file: &str| root.join(controller).join(file).exists();

    CgroupFeatures {
        memory_limit: has("memory", "memory.limit_in_bytes"),
        swap_limit: has("memory", "memory.memsw.limit_in_bytes"),
        memory_reservation: has("memory", "memory.soft_limit_in_bytes"),
        memory_swappiness: has("memory", "memory.swappiness"),
        oom_kill_disable: has("memory", "memory.oom_control"),
        pids_limit: has("pids", "pids.max"),
        cpu_shares: has("cpu", "cpu.shares"),
        cpu_cfs_period: has("cpu", "cpu.cfs_period_us"),
        cpu_cfs_quota: has("cpu", "cpu.cfs_quota_us"),
        cpu_realtime: has("cpu", "cpu.rt_period_us"),
        cpuset: has("cpuset", "cpuset.cpus"),
        blkio_weight: has("blkio", "blkio.weight"),
        blkio_weight_device: has("blkio", "blkio.weight_device"),
        blkio_read_bps_device: has("blkio", "blkio.throttle.read_bps_device"),
        blkio_write_bps_device: has("blkio", "blkio.throttle.write_bps_device"),
        blkio_read_iops_device: has("blkio", "blkio.throttle.read_iops_device"),
        blkio_write_iops_device: has("blkio", "blkio.throttle.write_iops_device"),
        cpus: read_trimmed(&root.join("cpuset").join("cpuset.cpus")),
        mems: read_trimmed(&root.join("cpuset").join("cpuset.mems")),
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Stat a character or block device.
pub fn stat_device(path: &Path) -> SpecgenResult<HostDevice> {
    let display = path.display().to_string();
    let st = stat(path).map_err(|e| ResourceError::device(&display, e.to_string()))?;

    let format = SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits());
    let kind = if format == SFlag::S_IFCHR {
        DeviceKind::Char
    } else if format == SFlag::S_IFBLK {
        DeviceKind::Block
    } else {
        return Err(ResourceError::device(display, "not a device node").into());
    };

    Ok(HostDevice {
        path: display,
        kind,
        major: major(st.st_rdev) as i64,
        minor: minor(st.st_rdev) as i64,
        file_mode: st.st_mode & 0o7777,
        uid: st.st_uid,
        gid: st.st_gid,
    })
}

/// Walk `dir` and collect every device node.
///
/// Pseudo-filesystem directories and `/dev/console` are skipped; entries that
/// disappear or are not devices are ignored.
pub fn devices_under(dir: &Path) -> SpecgenResult<Vec<HostDevice>> {
    let mut devices = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| SKIPPED_DEV_DIRS.contains(&n)))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable device entry");
                continue;
            }
        };
        if entry.file_type().is_dir() || entry.file_type().is_symlink() {
            continue;
        }
        if entry.file_name() == "console" {
            continue;
        }
        if let Ok(device) = stat_device(entry.path()) {
            devices.push(device);
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_v2() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
        fs::write(dir.path().join("cpuset.cpus.effective"), "0-3\n").unwrap();

        assert_eq!(detect_cgroup_version(dir.path()).unwrap(), CgroupVersion::V2);
        let features = probe_v2(dir.path()).unwrap();
        assert!(features.memory_limit && features.pids_limit && features.blkio_weight);
        assert!(!features.cpu_realtime);
        assert!(!features.memory_swappiness);
        assert_eq!(features.cpus.as_deref(), Some("0-3"));
        assert_eq!(features.mems, None);
    }

    #[test]
    fn test_v2_missing_controllers() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "memory\n").unwrap();
        let features = probe_v2(dir.path()).unwrap();
        assert!(features.memory_limit);
        assert!(!features.cpu_shares);
        assert!(!features.pids_limit);
        assert!(!features.cpuset);
    }

    #[test]
    fn test_detect_v1() {
        let dir = TempDir::new().unwrap();
        let memory = dir.path().join("memory");
        fs::create_dir_all(&memory).unwrap();
        fs::write(memory.join("memory.limit_in_bytes"), "").unwrap();

        assert_eq!(detect_cgroup_version(dir.path()).unwrap(), CgroupVersion::V1);
        let features = probe_v1(dir.path());
        assert!(features.memory_limit);
        assert!(!features.swap_limit);
        assert!(!features.cpu_shares);
    }

    #[test]
    fn test_detect_missing_root() {
        let err = detect_cgroup_version(Path::new("/nonexistent/cgroup")).unwrap_err();
        assert_eq!(err.kind(), specgen_shared::ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn test_stat_null_device() {
        let dev = stat_device(Path::new("/dev/null")).unwrap();
        assert_eq!(dev.kind, DeviceKind::Char);
        assert_eq!((dev.major, dev.minor), (1, 3));
    }

    #[test]
    fn test_stat_regular_file_is_not_device() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert!(stat_device(&file).is_err());
    }
}

//! A host described by data instead of probed.
//!
//! Used to compile requests for another machine, and as the substitute host
//! in tests. Loaded from JSON or YAML, or built with the `with_*` methods.

use super::{CgroupFeatures, CgroupVersion, DeviceKind, HostDevice, HostIntrospector};
use serde::{Deserialize, Serialize};
use specgen_shared::{ResourceError, SpecgenError, SpecgenResult};
use std::collections::BTreeMap;
use std::path::Path;

/// Fixed answers for every [`HostIntrospector`] question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticHost {
    pub cgroup_version: CgroupVersion,
    pub features: CgroupFeatures,
    pub devices: Vec<HostDevice>,
    pub directories: Vec<String>,
    /// Glob pattern → matches.
    pub globs: BTreeMap<String, Vec<String>>,
    pub hostname: String,
    pub seccomp: bool,
    pub selinux: bool,
    pub apparmor: bool,
    pub rootless: bool,
    pub capabilities: Vec<String>,
    pub current_dir: String,
}

impl Default for StaticHost {
    fn default() -> Self {
        Self {
            cgroup_version: CgroupVersion::V2,
            features: CgroupFeatures::all(),
            devices: Vec::new(),
            directories: Vec::new(),
            globs: BTreeMap::new(),
            hostname: "host.example".to_string(),
            seccomp: true,
            selinux: false,
            apparmor: false,
            rootless: false,
            capabilities: crate::security::capabilities::all_capability_names(),
            current_dir: "/".to_string(),
        }
    }
}

impl StaticHost {
    /// Load a host profile from `.json`, `.yaml` or `.yml`.
    pub fn load(path: &Path) -> SpecgenResult<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text).map_err(|e| {
                SpecgenError::parse(format!("host profile {}: {}", path.display(), e))
            }),
            _ => Ok(serde_json::from_str(&text)?),
        }
    }

    pub fn with_cgroup_version(mut self, version: CgroupVersion) -> Self {
        self.cgroup_version = version;
        self
    }

    pub fn with_features(mut self, features: CgroupFeatures) -> Self {
        self.features = features;
        self
    }

    /// Add a character device node.
    pub fn with_char_device(mut self, path: &str, major: i64, minor: i64) -> Self {
        self.devices.push(HostDevice {
            path: path.to_string(),
            kind: DeviceKind::Char,
            major,
            minor,
            file_mode: 0o666,
            uid: 0,
            gid: 0,
        });
        self
    }

    /// Add a block device node.
    pub fn with_block_device(mut self, path: &str, major: i64, minor: i64) -> Self {
        self.devices.push(HostDevice {
            path: path.to_string(),
            kind: DeviceKind::Block,
            major,
            minor,
            file_mode: 0o660,
            uid: 0,
            gid: 6,
        });
        self
    }

    pub fn with_glob(mut self, pattern: &str, matches: &[&str]) -> Self {
        self.globs.insert(
            pattern.to_string(),
            matches.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn with_current_dir(mut self, dir: &str) -> Self {
        self.current_dir = dir.to_string();
        self
    }

    pub fn with_rootless(mut self, rootless: bool) -> Self {
        self.rootless = rootless;
        self
    }

    pub fn with_selinux(mut self, enabled: bool) -> Self {
        self.selinux = enabled;
        self
    }

    pub fn with_apparmor(mut self, enabled: bool) -> Self {
        self.apparmor = enabled;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }
}

impl HostIntrospector for StaticHost {
    fn name(&self) -> &'static str {
        "Static"
    }

    fn cgroup_version(&self) -> SpecgenResult<CgroupVersion> {
        Ok(self.cgroup_version)
    }

    fn cgroup_features(&self) -> SpecgenResult<CgroupFeatures> {
        Ok(self.features.clone())
    }

    fn stat_device(&self, path: &Path) -> SpecgenResult<HostDevice> {
        let wanted = path.to_string_lossy();
        self.devices
            .iter()
            .find(|d| d.path == wanted)
            .cloned()
            .ok_or_else(|| ResourceError::device(wanted, "no such file or directory").into())
    }

    fn devices_under(&self, dir: &Path) -> SpecgenResult<Vec<HostDevice>> {
        let prefix = format!("{}/", dir.to_string_lossy().trim_end_matches('/'));
        let mut found: Vec<HostDevice> = self
            .devices
            .iter()
            .filter(|d| d.path.starts_with(&prefix))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let wanted = path.to_string_lossy();
        let prefix = format!("{}/", wanted.trim_end_matches('/'));
        self.directories.iter().any(|d| *d == wanted)
            || self.devices.iter().any(|d| d.path.starts_with(&prefix))
    }

    fn glob(&self, pattern: &str) -> SpecgenResult<Vec<String>> {
        Ok(self.globs.get(pattern).cloned().unwrap_or_default())
    }

    fn hostname(&self) -> SpecgenResult<String> {
        Ok(self.hostname.clone())
    }

    fn supports_seccomp(&self) -> bool {
        self.seccomp
    }

    fn selinux_enabled(&self) -> bool {
        self.selinux
    }

    fn apparmor_enabled(&self) -> bool {
        self.apparmor
    }

    fn is_rootless(&self) -> bool {
        self.rootless
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn current_dir(&self) -> SpecgenResult<String> {
        Ok(self.current_dir.clone())
    }
}

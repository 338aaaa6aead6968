//! Engine-wide defaults.
//!
//! Everything a request leaves unset and the image does not provide comes
//! from here: default capabilities, sysctls, environment, mounts, devices,
//! ulimits, namespace modes and LSM profiles. The compiler never reads
//! process-wide state; callers load an [`EngineConfig`] and pass it in.

use crate::mounts::ImageVolumeMode;
use crate::namespace::{NamespaceFamily, NamespaceMode};
use crate::ports::PortAllocation;
use serde::{Deserialize, Serialize};
use specgen_shared::constants::{capabilities, container, limits, paths};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Namespace Defaults
// ============================================================================

/// Namespace literal used for each family when the request sets none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDefaults {
    #[serde(default = "default_cgroupns")]
    pub cgroupns: String,
    #[serde(default = "default_ipcns")]
    pub ipcns: String,
    /// Empty selects bridge (rootful) or slirp4netns (rootless).
    #[serde(default)]
    pub netns: String,
    #[serde(default = "default_private")]
    pub pidns: String,
    #[serde(default = "default_userns")]
    pub userns: String,
    #[serde(default = "default_private")]
    pub utsns: String,
}

fn default_cgroupns() -> String {
    "private".to_string()
}

fn default_ipcns() -> String {
    "shareable".to_string()
}

fn default_private() -> String {
    "private".to_string()
}

fn default_userns() -> String {
    "host".to_string()
}

impl Default for NamespaceDefaults {
    fn default() -> Self {
        Self {
            cgroupns: default_cgroupns(),
            ipcns: default_ipcns(),
            netns: String::new(),
            pidns: default_private(),
            userns: default_userns(),
            utsns: default_private(),
        }
    }
}

impl NamespaceDefaults {
    /// Default literal for a family. The mount namespace is always private.
    pub fn for_family(&self, family: NamespaceFamily) -> &str {
        match family {
            NamespaceFamily::Cgroup => &self.cgroupns,
            NamespaceFamily::Ipc => &self.ipcns,
            NamespaceFamily::Network => &self.netns,
            NamespaceFamily::Pid => &self.pidns,
            NamespaceFamily::User => &self.userns,
            NamespaceFamily::Uts => &self.utsns,
            NamespaceFamily::Mount => "private",
        }
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// Engine configuration, the equivalent of `containers.conf`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capabilities granted to root containers.
    #[serde(default = "default_capabilities")]
    pub default_capabilities: Vec<String>,

    /// `KEY=VALUE` sysctls applied before user sysctls.
    #[serde(default = "default_sysctls")]
    pub default_sysctls: Vec<String>,

    /// `KEY=VALUE` environment applied before image and user environment.
    #[serde(default = "default_env")]
    pub env: Vec<String>,

    /// Mounts in `--mount` syntax, merged without ever conflicting.
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Devices in `src[:dst][:perms]` syntax added to every container.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Ulimits in `name=soft[:hard]` syntax.
    #[serde(default)]
    pub default_ulimits: Vec<String>,

    /// Annotations applied before user annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub namespaces: NamespaceDefaults,

    /// Seccomp profile used when the request names none. `None` means the
    /// built-in profile.
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,

    /// AppArmor profile for unprivileged containers.
    #[serde(default = "default_apparmor_profile")]
    pub apparmor_profile: String,

    /// Label containers with SELinux when the host supports it.
    #[serde(default = "default_true")]
    pub selinux: bool,

    /// Host path of the init binary.
    #[serde(default = "default_init_path")]
    pub init_path: String,

    /// Default pids limit; 0 means unlimited.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Default /dev/shm size.
    #[serde(default = "default_shm_size")]
    pub shm_size: String,

    #[serde(default = "default_log_driver")]
    pub log_driver: String,

    #[serde(default)]
    pub log_tag: String,

    /// Seconds to wait after the stop signal before killing.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u32,

    #[serde(default)]
    pub image_volume_mode: ImageVolumeMode,

    #[serde(default)]
    pub no_pivot_root: bool,

    /// How random host ports are chosen.
    #[serde(default)]
    pub port_allocation: PortAllocation,

    /// Whether the engine runs without root.
    #[serde(default)]
    pub rootless: bool,
}

// Default value functions for EngineConfig

fn default_capabilities() -> Vec<String> {
    capabilities::DEFAULT.iter().map(|c| c.to_string()).collect()
}

fn default_sysctls() -> Vec<String> {
    vec!["net.ipv4.ping_group_range=0 0".to_string()]
}

fn default_env() -> Vec<String> {
    vec![format!("PATH={}", container::DEFAULT_PATH)]
}

fn default_apparmor_profile() -> String {
    "containers-default-0.50.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_init_path() -> String {
    paths::DEFAULT_INIT_BINARY.to_string()
}

fn default_pids_limit() -> i64 {
    2048
}

fn default_shm_size() -> String {
    "65536k".to_string()
}

fn default_log_driver() -> String {
    "k8s-file".to_string()
}

fn default_stop_timeout() -> u32 {
    limits::DEFAULT_STOP_TIMEOUT
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_capabilities: default_capabilities(),
            default_sysctls: default_sysctls(),
            env: default_env(),
            mounts: Vec::new(),
            devices: Vec::new(),
            default_ulimits: Vec::new(),
            annotations: BTreeMap::new(),
            namespaces: NamespaceDefaults::default(),
            seccomp_profile: None,
            apparmor_profile: default_apparmor_profile(),
            selinux: default_true(),
            init_path: default_init_path(),
            pids_limit: default_pids_limit(),
            shm_size: default_shm_size(),
            log_driver: default_log_driver(),
            log_tag: String::new(),
            stop_timeout: default_stop_timeout(),
            image_volume_mode: ImageVolumeMode::default(),
            no_pivot_root: false,
            port_allocation: PortAllocation::default(),
            rootless: false,
        }
    }
}

impl EngineConfig {
    /// Settings for an engine running as root.
    pub fn rootful() -> Self {
        Self::default()
    }

    /// Settings for an engine running as an unprivileged user.
    ///
    /// Networking defaults to slirp4netns and no pids limit is set, since
    /// rootless cgroup delegation may not include the pids controller.
    pub fn rootless() -> Self {
        Self {
            rootless: true,
            pids_limit: 0,
            ..Default::default()
        }
    }

    /// Network mode selected by an empty `--network`.
    pub fn default_network_mode(&self) -> NamespaceMode {
        if self.rootless {
            NamespaceMode::Slirp4netns
        } else {
            NamespaceMode::Bridge
        }
    }

    /// `$XDG_CONFIG_HOME/specgen/engine.yaml`, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("specgen").join("engine.yaml"))
    }

    /// Load from `.json`, `.yaml` or `.yml`. Missing fields take their defaults.
    pub fn load(path: &Path) -> SpecgenResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text).map_err(|e| {
                SpecgenError::parse(format!("engine config {}: {}", path.display(), e))
            })?,
            other => {
                return Err(SpecgenError::invalid_config(format!(
                    "engine config {}: unsupported extension {:?}",
                    path.display(),
                    other.unwrap_or("")
                )));
            }
        };
        tracing::debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Load the file at [`Self::default_path`] when present, else the preset
    /// matching `rootless`.
    pub fn load_default(rootless: bool) -> SpecgenResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ if rootless => Ok(Self::rootless()),
            _ => Ok(Self::rootful()),
        }
    }

    /// Create a builder for customizing engine settings.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

// ============================================================================
// Engine Config Builder
// ============================================================================

/// Builder for customizing [`EngineConfig`].
///
/// # Example
///
/// ```
/// use specgen::config::EngineConfigBuilder;
///
/// let config = EngineConfigBuilder::rootless()
///     .pids_limit(512)
///     .mount("type=tmpfs,target=/scratch")
///     .build();
/// assert!(config.rootless);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    inner: EngineConfig,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: EngineConfig::default(),
        }
    }

    pub fn rootful() -> Self {
        Self {
            inner: EngineConfig::rootful(),
        }
    }

    pub fn rootless() -> Self {
        Self {
            inner: EngineConfig::rootless(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Process defaults
    // ─────────────────────────────────────────────────────────────────────

    pub fn default_capabilities(&mut self, caps: Vec<String>) -> &mut Self {
        self.inner.default_capabilities = caps;
        self
    }

    pub fn env(&mut self, entry: impl Into<String>) -> &mut Self {
        self.inner.env.push(entry.into());
        self
    }

    pub fn sysctl(&mut self, entry: impl Into<String>) -> &mut Self {
        self.inner.default_sysctls.push(entry.into());
        self
    }

    pub fn ulimit(&mut self, entry: impl Into<String>) -> &mut Self {
        self.inner.default_ulimits.push(entry.into());
        self
    }

    pub fn annotation(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.inner.annotations.insert(key.into(), value.into());
        self
    }

    pub fn stop_timeout(&mut self, seconds: u32) -> &mut Self {
        self.inner.stop_timeout = seconds;
        self
    }

    pub fn init_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.inner.init_path = path.into();
        self
    }

    // ─────────────────────────────────────────────────────────────────────
    // Storage and devices
    // ─────────────────────────────────────────────────────────────────────

    pub fn mount(&mut self, spec: impl Into<String>) -> &mut Self {
        self.inner.mounts.push(spec.into());
        self
    }

    pub fn device(&mut self, spec: impl Into<String>) -> &mut Self {
        self.inner.devices.push(spec.into());
        self
    }

    pub fn image_volume_mode(&mut self, mode: ImageVolumeMode) -> &mut Self {
        self.inner.image_volume_mode = mode;
        self
    }

    pub fn shm_size(&mut self, size: impl Into<String>) -> &mut Self {
        self.inner.shm_size = size.into();
        self
    }

    // ─────────────────────────────────────────────────────────────────────
    // Security, limits and networking
    // ─────────────────────────────────────────────────────────────────────

    pub fn seccomp_profile(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.inner.seccomp_profile = Some(path.into());
        self
    }

    pub fn apparmor_profile(&mut self, profile: impl Into<String>) -> &mut Self {
        self.inner.apparmor_profile = profile.into();
        self
    }

    pub fn selinux(&mut self, enabled: bool) -> &mut Self {
        self.inner.selinux = enabled;
        self
    }

    pub fn pids_limit(&mut self, limit: i64) -> &mut Self {
        self.inner.pids_limit = limit;
        self
    }

    pub fn namespace_default(&mut self, family: NamespaceFamily, raw: impl Into<String>) -> &mut Self {
        let raw = raw.into();
        let ns = &mut self.inner.namespaces;
        match family {
            NamespaceFamily::Cgroup => ns.cgroupns = raw,
            NamespaceFamily::Ipc => ns.ipcns = raw,
            NamespaceFamily::Network => ns.netns = raw,
            NamespaceFamily::Pid => ns.pidns = raw,
            NamespaceFamily::User => ns.userns = raw,
            NamespaceFamily::Uts => ns.utsns = raw,
            NamespaceFamily::Mount => {}
        }
        self
    }

    pub fn port_allocation(&mut self, allocation: PortAllocation) -> &mut Self {
        self.inner.port_allocation = allocation;
        self
    }

    pub fn build(&self) -> EngineConfig {
        self.inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let rootful = EngineConfig::rootful();
        assert_eq!(rootful.default_network_mode(), NamespaceMode::Bridge);
        assert_eq!(rootful.default_capabilities.len(), 11);
        assert_eq!(rootful.pids_limit, 2048);

        let rootless = EngineConfig::rootless();
        assert_eq!(rootless.default_network_mode(), NamespaceMode::Slirp4netns);
        assert_eq!(rootless.pids_limit, 0);
    }

    #[test]
    fn test_namespace_defaults() {
        let ns = NamespaceDefaults::default();
        assert_eq!(ns.for_family(NamespaceFamily::Ipc), "shareable");
        assert_eq!(ns.for_family(NamespaceFamily::User), "host");
        assert_eq!(ns.for_family(NamespaceFamily::Network), "");
    }

    #[test]
    fn test_builder() {
        let config = EngineConfigBuilder::rootless()
            .pids_limit(512)
            .mount("type=tmpfs,target=/scratch")
            .namespace_default(NamespaceFamily::Pid, "host")
            .build();
        assert!(config.rootless);
        assert_eq!(config.pids_limit, 512);
        assert_eq!(config.mounts, vec!["type=tmpfs,target=/scratch"]);
        assert_eq!(config.namespaces.pidns, "host");
    }

    #[test]
    fn test_load_yaml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(
            &path,
            "pids_limit: 100\nport_allocation: random\nnamespaces:\n  pidns: host\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.pids_limit, 100);
        assert_eq!(config.port_allocation, PortAllocation::Random);
        assert_eq!(config.namespaces.pidns, "host");
        assert_eq!(config.namespaces.ipcns, "shareable");
        assert_eq!(config.stop_timeout, 10);
    }

    #[test]
    fn test_load_json_and_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("engine.json");
        std::fs::write(&json, r#"{"rootless": true, "log_driver": "journald"}"#).unwrap();
        let config = EngineConfig::load(&json).unwrap();
        assert!(config.rootless);
        assert_eq!(config.log_driver, "journald");

        let toml = dir.path().join("engine.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(EngineConfig::load(&toml).is_err());
    }
}

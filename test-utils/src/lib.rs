//! Test doubles for the specgen compiler.
//!
//! - [`FakeHost`]: a [`StaticHost`] that records every question asked of it
//! - [`FakeLookup`]: in-memory containers and pods
//! - [`SequencePortPicker`]: hands out a fixed list of candidate ports
//! - fixtures for images, requests and seccomp profile files

use parking_lot::{Mutex, RwLock};
use specgen::host::{CgroupFeatures, CgroupVersion, HostDevice, HostIntrospector, StaticHost};
use specgen::lookup::{ContainerInfo, ContainerLookup, PodInfo};
use specgen::ports::PortPicker;
use specgen::{EngineConfig, ImageMetadata, SpecGenerator, SpecgenError, SpecgenResult};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

// ============================================================================
// Host
// ============================================================================

/// Host answers from a [`StaticHost`], with a log of calls.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub inner: StaticHost,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeHost {
    pub fn new(inner: StaticHost) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Methods called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// Whether anything touching host state was asked.
    pub fn probed(&self) -> bool {
        !self.calls.lock().is_empty()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

impl From<StaticHost> for FakeHost {
    fn from(inner: StaticHost) -> Self {
        Self::new(inner)
    }
}

impl HostIntrospector for FakeHost {
    fn name(&self) -> &'static str {
        "Fake"
    }

    fn cgroup_version(&self) -> SpecgenResult<CgroupVersion> {
        self.record("cgroup_version");
        self.inner.cgroup_version()
    }

    fn cgroup_features(&self) -> SpecgenResult<CgroupFeatures> {
        self.record("cgroup_features");
        self.inner.cgroup_features()
    }

    fn stat_device(&self, path: &Path) -> SpecgenResult<HostDevice> {
        self.record("stat_device");
        self.inner.stat_device(path)
    }

    fn devices_under(&self, dir: &Path) -> SpecgenResult<Vec<HostDevice>> {
        self.record("devices_under");
        self.inner.devices_under(dir)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.record("is_dir");
        self.inner.is_dir(path)
    }

    fn glob(&self, pattern: &str) -> SpecgenResult<Vec<String>> {
        self.record("glob");
        self.inner.glob(pattern)
    }

    fn hostname(&self) -> SpecgenResult<String> {
        self.record("hostname");
        self.inner.hostname()
    }

    fn supports_seccomp(&self) -> bool {
        self.record("supports_seccomp");
        self.inner.supports_seccomp()
    }

    fn selinux_enabled(&self) -> bool {
        self.record("selinux_enabled");
        self.inner.selinux_enabled()
    }

    fn apparmor_enabled(&self) -> bool {
        self.record("apparmor_enabled");
        self.inner.apparmor_enabled()
    }

    fn is_rootless(&self) -> bool {
        self.inner.is_rootless()
    }

    fn capabilities(&self) -> Vec<String> {
        self.record("capabilities");
        self.inner.capabilities()
    }

    fn current_dir(&self) -> SpecgenResult<String> {
        self.record("current_dir");
        self.inner.current_dir()
    }
}

// ============================================================================
// Lookup
// ============================================================================

/// Containers and pods registered by the test, found by ID or name.
#[derive(Debug, Default)]
pub struct FakeLookup {
    containers: RwLock<BTreeMap<String, ContainerInfo>>,
    pods: RwLock<BTreeMap<String, PodInfo>>,
}

impl FakeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, info: ContainerInfo) -> Self {
        self.add_container(info);
        self
    }

    pub fn with_pod(self, info: PodInfo) -> Self {
        self.add_pod(info);
        self
    }

    pub fn add_container(&self, info: ContainerInfo) {
        let mut containers = self.containers.write();
        if !info.name.is_empty() {
            containers.insert(info.name.clone(), info.clone());
        }
        containers.insert(info.id.clone(), info);
    }

    pub fn add_pod(&self, info: PodInfo) {
        let mut pods = self.pods.write();
        if !info.name.is_empty() {
            pods.insert(info.name.clone(), info.clone());
        }
        pods.insert(info.id.clone(), info);
    }
}

impl ContainerLookup for FakeLookup {
    fn container(&self, id_or_name: &str) -> SpecgenResult<ContainerInfo> {
        self.containers
            .read()
            .get(id_or_name)
            .cloned()
            .ok_or_else(|| SpecgenError::container_not_found(id_or_name, "no such container"))
    }

    fn pod(&self, id_or_name: &str) -> SpecgenResult<PodInfo> {
        self.pods
            .read()
            .get(id_or_name)
            .cloned()
            .ok_or_else(|| SpecgenError::pod_not_found(id_or_name, "no such pod"))
    }
}

// ============================================================================
// Ports
// ============================================================================

/// Returns the given ports in order, then fails.
#[derive(Debug, Default)]
pub struct SequencePortPicker {
    ports: Mutex<VecDeque<u16>>,
}

impl SequencePortPicker {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: Mutex::new(ports.into_iter().collect()),
        }
    }

    /// Always offers the same port.
    pub fn repeating(port: u16, times: usize) -> Self {
        Self::new(std::iter::repeat_n(port, times))
    }

    pub fn remaining(&self) -> usize {
        self.ports.lock().len()
    }
}

impl PortPicker for SequencePortPicker {
    fn candidate(&self) -> SpecgenResult<u16> {
        self.ports
            .lock()
            .pop_front()
            .ok_or_else(|| SpecgenError::Internal("port sequence exhausted".into()))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Alpine-like image running `/bin/sh`.
pub fn alpine_image() -> ImageMetadata {
    ImageMetadata {
        name: "docker.io/library/alpine:latest".into(),
        id: "sha256:0ac33e5f5afa".into(),
        cmd: vec!["/bin/sh".into()],
        env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()],
        ..Default::default()
    }
}

/// Nginx-like image with an entrypoint, exposed port, stop signal and user.
pub fn nginx_image() -> ImageMetadata {
    ImageMetadata {
        name: "docker.io/library/nginx:latest".into(),
        id: "sha256:7f553e8bbc89".into(),
        entrypoint: vec!["/docker-entrypoint.sh".into()],
        cmd: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
        working_dir: "/usr/share/nginx/html".into(),
        exposed_ports: vec!["80/tcp".into()],
        stop_signal: Some("SIGQUIT".into()),
        volumes: vec!["/var/cache/nginx".into()],
        ..Default::default()
    }
}

/// Request for `image` named `name`.
pub fn request(image: &str, name: &str) -> SpecGenerator {
    let mut spec = SpecGenerator::new(image);
    spec.basic.name = name.to_string();
    spec
}

/// Rootful engine with no default sysctls, so tests see only their own.
pub fn engine() -> EngineConfig {
    let mut engine = EngineConfig::rootful();
    engine.default_sysctls.clear();
    engine
}

/// Host with a few well-known device nodes.
pub fn host_with_devices() -> StaticHost {
    StaticHost::default()
        .with_char_device("/dev/null", 1, 3)
        .with_char_device("/dev/fuse", 10, 229)
        .with_char_device("/dev/dri/card0", 226, 0)
        .with_char_device("/dev/dri/renderD128", 226, 128)
        .with_block_device("/dev/sda", 8, 0)
}

/// Write `json` to a temporary `.json` file.
pub fn seccomp_profile_file(json: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("Failed to create seccomp profile file");
    file.write_all(json.as_bytes())
        .expect("Failed to write seccomp profile file");
    file
}

/// Minimal allow-by-default profile blocking `mount`.
pub const BLOCK_MOUNT_PROFILE: &str = r#"{
    "defaultAction": "SCMP_ACT_ALLOW",
    "syscalls": [
        { "names": ["mount", "umount2"], "action": "SCMP_ACT_ERRNO" }
    ]
}"#;

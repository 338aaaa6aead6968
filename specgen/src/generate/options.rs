//! Engine creation directives.
//!
//! The OCI config describes the process the runtime starts. Everything the
//! engine itself must do around that process (join a pod, pick a log driver,
//! register a restart policy) travels as an ordered list of [`CreateOption`]s.

use crate::mounts::{ImageVolume, Mount, NamedVolume, OverlayVolume};
use crate::namespace::PerNetworkOptions;
use crate::ports::PortMapping;
use crate::request::IdMappingOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One directive for the container-construction module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "option", content = "value", rename_all = "snake_case")]
pub enum CreateOption {
    Name(String),
    Pod(String),
    /// Explicit root filesystem path.
    Rootfs(String),
    /// Root filesystem from an image.
    RootfsImage { id: String, name: String },
    UserVolumes(Vec<String>),
    NamedVolumes(Vec<NamedVolume>),
    OverlayVolumes(Vec<OverlayVolume>),
    ImageVolumes(Vec<ImageVolume>),
    /// Bind mounts as requested, before runtime defaults were merged in.
    UserMounts(Vec<Mount>),
    Command(Vec<String>),
    Entrypoint(Vec<String>),
    WorkDir(String),
    StopSignal(i32),
    StopTimeout(u32),
    LogDriver(String),
    LogPath(String),
    LogTag(String),
    LogOptions(BTreeMap<String, String>),
    SecLabels(Vec<String>),
    Privileged,
    PidNsFrom(String),
    IpcNsFrom(String),
    UtsNsFrom(String),
    UserNsFrom(String),
    CgroupNsFrom(String),
    NetNsFrom(String),
    NetNs {
        port_mappings: Vec<PortMapping>,
        expose: BTreeMap<u16, Vec<String>>,
        networks: BTreeMap<String, PerNetworkOptions>,
        mode: String,
    },
    NetworkOptions(BTreeMap<String, Vec<String>>),
    ShmDir(String),
    ShmSize(i64),
    IdMappings(IdMappingOptions),
    User(String),
    Groups(Vec<String>),
    CgroupParent(String),
    CgroupsMode(String),
    Hosts(Vec<String>),
    UseImageHosts,
    Dns(Vec<String>),
    DnsSearch(Vec<String>),
    DnsOption(Vec<String>),
    Labels(BTreeMap<String, String>),
    RestartPolicy(String),
    RestartRetries(u32),
    Dependencies(Vec<String>),
    PidFile(String),
    Systemd,
    Init(String),
    ExitCommand(Vec<String>),
    Timeout(u32),
    Terminal,
    Stdin,
    Umask(String),
    Hostname(String),
    Volatile,
}

impl CreateOption {
    /// Directive name as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            CreateOption::Name(_) => "name",
            CreateOption::Pod(_) => "pod",
            CreateOption::Rootfs(_) => "rootfs",
            CreateOption::RootfsImage { .. } => "rootfs_image",
            CreateOption::UserVolumes(_) => "user_volumes",
            CreateOption::NamedVolumes(_) => "named_volumes",
            CreateOption::OverlayVolumes(_) => "overlay_volumes",
            CreateOption::ImageVolumes(_) => "image_volumes",
            CreateOption::UserMounts(_) => "user_mounts",
            CreateOption::Command(_) => "command",
            CreateOption::Entrypoint(_) => "entrypoint",
            CreateOption::WorkDir(_) => "work_dir",
            CreateOption::StopSignal(_) => "stop_signal",
            CreateOption::StopTimeout(_) => "stop_timeout",
            CreateOption::LogDriver(_) => "log_driver",
            CreateOption::LogPath(_) => "log_path",
            CreateOption::LogTag(_) => "log_tag",
            CreateOption::LogOptions(_) => "log_options",
            CreateOption::SecLabels(_) => "sec_labels",
            CreateOption::Privileged => "privileged",
            CreateOption::PidNsFrom(_) => "pid_ns_from",
            CreateOption::IpcNsFrom(_) => "ipc_ns_from",
            CreateOption::UtsNsFrom(_) => "uts_ns_from",
            CreateOption::UserNsFrom(_) => "user_ns_from",
            CreateOption::CgroupNsFrom(_) => "cgroup_ns_from",
            CreateOption::NetNsFrom(_) => "net_ns_from",
            CreateOption::NetNs { .. } => "net_ns",
            CreateOption::NetworkOptions(_) => "network_options",
            CreateOption::ShmDir(_) => "shm_dir",
            CreateOption::ShmSize(_) => "shm_size",
            CreateOption::IdMappings(_) => "id_mappings",
            CreateOption::User(_) => "user",
            CreateOption::Groups(_) => "groups",
            CreateOption::CgroupParent(_) => "cgroup_parent",
            CreateOption::CgroupsMode(_) => "cgroups_mode",
            CreateOption::Hosts(_) => "hosts",
            CreateOption::UseImageHosts => "use_image_hosts",
            CreateOption::Dns(_) => "dns",
            CreateOption::DnsSearch(_) => "dns_search",
            CreateOption::DnsOption(_) => "dns_option",
            CreateOption::Labels(_) => "labels",
            CreateOption::RestartPolicy(_) => "restart_policy",
            CreateOption::RestartRetries(_) => "restart_retries",
            CreateOption::Dependencies(_) => "dependencies",
            CreateOption::PidFile(_) => "pid_file",
            CreateOption::Systemd => "systemd",
            CreateOption::Init(_) => "init",
            CreateOption::ExitCommand(_) => "exit_command",
            CreateOption::Timeout(_) => "timeout",
            CreateOption::Terminal => "terminal",
            CreateOption::Stdin => "stdin",
            CreateOption::Umask(_) => "umask",
            CreateOption::Hostname(_) => "hostname",
            CreateOption::Volatile => "volatile",
        }
    }
}

/// Restart policies the engine understands.
pub const RESTART_POLICIES: &[&str] = &["no", "always", "on-failure", "unless-stopped"];

/// Split `policy[:retries]` and check both parts.
///
/// Retries are only valid with `on-failure`; a count given both inline and
/// separately must agree.
pub fn parse_restart_policy(raw: &str, retries: Option<u32>) -> specgen_shared::SpecgenResult<(String, Option<u32>)> {
    use specgen_shared::SpecgenError;

    let (policy, inline) = match raw.split_once(':') {
        Some((p, n)) => {
            let n: u32 = n.parse().map_err(|_| {
                SpecgenError::parse(format!("restart policy {:?}: retry count must be a number", raw))
            })?;
            (p, Some(n))
        }
        None => (raw, None),
    };
    if !RESTART_POLICIES.contains(&policy) {
        return Err(SpecgenError::invalid_config(format!(
            "invalid restart policy {:?}: must be one of {}",
            policy,
            RESTART_POLICIES.join(", ")
        )));
    }
    let retries = match (inline, retries) {
        (Some(a), Some(b)) if a != b => {
            return Err(SpecgenError::invalid_config(format!(
                "restart retries given twice with different values ({} and {})",
                a, b
            )));
        }
        (a, b) => a.or(b),
    };
    if retries.is_some() && policy != "on-failure" {
        return Err(SpecgenError::invalid_config(
            "restart retries can only be set with restart policy on-failure",
        ));
    }
    Ok((policy.to_string(), retries))
}

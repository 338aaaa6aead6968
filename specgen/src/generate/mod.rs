//! OCI spec generation.
//!
//! [`compile`] is the entry point. It runs every component against one
//! request and folds the results into an OCI runtime configuration plus the
//! engine [`CreateOption`]s:
//!
//! ```text
//! validate ─► pod ─► namespaces ─► command ─► security ─► resources
//!     ─► devices ─► mounts ─► ports ─► process ─► Spec + options + warnings
//! ```
//!
//! Nothing is returned unless every step succeeds. Host capability gaps are
//! collected as warnings along the way.

pub mod devices;
pub mod mounts;
pub mod namespaces;
pub mod options;
pub mod process;

pub use devices::{DeviceSetup, assemble_devices, parse_device, parse_device_cgroup_rule};
pub use namespaces::{ResolvedNamespaces, namespace_options, resolve_namespaces};
pub use options::{CreateOption, parse_restart_policy};
pub use process::{parse_signal, resolve_command};

use crate::context::CompileContext;
use crate::image::ImageMetadata;
use crate::lookup::PodInfo;
use crate::mounts::{AssembledMounts, assemble_mounts};
use crate::ports::{PortMapping, allocate_ports, parse_port_spec, parse_protocols};
use crate::request::{SpecGenerator, SystemdMode};
use crate::resources::{ResourceTranslator, default_rlimits};
use crate::security::{SecurityNamespaces, assemble_security};
use mounts::DefaultMountOptions;
use oci_spec::runtime::{LinuxBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder};
use serde::Serialize;
use specgen_shared::constants::annotations;
use specgen_shared::constants::paths::INIT_MOUNT;
use specgen_shared::{PortError, SpecgenError, SpecgenResult};
use std::collections::{BTreeMap, HashMap};

/// Result of one successful compilation.
#[derive(Debug, Clone, Serialize)]
pub struct Compiled {
    pub spec: Spec,
    pub options: Vec<CreateOption>,
    pub warnings: Vec<String>,
}

/// Compile `spec` against `image`.
pub fn compile(spec: &SpecGenerator, image: &ImageMetadata, ctx: &CompileContext<'_>) -> SpecgenResult<Compiled> {
    spec.validate()?;
    tracing::debug!(name = %spec.basic.name, image = %spec.storage.image, host = ctx.host.name(), "Compiling container spec");

    let mut warnings = Vec::new();
    let mut options = Vec::new();
    let rootless = ctx.engine.rootless || ctx.host.is_rootless();

    let pod = match spec.basic.pod.as_deref().filter(|p| !p.is_empty()) {
        Some(id) => Some(ctx.lookup.pod(id)?),
        None => None,
    };

    // Namespaces
    let ns = resolve_namespaces(spec, pod.as_ref(), ctx)?;
    if spec.basic.init && !ns.pid.is_private() {
        return Err(SpecgenError::invalid_config(
            "init requires a private PID namespace",
        ));
    }

    // Command
    let command = resolve_command(spec, image)?;
    let systemd = match spec.basic.systemd {
        SystemdMode::Always => true,
        SystemdMode::True => mounts::is_systemd_command(&command.argv()),
        SystemdMode::False => false,
    };
    let mut argv = command.argv();
    if spec.basic.init {
        argv.splice(0..0, [INIT_MOUNT.to_string(), "--".to_string()]);
    }

    // Security
    let security = assemble_security(
        spec,
        image,
        SecurityNamespaces {
            pid: &ns.pid,
            ipc: &ns.ipc,
            uts: &ns.uts,
            network: &ns.network.namespace,
        },
        ctx,
    )?;
    warnings.extend(security.warnings.iter().cloned());

    // Resources
    let mut flags = spec.resources.limits.clone();
    // The engine default only applies where the host can enforce it.
    if flags.pids_limit.is_none() && ctx.engine.pids_limit != 0 && ctx.host.cgroup_features()?.pids_limit {
        flags.pids_limit = Some(ctx.engine.pids_limit);
    }
    let translated = ResourceTranslator::new(ctx.host).translate(&flags)?;
    warnings.extend(translated.warnings.iter().cloned());

    let requested_devices: Vec<String> = ctx
        .engine
        .devices
        .iter()
        .chain(spec.storage.devices.iter())
        .cloned()
        .collect();
    let devices = assemble_devices(
        &requested_devices,
        &spec.storage.device_cgroup_rule,
        spec.security.privileged,
        rootless,
        ctx.host,
    )?;

    let resources = translated.limits.to_oci(ctx.host, devices.rules.clone())?;
    let rlimits = default_rlimits(&ctx.engine.default_ulimits, &flags.ulimit, rootless)?
        .iter()
        .map(|r| r.to_oci())
        .collect::<SpecgenResult<Vec<_>>>()?;

    // Mounts
    let (assembled, volumes_from) = assemble_all_mounts(spec, image, systemd, ctx)?;
    let shm_bytes = crate::resources::parse::parse_size(
        "shm-size",
        spec.storage.shm_size.as_deref().unwrap_or(&ctx.engine.shm_size),
    )?;
    let shm_size = format!("{}k", shm_bytes / 1024);
    let defaults = mounts::default_mounts(
        &ns,
        DefaultMountOptions {
            privileged: spec.security.privileged,
            rootless,
            tty_gid: mounts::tty_gid_available(&spec.security.idmappings, rootless),
            shm_size: &shm_size,
            cgroup_version: ctx.host.cgroup_version()?,
            systemd,
        },
    )?;
    let oci_mounts = mounts::finalize_mounts(defaults, &assembled, &devices.mounts)?;

    // Ports
    let port_mappings = resolve_ports(spec, image, &ns, ctx, &mut warnings)?;

    // Process
    let hostname = resolve_hostname(spec, &ns, pod.as_ref(), ctx)?;
    let env = process::merge_env(process::EnvSources {
        engine: &ctx.engine.env,
        image: &image.env,
        user: &spec.basic.env,
        terminal: spec.basic.terminal,
        hostname: hostname.as_deref(),
    });
    let work_dir = process::resolve_workdir(spec, image)?;
    let user = spec.security.user.clone().unwrap_or_else(|| image.user.clone());
    let stop_signal = process::resolve_stop_signal(spec, image, systemd)?;

    let mut proc = ProcessBuilder::default()
        .terminal(spec.basic.terminal)
        .user(process::build_user(&user, &spec.security.groups, spec.security.umask.as_deref())?)
        .args(argv)
        .env(env)
        .cwd(&work_dir)
        .capabilities(security.oci_capabilities()?)
        .rlimits(rlimits)
        .no_new_privileges(security.no_new_privileges);
    if let Some(profile) = &security.apparmor_profile {
        proc = proc.apparmor_profile(profile);
    }
    if let Some(adj) = spec.resources.oom_score_adj {
        proc = proc.oom_score_adj(adj);
    }
    let proc = proc
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build process spec: {}", e)))?;

    // Linux
    let mut linux = LinuxBuilder::default()
        .namespaces(ns.to_oci()?)
        .resources(resources)
        .devices(devices.devices.clone())
        .masked_paths(security.masked_paths.clone())
        .readonly_paths(security.readonly_paths.clone())
        .sysctl(security.sysctls.clone().into_iter().collect::<HashMap<_, _>>());
    if let Some(seccomp) = security.seccomp.clone() {
        linux = linux.seccomp(seccomp);
    }
    if !spec.security.idmappings.is_empty() {
        let (uid, gid) = process::id_mappings(&spec.security.idmappings)?;
        linux = linux.uid_mappings(uid).gid_mappings(gid);
    }
    let linux = linux
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build linux spec: {}", e)))?;

    let root = RootBuilder::default()
        .path(spec.storage.rootfs.as_deref().unwrap_or("rootfs"))
        .readonly(security.read_only_rootfs)
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build root spec: {}", e)))?;

    let mut builder = SpecBuilder::default()
        .version("1.0.2")
        .root(root)
        .mounts(oci_mounts)
        .process(proc)
        .linux(linux)
        .annotations(build_annotations(spec, &volumes_from, ctx));
    // runtimes refuse a hostname without a private UTS namespace
    if let Some(name) = hostname.as_ref().filter(|_| !ns.uts.is_host()) {
        builder = builder.hostname(name);
    }
    let oci = builder
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build OCI spec: {}", e)))?;

    // Engine options
    options.push(CreateOption::Name(spec.basic.name.clone()));
    if let Some(pod) = &pod {
        options.push(CreateOption::Pod(pod.id.clone()));
    }
    match &spec.storage.rootfs {
        Some(rootfs) => options.push(CreateOption::Rootfs(rootfs.clone())),
        None => options.push(CreateOption::RootfsImage {
            id: image.id.clone(),
            name: spec.storage.image.clone(),
        }),
    }
    options.extend(namespace_options(&ns, pod.as_ref(), ctx)?);
    if ns.publishes_ports() {
        options.push(CreateOption::NetNs {
            port_mappings,
            expose: exposed_ports(spec, image)?,
            networks: ns.network.networks.clone(),
            mode: ns.network.namespace.mode.as_str().to_string(),
        });
    }
    if !ns.network.options.is_empty() {
        options.push(CreateOption::NetworkOptions(ns.network.options.clone()));
    }
    push_storage_options(&mut options, &assembled);
    options.push(CreateOption::Command(command.command.clone()));
    if !command.entrypoint.is_empty() {
        options.push(CreateOption::Entrypoint(command.entrypoint.clone()));
    }
    options.push(CreateOption::WorkDir(work_dir));
    options.push(CreateOption::StopSignal(stop_signal));
    options.push(CreateOption::StopTimeout(
        spec.basic.stop_timeout.unwrap_or(ctx.engine.stop_timeout),
    ));
    push_log_options(&mut options, spec, ctx);
    if !security.selinux_opts.is_empty() {
        options.push(CreateOption::SecLabels(security.selinux_opts.clone()));
    }
    if spec.security.privileged {
        options.push(CreateOption::Privileged);
    }
    if ns.ipc.is_host() {
        options.push(CreateOption::ShmDir("/dev/shm".into()));
    } else {
        options.push(CreateOption::ShmSize(shm_bytes));
    }
    if !spec.security.idmappings.is_empty() {
        options.push(CreateOption::IdMappings(spec.security.idmappings.clone()));
    }
    if !user.is_empty() {
        options.push(CreateOption::User(user));
    }
    if !spec.security.groups.is_empty() {
        options.push(CreateOption::Groups(spec.security.groups.clone()));
    }
    let cgroup_parent = spec
        .cgroup
        .cgroup_parent
        .clone()
        .or_else(|| pod.as_ref().and_then(|p| p.cgroup_parent.clone()));
    if let Some(parent) = cgroup_parent {
        options.push(CreateOption::CgroupParent(parent));
    }
    if let Some(mode) = &spec.cgroup.cgroups_mode {
        options.push(CreateOption::CgroupsMode(mode.clone()));
    }
    push_network_options(&mut options, spec);
    options.push(CreateOption::Labels(merge_labels(spec, image)));
    push_restart_options(&mut options, spec, pod.as_ref())?;
    if !spec.basic.dependencies.is_empty() {
        options.push(CreateOption::Dependencies(spec.basic.dependencies.clone()));
    }
    if let Some(path) = &spec.basic.pid_file {
        options.push(CreateOption::PidFile(path.clone()));
    }
    if systemd {
        options.push(CreateOption::Systemd);
    }
    if spec.basic.init {
        let path = spec.basic.init_path.clone().unwrap_or_else(|| ctx.engine.init_path.clone());
        options.push(CreateOption::Init(path));
    }
    if !spec.basic.exit_command.is_empty() {
        options.push(CreateOption::ExitCommand(spec.basic.exit_command.clone()));
    }
    if let Some(timeout) = spec.basic.timeout {
        options.push(CreateOption::Timeout(timeout));
    }
    if spec.basic.terminal {
        options.push(CreateOption::Terminal);
    }
    if spec.basic.stdin {
        options.push(CreateOption::Stdin);
    }
    if let Some(umask) = &spec.security.umask {
        options.push(CreateOption::Umask(umask.clone()));
    }
    if let Some(name) = hostname {
        options.push(CreateOption::Hostname(name));
    }
    if spec.basic.remove {
        options.push(CreateOption::Volatile);
    }

    tracing::debug!(
        mounts = oci.mounts().as_ref().map_or(0, |m| m.len()),
        options = options.len(),
        warnings = warnings.len(),
        "Compiled container spec"
    );
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    Ok(Compiled {
        spec: oci,
        options,
        warnings,
    })
}

// ============================================================================
// Steps
// ============================================================================

/// User mounts, engine defaults, `volumes_from`, image volumes and the
/// request-driven tmpfs and init mounts, in that precedence.
fn assemble_all_mounts(
    spec: &SpecGenerator,
    image: &ImageMetadata,
    systemd: bool,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<(AssembledMounts, Vec<String>)> {
    let storage = &spec.storage;
    let mut assembled = assemble_mounts(&storage.volumes, &storage.mounts, &storage.tmpfs, ctx.host)?;
    assembled.merge_defaults(&ctx.engine.mounts, ctx.host)?;
    let volumes_from = mounts::add_volumes_from(&mut assembled, &storage.volumes_from, ctx.lookup)?;
    let mode = storage.image_volume_mode.unwrap_or(ctx.engine.image_volume_mode);
    assembled.add_image_volumes(&image.volumes, mode)?;
    mounts::add_request_mounts(spec, &mut assembled, systemd, ctx)?;
    Ok((assembled, volumes_from))
}

fn push_storage_options(options: &mut Vec<CreateOption>, assembled: &AssembledMounts) {
    if !assembled.mounts.is_empty() {
        options.push(CreateOption::UserVolumes(
            assembled.mounts.iter().map(|m| m.destination.clone()).collect(),
        ));
        options.push(CreateOption::UserMounts(assembled.mounts.clone()));
    }
    if !assembled.volumes.is_empty() {
        options.push(CreateOption::NamedVolumes(assembled.volumes.clone()));
    }
    if !assembled.overlay_volumes.is_empty() {
        options.push(CreateOption::OverlayVolumes(assembled.overlay_volumes.clone()));
    }
    if !assembled.image_volumes.is_empty() {
        options.push(CreateOption::ImageVolumes(assembled.image_volumes.clone()));
    }
}

fn push_log_options(options: &mut Vec<CreateOption>, spec: &SpecGenerator, ctx: &CompileContext<'_>) {
    let log = &spec.basic.log_configuration;
    let driver = log.driver.clone().unwrap_or_else(|| ctx.engine.log_driver.clone());
    if !driver.is_empty() {
        options.push(CreateOption::LogDriver(driver));
    }
    if let Some(path) = &log.path {
        options.push(CreateOption::LogPath(path.clone()));
    }
    let tag = log.tag.clone().unwrap_or_else(|| ctx.engine.log_tag.clone());
    if !tag.is_empty() {
        options.push(CreateOption::LogTag(tag));
    }
    if !log.options.is_empty() {
        options.push(CreateOption::LogOptions(log.options.clone()));
    }
}

fn push_network_options(options: &mut Vec<CreateOption>, spec: &SpecGenerator) {
    let net = &spec.network;
    if !net.hostadd.is_empty() {
        options.push(CreateOption::Hosts(net.hostadd.clone()));
    }
    if net.no_hosts {
        options.push(CreateOption::UseImageHosts);
    }
    if !net.dns_server.is_empty() {
        options.push(CreateOption::Dns(net.dns_server.clone()));
    }
    if !net.dns_search.is_empty() {
        options.push(CreateOption::DnsSearch(net.dns_search.clone()));
    }
    if !net.dns_option.is_empty() {
        options.push(CreateOption::DnsOption(net.dns_option.clone()));
    }
}

fn push_restart_options(
    options: &mut Vec<CreateOption>,
    spec: &SpecGenerator,
    pod: Option<&PodInfo>,
) -> SpecgenResult<()> {
    let raw = spec
        .basic
        .restart_policy
        .as_deref()
        .filter(|p| !p.is_empty())
        .or_else(|| pod.and_then(|p| p.restart_policy.as_deref()));
    let Some(raw) = raw else {
        return Ok(());
    };
    let (policy, retries) = parse_restart_policy(raw, spec.basic.restart_tries)?;
    options.push(CreateOption::RestartPolicy(policy));
    if let Some(retries) = retries {
        options.push(CreateOption::RestartRetries(retries));
    }
    Ok(())
}

/// Request labels over image labels.
fn merge_labels(spec: &SpecGenerator, image: &ImageMetadata) -> BTreeMap<String, String> {
    let mut labels = image.labels.clone();
    labels.extend(spec.basic.labels.clone());
    labels
}

fn flag(value: bool) -> String {
    if value { annotations::TRUE } else { annotations::FALSE }.to_string()
}

/// Engine annotations, then request annotations, then the engine's own.
fn build_annotations(
    spec: &SpecGenerator,
    volumes_from: &[String],
    ctx: &CompileContext<'_>,
) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = ctx.engine.annotations.clone().into_iter().collect();
    out.extend(spec.basic.annotations.clone());
    out.insert(annotations::AUTOREMOVE.into(), flag(spec.basic.remove));
    out.insert(annotations::PRIVILEGED.into(), flag(spec.security.privileged));
    if spec.basic.init {
        out.insert(annotations::INIT.into(), flag(true));
    }
    if !volumes_from.is_empty() {
        out.insert(annotations::VOLUMES_FROM.into(), volumes_from.join(","));
    }
    if spec.network.publish_exposed_ports {
        out.insert(annotations::PUBLISH_ALL.into(), flag(true));
    }
    out
}

/// Hostname: request, else the UTS owner's, else the pod's, else the
/// host's for host UTS, else the container name.
fn resolve_hostname(
    spec: &SpecGenerator,
    ns: &ResolvedNamespaces,
    pod: Option<&PodInfo>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<Option<String>> {
    if let Some(name) = spec.basic.hostname.as_deref().filter(|h| !h.is_empty()) {
        if ns.uts.is_host() {
            return Err(SpecgenError::invalid_config(
                "cannot set a hostname when sharing the host UTS namespace",
            ));
        }
        return Ok(Some(name.to_string()));
    }
    if let Some(id) = ns.uts.container_id() {
        let info = ctx.lookup.container(id)?;
        return Ok(Some(info.hostname).filter(|h| !h.is_empty()));
    }
    if ns.uts.is_pod() {
        if let Some(name) = pod.and_then(|p| p.hostname.clone()) {
            return Ok(Some(name));
        }
    }
    if ns.uts.is_host() {
        return ctx.host.hostname().map(Some);
    }
    Ok(Some(spec.basic.name.clone()).filter(|n| !n.is_empty()))
}

/// Parse one `--expose` value: `port[-end][/proto]`.
fn parse_expose(raw: &str) -> SpecgenResult<Vec<(u16, Vec<String>)>> {
    let (ports, protocol) = raw.split_once('/').unwrap_or((raw, ""));
    let protocols = parse_protocols(protocol)?;
    let bad = || PortError::invalid(format!("invalid exposed port {:?}", raw));
    let (start, end) = match ports.split_once('-') {
        Some((s, e)) => (s.parse::<u16>().map_err(|_| bad())?, e.parse::<u16>().map_err(|_| bad())?),
        None => {
            let p = ports.parse::<u16>().map_err(|_| bad())?;
            (p, p)
        }
    };
    if start == 0 || end < start {
        return Err(bad().into());
    }
    Ok((start..=end).map(|p| (p, protocols.clone())).collect())
}

/// Image `EXPOSE` plus `--expose`, grouped by port.
fn exposed_ports(spec: &SpecGenerator, image: &ImageMetadata) -> SpecgenResult<BTreeMap<u16, Vec<String>>> {
    let mut exposed: BTreeMap<u16, Vec<String>> = image
        .exposed()?
        .into_iter()
        .map(|(port, protocols)| (port, protocols.into_iter().collect()))
        .collect();
    for raw in &spec.network.expose {
        for (port, protocols) in parse_expose(raw)? {
            let entry = exposed.entry(port).or_default();
            for protocol in protocols {
                if !entry.contains(&protocol) {
                    entry.push(protocol);
                }
            }
        }
    }
    Ok(exposed)
}

fn resolve_ports(
    spec: &SpecGenerator,
    image: &ImageMetadata,
    ns: &ResolvedNamespaces,
    ctx: &CompileContext<'_>,
    warnings: &mut Vec<String>,
) -> SpecgenResult<Vec<PortMapping>> {
    let mut requested = spec.network.port_mappings.clone();
    for raw in &spec.network.publish {
        requested.push(parse_port_spec(raw)?);
    }
    let publish_all = spec.network.publish_exposed_ports;

    if !ns.publishes_ports() {
        if !requested.is_empty() || publish_all {
            warnings.push(format!(
                "port mappings are ignored with network mode {}",
                ns.network.namespace.mode
            ));
        }
        return Ok(Vec::new());
    }

    let exposed = exposed_ports(spec, image)?;
    let allocated = allocate_ports(&requested, &exposed, publish_all, ctx.picker)?;
    tracing::debug!(count = allocated.len(), "Allocated port mappings");
    Ok(allocated)
}

//! Security assembly: capabilities, seccomp, SELinux, AppArmor and the
//! kernel paths hidden from the container.
//!
//! ```text
//! privileged ──► host capabilities, no seccomp, no masked paths
//!     │
//!     └─ otherwise ─► (base ∪ cap_add) \ cap_drop
//!                      seccomp: unconfined → image label → path → engine → default
//! ```

pub mod capabilities;
pub mod label;
pub mod seccomp;

pub use capabilities::{merge_capabilities, normalize_capability};
pub use label::{dup_label, parse_label_options};
pub use seccomp::SeccompProfile;

use crate::context::CompileContext;
use crate::image::ImageMetadata;
use crate::namespace::Namespace;
use crate::request::{SeccompPolicy, SpecGenerator};
use oci_spec::runtime::{LinuxCapabilities, LinuxCapabilitiesBuilder, LinuxSeccomp};
use specgen_shared::constants::annotations::SECCOMP_PROFILE_LABEL;
use specgen_shared::constants::capabilities::ALL;
use specgen_shared::constants::paths::{MASKED, READONLY};
use specgen_shared::{SecurityError, SpecgenError, SpecgenResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// `seccomp_profile_path` value that disables filtering.
pub const UNCONFINED: &str = "unconfined";

/// Sysctl prefixes scoped to the IPC namespace.
const IPC_SYSCTLS: &[&str] = &[
    "kernel.msgmax",
    "kernel.msgmnb",
    "kernel.msgmni",
    "kernel.sem",
    "kernel.shmall",
    "kernel.shmmax",
    "kernel.shmmni",
    "kernel.shm_rmid_forced",
    "fs.mqueue.",
];

/// Namespaces that decide label inheritance and sysctl legality.
#[derive(Debug, Clone, Copy)]
pub struct SecurityNamespaces<'a> {
    pub pid: &'a Namespace,
    pub ipc: &'a Namespace,
    pub uts: &'a Namespace,
    pub network: &'a Namespace,
}

/// Resolved security settings of one container.
#[derive(Debug, Clone, Default)]
pub struct AssembledSecurity {
    /// Applied to every capability set of the process.
    pub capabilities: BTreeSet<String>,
    pub seccomp: Option<LinuxSeccomp>,
    pub selinux_opts: Vec<String>,
    pub apparmor_profile: Option<String>,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
    pub sysctls: BTreeMap<String, String>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub warnings: Vec<String>,
}

impl AssembledSecurity {
    /// OCI capability section with the same set in all five slots.
    pub fn oci_capabilities(&self) -> SpecgenResult<LinuxCapabilities> {
        let caps = capabilities::to_oci(&self.capabilities);
        LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .effective(caps.clone())
            .inheritable(caps.clone())
            .permitted(caps.clone())
            .ambient(caps)
            .build()
            .map_err(|e| SpecgenError::Internal(format!("Failed to build capabilities: {}", e)))
    }
}

/// Whether `user` (`uid[:gid]` or `name[:group]`) is root. Empty means root.
pub fn is_root_user(user: &str) -> bool {
    let uid = user.split(':').next().unwrap_or("");
    matches!(uid, "" | "0" | "root")
}

/// Compute the security settings for `spec`.
///
/// The effective user is the request's user, else the image's.
pub fn assemble_security(
    spec: &SpecGenerator,
    image: &ImageMetadata,
    namespaces: SecurityNamespaces<'_>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<AssembledSecurity> {
    let sec = &spec.security;
    let mut out = AssembledSecurity {
        no_new_privileges: sec.no_new_privileges,
        read_only_rootfs: sec.read_only_filesystem,
        ..Default::default()
    };

    let user = sec.user.as_deref().unwrap_or(&image.user);
    out.capabilities = resolve_capabilities(spec, user, ctx)?;
    tracing::debug!(
        privileged = sec.privileged,
        user = %user,
        count = out.capabilities.len(),
        "Resolved capabilities"
    );

    out.seccomp = resolve_seccomp(spec, image, &out.capabilities, ctx, &mut out.warnings)?;
    out.selinux_opts = resolve_selinux(spec, namespaces, ctx)?;
    out.apparmor_profile = resolve_apparmor(spec, ctx)?;
    out.sysctls = resolve_sysctls(spec, namespaces, ctx)?;
    let (masked, readonly) = kernel_paths(spec);
    out.masked_paths = masked;
    out.readonly_paths = readonly;

    Ok(out)
}

fn resolve_capabilities(
    spec: &SpecGenerator,
    user: &str,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<BTreeSet<String>> {
    let sec = &spec.security;
    let known = capabilities::all_capability_names();

    if sec.privileged {
        if !sec.cap_add.is_empty() {
            return Err(SecurityError::Conflict(
                "privileged containers cannot be given additional capabilities".into(),
            )
            .into());
        }
        let host: BTreeSet<String> = ctx.host.capabilities().into_iter().collect();
        return Ok(known.into_iter().filter(|c| host.contains(c)).collect());
    }

    let base: &[String] = if is_root_user(user) {
        &ctx.engine.default_capabilities
    } else {
        &[]
    };
    merge_capabilities(base, &sec.cap_add, &sec.cap_drop, &known)
}

fn resolve_seccomp(
    spec: &SpecGenerator,
    image: &ImageMetadata,
    caps: &BTreeSet<String>,
    ctx: &CompileContext<'_>,
    warnings: &mut Vec<String>,
) -> SpecgenResult<Option<LinuxSeccomp>> {
    let sec = &spec.security;
    let path = sec.seccomp_profile_path.as_deref().filter(|p| !p.is_empty());

    if sec.privileged || path == Some(UNCONFINED) {
        tracing::debug!("Seccomp disabled");
        return Ok(None);
    }
    if !ctx.host.supports_seccomp() {
        if path.is_some() || sec.seccomp_policy == SeccompPolicy::Image {
            return Err(SpecgenError::invalid_config(
                "a seccomp profile was requested but the host does not support seccomp",
            ));
        }
        warnings.push("seccomp is not supported by the host; running without a filter".into());
        return Ok(None);
    }

    let profile = if sec.seccomp_policy == SeccompPolicy::Image {
        let value = image
            .labels
            .get(SECCOMP_PROFILE_LABEL)
            .or_else(|| image.annotations.get(SECCOMP_PROFILE_LABEL))
            .ok_or_else(|| SecurityError::NoSeccompPolicy {
                image: image.name.clone(),
                label: SECCOMP_PROFILE_LABEL.to_string(),
            })?;
        tracing::debug!(image = %image.name, "Using seccomp profile from image label");
        if value.starts_with('/') {
            SeccompProfile::load(Path::new(value))?
        } else {
            SeccompProfile::from_json(SECCOMP_PROFILE_LABEL, value)?
        }
    } else if let Some(path) = path {
        tracing::debug!(path = %path, "Using seccomp profile from request");
        SeccompProfile::load(Path::new(path))?
    } else if let Some(path) = &ctx.engine.seccomp_profile {
        tracing::debug!(path = %path.display(), "Using engine seccomp profile");
        SeccompProfile::load(path)?
    } else {
        SeccompProfile::default_profile()
    };

    profile.compile(caps).map(Some)
}

fn resolve_selinux(
    spec: &SpecGenerator,
    ns: SecurityNamespaces<'_>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<Vec<String>> {
    let mut opts = parse_label_options(&spec.security.selinux_opts)?;
    if label::is_disabled(&opts) {
        return Ok(opts);
    }

    if ns.pid.is_host() || ns.ipc.is_host() {
        tracing::debug!("Sharing host PID or IPC namespace, disabling SELinux separation");
        opts.push(label::LABEL_DISABLE.to_string());
        return Ok(opts);
    }

    if opts.is_empty() {
        let owner = ns.pid.container_id().or_else(|| ns.ipc.container_id());
        if let Some(id) = owner {
            let info = ctx.lookup.container(id)?;
            tracing::debug!(container = %id, label = %info.process_label, "Inheriting process label");
            return dup_label(&info.process_label);
        }
        if spec.security.privileged {
            opts.push(label::LABEL_DISABLE.to_string());
        }
    }
    Ok(opts)
}

fn resolve_apparmor(spec: &SpecGenerator, ctx: &CompileContext<'_>) -> SpecgenResult<Option<String>> {
    let requested = spec.security.apparmor_profile.as_deref().filter(|p| !p.is_empty());
    if !ctx.host.apparmor_enabled() {
        return match requested {
            Some(p) if p != UNCONFINED => Err(SpecgenError::invalid_config(format!(
                "apparmor profile {:?} requested but apparmor is not enabled on the host",
                p
            ))),
            _ => Ok(None),
        };
    }
    Ok(match requested {
        Some(p) => Some(p.to_string()),
        None if spec.security.privileged => Some(UNCONFINED.to_string()),
        None if ctx.engine.apparmor_profile.is_empty() => None,
        None => Some(ctx.engine.apparmor_profile.clone()),
    })
}

fn is_ipc_sysctl(key: &str) -> bool {
    IPC_SYSCTLS
        .iter()
        .any(|p| if p.ends_with('.') { key.starts_with(p) } else { key == *p })
}

/// Check that a sysctl can be set given the namespaces the container joins.
fn sysctl_allowed(key: &str, ns: SecurityNamespaces<'_>) -> Result<(), String> {
    if key.starts_with("net.") && ns.network.is_host() {
        return Err(format!("sysctl {:?} cannot be set with the host network namespace", key));
    }
    if is_ipc_sysctl(key) && ns.ipc.is_host() {
        return Err(format!("sysctl {:?} cannot be set with the host IPC namespace", key));
    }
    if (key == "kernel.hostname" || key == "kernel.domainname") && ns.uts.is_host() {
        return Err(format!("sysctl {:?} cannot be set with the host UTS namespace", key));
    }
    Ok(())
}

fn resolve_sysctls(
    spec: &SpecGenerator,
    ns: SecurityNamespaces<'_>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<BTreeMap<String, String>> {
    let mut sysctls = BTreeMap::new();
    for entry in &ctx.engine.default_sysctls {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| SpecgenError::parse(format!("invalid engine sysctl {:?}", entry)))?;
        let key = key.trim();
        // Engine defaults that conflict with a shared namespace are skipped.
        if sysctl_allowed(key, ns).is_ok() {
            sysctls.insert(key.to_string(), value.trim().to_string());
        }
    }
    for (key, value) in &spec.basic.sysctl {
        sysctl_allowed(key, ns).map_err(SpecgenError::InvalidConfig)?;
        sysctls.insert(key.clone(), value.clone());
    }
    Ok(sysctls)
}

/// Masked and read-only kernel paths, honouring `mask` and `unmask`.
fn kernel_paths(spec: &SpecGenerator) -> (Vec<String>, Vec<String>) {
    let sec = &spec.security;
    let unmask_all = sec.unmask.iter().any(|u| u == ALL);
    let keep = |path: &&str| !unmask_all && !sec.unmask.iter().any(|u| u == path);

    let (mut masked, readonly) = if sec.privileged {
        (Vec::new(), Vec::new())
    } else {
        (
            MASKED.iter().copied().filter(keep).map(|p| p.to_string()).collect::<Vec<_>>(),
            READONLY.iter().copied().filter(keep).map(|p| p.to_string()).collect(),
        )
    };
    for path in &sec.mask {
        if !masked.contains(path) {
            masked.push(path.clone());
        }
    }
    (masked, readonly)
}

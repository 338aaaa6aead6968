//! Per-family namespace resolution.
//!
//! Request value, else pod membership, else the engine default. The result
//! feeds the OCI namespace list and the `*NsFrom` creation options.

use super::options::CreateOption;
use crate::context::CompileContext;
use crate::lookup::PodInfo;
use crate::namespace::{
    Namespace, NamespaceFamily, NamespaceMode, NetworkSelection, parse_cgroup_namespace,
    parse_for_family, parse_ipc_namespace, parse_network_flags, parse_user_namespace,
};
use crate::request::SpecGenerator;
use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceBuilder};
use specgen_shared::constants::container::DEFAULT_NETWORK;
use specgen_shared::{SpecgenError, SpecgenResult};

/// Every namespace of one container, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNamespaces {
    pub pid: Namespace,
    pub ipc: Namespace,
    pub uts: Namespace,
    pub user: Namespace,
    pub cgroup: Namespace,
    pub mount: Namespace,
    pub network: NetworkSelection,
}

impl ResolvedNamespaces {
    pub fn get(&self, family: NamespaceFamily) -> &Namespace {
        match family {
            NamespaceFamily::Pid => &self.pid,
            NamespaceFamily::Ipc => &self.ipc,
            NamespaceFamily::Uts => &self.uts,
            NamespaceFamily::User => &self.user,
            NamespaceFamily::Cgroup => &self.cgroup,
            NamespaceFamily::Network => &self.network.namespace,
            NamespaceFamily::Mount => &self.mount,
        }
    }

    /// Whether ports can be published for this network mode.
    pub fn publishes_ports(&self) -> bool {
        !matches!(
            self.network.namespace.mode,
            NamespaceMode::Host
                | NamespaceMode::FromContainer
                | NamespaceMode::FromPod
                | NamespaceMode::NoNetwork
                | NamespaceMode::Path
        )
    }

    /// OCI namespace entries. Host namespaces are omitted; path namespaces
    /// carry their path.
    pub fn to_oci(&self) -> SpecgenResult<Vec<LinuxNamespace>> {
        let mut out = Vec::new();
        for family in NamespaceFamily::ALL {
            let ns = self.get(family);
            if ns.is_host() {
                continue;
            }
            let mut builder = LinuxNamespaceBuilder::default().typ(family.oci_type());
            if ns.is_path() {
                builder = builder.path(ns.value.clone());
            }
            out.push(builder.build().map_err(|e| {
                SpecgenError::Internal(format!("Failed to build {} namespace: {}", family, e))
            })?);
        }
        Ok(out)
    }
}

fn request_value(spec: &SpecGenerator, family: NamespaceFamily) -> Option<&str> {
    match family {
        NamespaceFamily::Pid => spec.basic.pidns.as_deref(),
        NamespaceFamily::Ipc => spec.storage.ipcns.as_deref(),
        NamespaceFamily::Uts => spec.basic.utsns.as_deref(),
        NamespaceFamily::User => spec.security.userns.as_deref(),
        NamespaceFamily::Cgroup => spec.cgroup.cgroupns.as_deref(),
        NamespaceFamily::Network | NamespaceFamily::Mount => None,
    }
}

fn parse_family(raw: &str, family: NamespaceFamily, ctx: &CompileContext<'_>) -> SpecgenResult<Namespace> {
    match family {
        NamespaceFamily::Ipc => parse_ipc_namespace(raw),
        NamespaceFamily::User => parse_user_namespace(raw),
        NamespaceFamily::Cgroup => parse_cgroup_namespace(raw, ctx.host.cgroup_version()?),
        _ => parse_for_family(raw, family),
    }
}

fn resolve_one(
    spec: &SpecGenerator,
    family: NamespaceFamily,
    pod: Option<&PodInfo>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<Namespace> {
    if family == NamespaceFamily::Mount {
        return Ok(Namespace::new(NamespaceMode::Private));
    }
    let ns = match request_value(spec, family) {
        Some(raw) => parse_family(raw, family, ctx)?,
        None if pod.is_some_and(|p| p.shares(family)) => Namespace::new(NamespaceMode::FromPod),
        None => parse_family(ctx.engine.namespaces.for_family(family), family, ctx)?,
    };
    if ns.is_pod() && pod.is_none() {
        return Err(SpecgenError::invalid_config(format!(
            "cannot join the pod {} namespace: container is not in a pod",
            family
        )));
    }
    Ok(ns)
}

fn resolve_network(
    spec: &SpecGenerator,
    pod: Option<&PodInfo>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<NetworkSelection> {
    let mut selection = if !spec.network.network.is_empty() {
        parse_network_flags(&spec.network.network)?
    } else if pod.is_some_and(|p| p.shares(NamespaceFamily::Network)) {
        NetworkSelection {
            namespace: Namespace::new(NamespaceMode::FromPod),
            ..Default::default()
        }
    } else {
        parse_network_flags(&[ctx.engine.namespaces.netns.as_str()])?
    };

    if selection.namespace.is_default() {
        selection.namespace = Namespace::new(ctx.engine.default_network_mode());
    }
    if selection.namespace.mode == NamespaceMode::Bridge && selection.networks.is_empty() {
        selection
            .networks
            .insert(DEFAULT_NETWORK.to_string(), Default::default());
    }
    if selection.namespace.is_pod() && pod.is_none() {
        return Err(SpecgenError::invalid_config(
            "cannot join the pod network namespace: container is not in a pod",
        ));
    }
    Ok(selection)
}

/// Resolve every namespace family for `spec`.
pub fn resolve_namespaces(
    spec: &SpecGenerator,
    pod: Option<&PodInfo>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<ResolvedNamespaces> {
    let resolved = ResolvedNamespaces {
        pid: resolve_one(spec, NamespaceFamily::Pid, pod, ctx)?,
        ipc: resolve_one(spec, NamespaceFamily::Ipc, pod, ctx)?,
        uts: resolve_one(spec, NamespaceFamily::Uts, pod, ctx)?,
        user: resolve_one(spec, NamespaceFamily::User, pod, ctx)?,
        cgroup: resolve_one(spec, NamespaceFamily::Cgroup, pod, ctx)?,
        mount: resolve_one(spec, NamespaceFamily::Mount, pod, ctx)?,
        network: resolve_network(spec, pod, ctx)?,
    };

    let maps = &spec.security.idmappings;
    if resolved.user.is_private() && (maps.uid_map.is_empty() || maps.gid_map.is_empty()) {
        return Err(SpecgenError::invalid_config(
            "a private user namespace requires both UID and GID mappings",
        ));
    }

    tracing::debug!(
        pid = %resolved.pid,
        ipc = %resolved.ipc,
        uts = %resolved.uts,
        user = %resolved.user,
        cgroup = %resolved.cgroup,
        network = %resolved.network.namespace,
        "Resolved namespaces"
    );
    Ok(resolved)
}

/// `*NsFrom` options for namespaces joined from a container or the pod.
///
/// Container references are checked through the lookup service; pod
/// references resolve to the pod's infra container.
pub fn namespace_options(
    resolved: &ResolvedNamespaces,
    pod: Option<&PodInfo>,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<Vec<CreateOption>> {
    let mut out = Vec::new();
    for family in NamespaceFamily::ALL {
        let ns = resolved.get(family);
        let owner = match ns.mode {
            NamespaceMode::FromContainer => ctx.lookup.container(&ns.value)?.id,
            NamespaceMode::FromPod => {
                let pod = pod.ok_or_else(|| {
                    SpecgenError::invalid_config("pod namespace requested outside a pod")
                })?;
                pod.infra_id.clone().ok_or_else(|| {
                    SpecgenError::invalid_config(format!(
                        "pod {} has no infra container to share the {} namespace",
                        pod.name, family
                    ))
                })?
            }
            _ => continue,
        };
        let option = match family {
            NamespaceFamily::Pid => CreateOption::PidNsFrom(owner),
            NamespaceFamily::Ipc => CreateOption::IpcNsFrom(owner),
            NamespaceFamily::Uts => CreateOption::UtsNsFrom(owner),
            NamespaceFamily::User => CreateOption::UserNsFrom(owner),
            NamespaceFamily::Cgroup => CreateOption::CgroupNsFrom(owner),
            NamespaceFamily::Network => CreateOption::NetNsFrom(owner),
            NamespaceFamily::Mount => continue,
        };
        out.push(option);
    }
    Ok(out)
}

//! Runtime default mounts and the request-driven mount additions.

use super::namespaces::ResolvedNamespaces;
use crate::context::CompileContext;
use crate::host::CgroupVersion;
use crate::lookup::ContainerLookup;
use crate::mounts::{AssembledMounts, OnConflict, ParsedMount, clean_path, supersede};
use crate::request::{IdMappingOptions, SpecGenerator};
use oci_spec::runtime::{Mount, MountBuilder};
use specgen_shared::{SpecgenError, SpecgenResult};

/// Tmpfs destinations systemd expects to own.
pub const SYSTEMD_TMPFS: &[&str] = &["/run", "/run/lock", "/tmp", "/var/log/journal"];

/// Tmpfs destinations added for `read_write_tmpfs` on a read-only rootfs.
pub const READ_WRITE_TMPFS: &[&str] = &["/tmp", "/var/tmp", "/run"];

/// GID of the tty group, owner of `/dev/pts` entries.
const TTY_GID: u32 = 5;

fn build(destination: &str, typ: &str, source: &str, options: &[&str]) -> SpecgenResult<Mount> {
    MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build {} mount: {}", destination, e)))
}

/// Whether the tty group can be used inside the container.
///
/// With explicit GID mappings the group must be mapped. A rootless engine
/// without mappings runs in the invoking user's namespace, where only the
/// user's own group is guaranteed, so the group is assumed missing.
pub fn tty_gid_available(mappings: &IdMappingOptions, rootless: bool) -> bool {
    if !mappings.gid_map.is_empty() {
        return mappings.has_gid(TTY_GID);
    }
    !rootless
}

/// Options shared by every runtime default mount configuration.
#[derive(Debug, Clone, Copy)]
pub struct DefaultMountOptions<'a> {
    pub privileged: bool,
    pub rootless: bool,
    pub tty_gid: bool,
    /// `/dev/shm` size, in runtime mount syntax (e.g. `65536k`).
    pub shm_size: &'a str,
    pub cgroup_version: CgroupVersion,
    /// systemd needs a writable cgroup hierarchy.
    pub systemd: bool,
}

/// Build the mounts every container gets from the runtime.
///
/// `/proc`, `/dev`, `/dev/pts`, `/dev/shm`, `/dev/mqueue`, `/sys` and
/// `/sys/fs/cgroup`, adjusted for host namespaces.
pub fn default_mounts(ns: &ResolvedNamespaces, opts: DefaultMountOptions<'_>) -> SpecgenResult<Vec<Mount>> {
    let mut mounts = vec![
        build("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        build("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"])?,
    ];

    let mut pts = vec!["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"];
    if opts.tty_gid {
        pts.push("gid=5");
    }
    mounts.push(build("/dev/pts", "devpts", "devpts", &pts)?);

    if ns.ipc.is_host() {
        mounts.push(build("/dev/shm", "bind", "/dev/shm", &["rbind", "nosuid", "noexec", "nodev"])?);
        mounts.push(build("/dev/mqueue", "bind", "/dev/mqueue", &["rbind", "nosuid", "noexec", "nodev"])?);
    } else {
        let size = format!("size={}", opts.shm_size);
        mounts.push(build(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", &size],
        )?);
        mounts.push(build("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?);
    }

    let sys_access = if opts.privileged { "rw" } else { "ro" };
    if ns.network.namespace.is_host() && opts.rootless {
        // sysfs cannot be mounted without owning the network namespace.
        mounts.push(build("/sys", "bind", "/sys", &["rbind", "nosuid", "noexec", "nodev", sys_access])?);
    } else {
        mounts.push(build("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", sys_access])?);
    }

    let writable_cgroup = opts.privileged
        || (opts.systemd && opts.cgroup_version == CgroupVersion::V2 && ns.cgroup.is_private());
    let cgroup_access = if writable_cgroup { "rw" } else { "ro" };
    mounts.push(build(
        "/sys/fs/cgroup",
        "cgroup",
        "cgroup",
        &["rprivate", "nosuid", "noexec", "nodev", "relatime", cgroup_access],
    )?);

    Ok(mounts)
}

/// Copy the user mounts of the containers named in `volumes_from`.
///
/// Entries are `id[:ro|rw]`. The mode overrides the copied mounts'
/// read-only flag. Returns the canonical IDs for the annotation.
pub fn add_volumes_from(
    mounts: &mut AssembledMounts,
    volumes_from: &[String],
    lookup: &dyn ContainerLookup,
) -> SpecgenResult<Vec<String>> {
    let mut ids = Vec::with_capacity(volumes_from.len());
    for entry in volumes_from {
        let (id, mode) = match entry.split_once(':') {
            Some((id, mode @ ("ro" | "rw"))) => (id, Some(mode)),
            Some((_, other)) => {
                return Err(SpecgenError::parse(format!(
                    "invalid volumes-from mode {:?}: must be ro or rw",
                    other
                )));
            }
            None => (entry.as_str(), None),
        };
        let info = lookup.container(id)?;
        tracing::debug!(container = %info.id, mounts = info.mounts.len(), volumes = info.volumes.len(), "Copying volumes");

        let apply = |options: &mut Vec<String>| {
            if let Some(mode) = mode {
                options.retain(|o| o != "ro" && o != "rw");
                options.push(mode.to_string());
            }
        };
        for mount in &info.mounts {
            let mut mount = mount.clone();
            apply(&mut mount.options);
            mounts.add(ParsedMount::Mount(mount), OnConflict::Ignore)?;
        }
        for volume in &info.volumes {
            let mut volume = volume.clone();
            apply(&mut volume.options);
            mounts.add(ParsedMount::Volume(volume), OnConflict::Ignore)?;
        }
        ids.push(info.id);
    }
    Ok(ids)
}

/// Whether `command` starts systemd.
pub fn is_systemd_command(command: &[String]) -> bool {
    let Some(first) = command.first() else {
        return false;
    };
    specgen_shared::constants::paths::SYSTEMD_INITS.contains(&first.as_str())
        || first.rsplit('/').next() == Some("systemd")
}

/// Final mount list: runtime defaults superseded by user mounts, followed by
/// user mounts in assembly order.
pub fn finalize_mounts(
    defaults: Vec<Mount>,
    assembled: &AssembledMounts,
    extra: &[crate::mounts::Mount],
) -> SpecgenResult<Vec<Mount>> {
    let mut user: Vec<Mount> = Vec::with_capacity(assembled.mounts.len() + extra.len());
    for mount in assembled.mounts.iter().chain(extra.iter()) {
        user.push(mount.to_oci()?);
    }
    let mut destinations = assembled.destinations();
    destinations.extend(extra.iter().map(|m| clean_path(&m.destination)));

    let mut out = supersede(&destinations, defaults);
    out.extend(user);
    Ok(out)
}

/// Apply request-driven mounts: init binary, systemd and read-write tmpfs.
pub fn add_request_mounts(
    spec: &SpecGenerator,
    mounts: &mut AssembledMounts,
    systemd: bool,
    ctx: &CompileContext<'_>,
) -> SpecgenResult<()> {
    if spec.basic.init {
        let path = spec
            .basic
            .init_path
            .as_deref()
            .unwrap_or(&ctx.engine.init_path);
        mounts.add_init_binary(path)?;
    }
    if systemd {
        mounts.add_tmpfs_defaults(SYSTEMD_TMPFS, &["rw", "rprivate", "nosuid", "nodev"])?;
    }
    if spec.security.read_only_filesystem && spec.storage.read_write_tmpfs {
        mounts.add_tmpfs_defaults(READ_WRITE_TMPFS, &["rw", "rprivate", "nosuid", "nodev"])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{ContainerInfo, PodInfo};
    use crate::mounts::{Mount as UserMount, NamedVolume};
    use crate::namespace::{Namespace, NamespaceMode, NetworkSelection};
    use crate::request::IdMap;
    use specgen_shared::ErrorKind;

    fn private_namespaces() -> ResolvedNamespaces {
        let p = Namespace::new(NamespaceMode::Private);
        ResolvedNamespaces {
            pid: p.clone(),
            ipc: p.clone(),
            uts: p.clone(),
            user: Namespace::new(NamespaceMode::Host),
            cgroup: p.clone(),
            mount: p,
            network: NetworkSelection {
                namespace: Namespace::new(NamespaceMode::Bridge),
                ..Default::default()
            },
        }
    }

    fn options() -> DefaultMountOptions<'static> {
        DefaultMountOptions {
            privileged: false,
            rootless: false,
            tty_gid: true,
            shm_size: "65536k",
            cgroup_version: CgroupVersion::V2,
            systemd: false,
        }
    }

    fn find<'a>(mounts: &'a [Mount], dest: &str) -> &'a Mount {
        mounts
            .iter()
            .find(|m| m.destination().to_string_lossy() == dest)
            .unwrap()
    }

    #[test]
    fn test_default_mounts() {
        let mounts = default_mounts(&private_namespaces(), options()).unwrap();
        assert_eq!(mounts.len(), 7);
        let pts = find(&mounts, "/dev/pts");
        assert!(pts.options().as_ref().unwrap().contains(&"gid=5".to_string()));
        let shm = find(&mounts, "/dev/shm");
        assert!(shm.options().as_ref().unwrap().contains(&"size=65536k".to_string()));
        let cgroup = find(&mounts, "/sys/fs/cgroup");
        assert!(cgroup.options().as_ref().unwrap().contains(&"ro".to_string()));
    }

    #[test]
    fn test_tty_gid_heuristic() {
        let mut opts = options();
        opts.tty_gid = false;
        let mounts = default_mounts(&private_namespaces(), opts).unwrap();
        let pts = find(&mounts, "/dev/pts");
        assert!(!pts.options().as_ref().unwrap().iter().any(|o| o.starts_with("gid=")));

        let mut mappings = IdMappingOptions {
            uid_map: vec![IdMap::parse("0:100000:1").unwrap()],
            gid_map: vec![IdMap::parse("0:100000:1").unwrap()],
        };
        assert!(!tty_gid_available(&mappings, false));
        mappings.gid_map = vec![IdMap::parse("0:100000:65536").unwrap()];
        assert!(tty_gid_available(&mappings, true));
        assert!(!tty_gid_available(&IdMappingOptions::default(), true));
        assert!(tty_gid_available(&IdMappingOptions::default(), false));
    }

    #[test]
    fn test_host_ipc_binds_shm() {
        let mut ns = private_namespaces();
        ns.ipc = Namespace::new(NamespaceMode::Host);
        let mounts = default_mounts(&ns, options()).unwrap();
        assert_eq!(find(&mounts, "/dev/shm").typ().as_deref(), Some("bind"));
    }

    #[test]
    fn test_finalize_supersedes() {
        let defaults = default_mounts(&private_namespaces(), options()).unwrap();
        let mut assembled = AssembledMounts::default();
        assembled
            .add(
                ParsedMount::Mount(UserMount::tmpfs("/dev/shm").with_options(["size=1g"])),
                OnConflict::Error,
            )
            .unwrap();
        let mounts = finalize_mounts(defaults, &assembled, &[]).unwrap();
        let shm: Vec<_> = mounts
            .iter()
            .filter(|m| m.destination().to_string_lossy() == "/dev/shm")
            .collect();
        assert_eq!(shm.len(), 1);
        assert!(shm[0].options().as_ref().unwrap().contains(&"size=1g".to_string()));

        let mut assembled = AssembledMounts::default();
        assembled
            .add(ParsedMount::Mount(UserMount::bind("/dev", "/dev")), OnConflict::Error)
            .unwrap();
        let defaults = default_mounts(&private_namespaces(), options()).unwrap();
        let mounts = finalize_mounts(defaults, &assembled, &[]).unwrap();
        assert!(!mounts.iter().any(|m| m.destination().to_string_lossy().starts_with("/dev/")));
    }

    struct Source;

    impl ContainerLookup for Source {
        fn container(&self, id: &str) -> SpecgenResult<ContainerInfo> {
            match id {
                "data" => Ok(ContainerInfo {
                    id: "0123abcd".into(),
                    mounts: vec![UserMount::bind("/srv/data", "/data").with_options(["rw"])],
                    volumes: vec![NamedVolume {
                        name: "cache".into(),
                        destination: "/cache".into(),
                        options: Vec::new(),
                    }],
                    ..Default::default()
                }),
                _ => Err(SpecgenError::container_not_found(id, "no such container")),
            }
        }

        fn pod(&self, id: &str) -> SpecgenResult<PodInfo> {
            Err(SpecgenError::pod_not_found(id, "no such pod"))
        }
    }

    #[test]
    fn test_volumes_from() {
        let mut mounts = AssembledMounts::default();
        let ids = add_volumes_from(&mut mounts, &["data:ro".to_string()], &Source).unwrap();
        assert_eq!(ids, vec!["0123abcd"]);
        assert_eq!(mounts.mounts[0].options, vec!["ro"]);
        assert_eq!(mounts.volumes[0].options, vec!["ro"]);

        let err = add_volumes_from(&mut mounts, &["ghost".to_string()], &Source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LookupFailure);
        let err = add_volumes_from(&mut mounts, &["data:z".to_string()], &Source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn test_is_systemd_command() {
        assert!(is_systemd_command(&["/sbin/init".to_string()]));
        assert!(is_systemd_command(&["/usr/lib/systemd/systemd".to_string()]));
        assert!(!is_systemd_command(&["/bin/sh".to_string()]));
        assert!(!is_systemd_command(&[]));
    }
}

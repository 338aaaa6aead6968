//! Integration tests for end-to-end compilation.

use specgen::generate::CreateOption;
use specgen::host::{CgroupFeatures, StaticHost};
use specgen::lookup::{ContainerInfo, PodInfo};
use specgen::mounts::Mount;
use specgen::namespace::NamespaceFamily;
use specgen::request::IdMap;
use specgen::{CompileContext, Compiled, EngineConfig, ErrorKind, ImageMetadata, SpecGenerator, SpecgenResult, compile};
use specgen_shared::constants::annotations;
use specgen_test_utils::{
    BLOCK_MOUNT_PROFILE, FakeHost, FakeLookup, SequencePortPicker, alpine_image, engine,
    host_with_devices, nginx_image, request, seccomp_profile_file,
};

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct TestContext {
    engine: EngineConfig,
    host: FakeHost,
    lookup: FakeLookup,
    picker: SequencePortPicker,
}

impl TestContext {
    fn new() -> Self {
        Self::with_host(host_with_devices())
    }

    fn with_host(host: StaticHost) -> Self {
        Self {
            engine: engine(),
            host: FakeHost::new(host),
            lookup: FakeLookup::new(),
            picker: SequencePortPicker::new([40000, 40001, 40002]),
        }
    }

    fn compile(&self, spec: &SpecGenerator, image: &ImageMetadata) -> SpecgenResult<Compiled> {
        let ctx = CompileContext::new(&self.engine)
            .with_host(&self.host)
            .with_lookup(&self.lookup)
            .with_picker(&self.picker);
        compile(spec, image, &ctx)
    }
}

fn mount_destinations(compiled: &Compiled) -> Vec<String> {
    compiled
        .spec
        .mounts()
        .as_ref()
        .map(|mounts| {
            mounts
                .iter()
                .map(|m| m.destination().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn find_option<'a>(compiled: &'a Compiled, name: &str) -> Option<&'a CreateOption> {
    compiled.options.iter().find(|o| o.name() == name)
}

fn port_mappings(compiled: &Compiled) -> Vec<specgen::PortMapping> {
    match find_option(compiled, "net_ns") {
        Some(CreateOption::NetNs { port_mappings, .. }) => port_mappings.clone(),
        _ => Vec::new(),
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

#[test]
fn structural_errors_fail_before_host_probes() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "bad");
    spec.storage.rootfs = Some("/srv/rootfs".into());

    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert!(!ctx.host.probed(), "host was probed: {:?}", ctx.host.calls());
}

#[test]
fn privileged_with_cap_add_is_rejected() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "priv");
    spec.security.privileged = true;
    spec.security.cap_add = vec!["NET_ADMIN".into()];
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

// ============================================================================
// PROCESS
// ============================================================================

#[test]
fn image_defaults_fill_process() {
    let ctx = TestContext::new();
    let compiled = ctx.compile(&request("nginx", "web"), &nginx_image()).unwrap();

    let process = compiled.spec.process().as_ref().unwrap();
    assert_eq!(
        process.args().as_ref().unwrap(),
        &vec!["/docker-entrypoint.sh", "nginx", "-g", "daemon off;"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(process.cwd().to_string_lossy(), "/usr/share/nginx/html");
    assert!(compiled.options.contains(&CreateOption::StopSignal(libc::SIGQUIT)));
    assert!(compiled.options.contains(&CreateOption::StopTimeout(10)));

    let env = process.env().as_ref().unwrap();
    assert!(env.contains(&"container=podman".to_string()));
    assert!(env.contains(&"HOSTNAME=web".to_string()));

    // Image VOLUME becomes an anonymous volume.
    match find_option(&compiled, "named_volumes") {
        Some(CreateOption::NamedVolumes(volumes)) => {
            assert_eq!(volumes[0].destination, "/var/cache/nginx");
            assert!(volumes[0].name.is_empty());
        }
        other => panic!("expected named volumes, got {:?}", other),
    }
}

#[test]
fn default_capabilities_and_kernel_paths() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "caps");
    spec.security.cap_add = vec!["net_admin".into()];
    spec.security.cap_drop = vec!["CAP_CHOWN".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    let caps = compiled
        .spec
        .process()
        .as_ref()
        .unwrap()
        .capabilities()
        .as_ref()
        .unwrap()
        .bounding()
        .clone()
        .unwrap();
    let names: Vec<String> = caps.iter().map(|c| c.to_string()).collect();
    assert!(names.iter().any(|c| c.contains("NET_ADMIN")));
    assert!(!names.iter().any(|c| c.contains("CHOWN")));

    let linux = compiled.spec.linux().as_ref().unwrap();
    assert!(linux.masked_paths().as_ref().unwrap().contains(&"/proc/kcore".to_string()));
    assert!(linux.readonly_paths().as_ref().unwrap().contains(&"/proc/sys".to_string()));
    assert!(linux.seccomp().is_some());
}

#[test]
fn privileged_gets_every_device_and_no_filters() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "priv");
    spec.security.privileged = true;
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    let linux = compiled.spec.linux().as_ref().unwrap();
    assert_eq!(linux.devices().as_ref().unwrap().len(), 5);
    assert!(linux.seccomp().is_none());
    assert!(linux.masked_paths().as_ref().unwrap().is_empty());

    let rules = linux.resources().as_ref().unwrap().devices().clone().unwrap();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].allow());

    let annots = compiled.spec.annotations().as_ref().unwrap();
    assert_eq!(annots[annotations::PRIVILEGED], annotations::TRUE);
    assert!(compiled.options.contains(&CreateOption::Privileged));
}

#[test]
fn requested_devices_follow_deny_all() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "gpu");
    spec.storage.devices = vec!["/dev/dri".into(), "/dev/fuse:/dev/fuse:rw".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    let linux = compiled.spec.linux().as_ref().unwrap();
    let paths: Vec<String> = linux
        .devices()
        .as_ref()
        .unwrap()
        .iter()
        .map(|d| d.path().display().to_string())
        .collect();
    assert_eq!(paths, vec!["/dev/dri/card0", "/dev/dri/renderD128", "/dev/fuse"]);

    let rules = linux.resources().as_ref().unwrap().devices().clone().unwrap();
    assert!(!rules[0].allow());
    assert_eq!(rules.len(), 4);
}

#[test]
fn seccomp_profile_from_file() {
    let ctx = TestContext::new();
    let profile = seccomp_profile_file(BLOCK_MOUNT_PROFILE);
    let mut spec = request("alpine", "sec");
    spec.security.seccomp_profile_path = Some(profile.path().display().to_string());
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    let seccomp = compiled.spec.linux().as_ref().unwrap().seccomp().clone().unwrap();
    assert_eq!(seccomp.default_action(), oci_spec::runtime::LinuxSeccompAction::ScmpActAllow);
}

// ============================================================================
// MOUNTS
// ============================================================================

#[test]
fn identical_volume_and_mount_merge() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "vol");
    spec.storage.volumes = vec!["/host:/ctr:ro".into()];
    spec.storage.mounts = vec!["type=bind,src=/host,target=/ctr,ro=true".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();
    let count = mount_destinations(&compiled).iter().filter(|d| *d == "/ctr").count();
    assert_eq!(count, 1);

    spec.storage.mounts = vec!["type=bind,src=/host,target=/ctr,ro=false".into()];
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictError);
}

#[test]
fn user_mount_supersedes_runtime_default() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "shm");
    spec.storage.tmpfs = vec!["/dev/shm:size=1g".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();
    let destinations = mount_destinations(&compiled);
    assert_eq!(destinations.iter().filter(|d| *d == "/dev/shm").count(), 1);
    assert!(destinations.contains(&"/proc".to_string()));
}

#[test]
fn volumes_from_copies_mounts() {
    let ctx = TestContext::new();
    ctx.lookup.add_container(ContainerInfo {
        id: "4f2a9c".into(),
        name: "data".into(),
        mounts: vec![Mount::bind("/srv/data", "/data")],
        ..Default::default()
    });
    let mut spec = request("alpine", "consumer");
    spec.storage.volumes_from = vec!["data:ro".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert!(mount_destinations(&compiled).contains(&"/data".to_string()));
    let annots = compiled.spec.annotations().as_ref().unwrap();
    assert_eq!(annots[annotations::VOLUMES_FROM], "4f2a9c");
}

#[test]
fn tty_group_dropped_without_mapping() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "userns");
    spec.security.userns = Some("private".into());
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    spec.security.idmappings.uid_map = vec![IdMap::parse("0:100000:1").unwrap()];
    spec.security.idmappings.gid_map = vec![IdMap::parse("0:100000:1").unwrap()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();
    let pts = compiled
        .spec
        .mounts()
        .as_ref()
        .unwrap()
        .iter()
        .find(|m| m.destination().to_string_lossy() == "/dev/pts")
        .cloned()
        .unwrap();
    assert!(!pts.options().as_ref().unwrap().contains(&"gid=5".to_string()));
    assert!(find_option(&compiled, "id_mappings").is_some());
}

// ============================================================================
// PORTS
// ============================================================================

#[test]
fn adjacent_ports_join() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "ports");
    spec.network.publish = vec!["8080:80".into(), "8081:81".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();
    let mappings = port_mappings(&compiled);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].host_port, 8080);
    assert_eq!(mappings[0].container_port, 80);
    assert_eq!(mappings[0].range, 2);
}

#[test]
fn overlapping_ports_conflict() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "ports");
    spec.network.publish = vec!["8080-8089:80-89".into(), "8081:60".into()];
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictError);
    assert!(err.to_string().contains("8081"));
}

#[test]
fn publish_all_uses_image_exposed_ports() {
    let ctx = TestContext::new();
    let mut spec = request("nginx", "web");
    spec.network.publish_exposed_ports = true;
    let compiled = ctx.compile(&spec, &nginx_image()).unwrap();
    let mappings = port_mappings(&compiled);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].container_port, 80);
    assert_eq!(mappings[0].host_port, 40000);

    let annots = compiled.spec.annotations().as_ref().unwrap();
    assert_eq!(annots[annotations::PUBLISH_ALL], annotations::TRUE);
}

#[test]
fn random_port_exhaustion() {
    let mut ctx = TestContext::new();
    ctx.picker = SequencePortPicker::repeating(8080, 20);
    let mut spec = request("alpine", "ports");
    spec.network.publish = vec!["8080:80".into(), "81".into()];
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    assert!(err.to_string().contains("container port 81"), "{err}");
    assert!(ctx.picker.remaining() < 20);
}

// ============================================================================
// NAMESPACES AND LOOKUPS
// ============================================================================

#[test]
fn joining_container_namespaces() {
    let ctx = TestContext::with_host(host_with_devices().with_selinux(true));
    ctx.lookup.add_container(ContainerInfo {
        id: "9b1e77".into(),
        name: "db".into(),
        process_label: "system_u:system_r:container_t:s0:c1,c2".into(),
        hostname: "db-host".into(),
        ..Default::default()
    });
    let mut spec = request("alpine", "sidecar");
    spec.basic.pidns = Some("container:db".into());
    spec.basic.utsns = Some("container:db".into());
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert!(compiled.options.contains(&CreateOption::PidNsFrom("9b1e77".into())));
    assert!(compiled.options.contains(&CreateOption::UtsNsFrom("9b1e77".into())));
    assert_eq!(compiled.spec.hostname().as_deref(), Some("db-host"));
    match find_option(&compiled, "sec_labels") {
        Some(CreateOption::SecLabels(labels)) => {
            assert!(labels.contains(&"type:container_t".to_string()));
        }
        other => panic!("expected inherited labels, got {:?}", other),
    }
}

#[test]
fn host_uts_leaves_spec_hostname_unset() {
    let ctx = TestContext::with_host(host_with_devices().with_hostname("build-host"));
    let mut spec = request("alpine", "hostuts");
    spec.basic.utsns = Some("host".into());
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert!(compiled.spec.hostname().is_none());
    let env = compiled.spec.process().as_ref().unwrap().env().as_ref().unwrap();
    assert!(env.contains(&"HOSTNAME=build-host".to_string()));
}

#[test]
fn missing_container_is_lookup_failure() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "orphan");
    spec.basic.pidns = Some("container:ghost".into());
    let err = ctx.compile(&spec, &alpine_image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LookupFailure);
}

#[test]
fn pod_members_share_pod_namespaces() {
    let ctx = TestContext::new();
    ctx.lookup.add_pod(PodInfo {
        id: "e3d1".into(),
        name: "web".into(),
        shared_namespaces: [NamespaceFamily::Network, NamespaceFamily::Ipc].into(),
        infra_id: Some("infra-e3d1".into()),
        cgroup_parent: Some("machine.slice".into()),
        ..Default::default()
    });
    let mut spec = request("alpine", "member");
    spec.basic.pod = Some("web".into());
    spec.network.publish = vec!["8080:80".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert!(compiled.options.contains(&CreateOption::Pod("e3d1".into())));
    assert!(compiled.options.contains(&CreateOption::NetNsFrom("infra-e3d1".into())));
    assert!(compiled.options.contains(&CreateOption::IpcNsFrom("infra-e3d1".into())));
    assert!(compiled.options.contains(&CreateOption::CgroupParent("machine.slice".into())));
    assert_eq!(compiled.warnings.len(), 1, "{:?}", compiled.warnings);
}

// ============================================================================
// RESOURCES
// ============================================================================

#[test]
fn unsupported_limits_downgrade_to_warnings() {
    let ctx = TestContext::with_host(host_with_devices().with_features(CgroupFeatures::none()));
    let mut spec = request("alpine", "limits");
    spec.resources.limits.memory = Some("512m".into());
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert_eq!(compiled.warnings.len(), 1, "{:?}", compiled.warnings);
    let resources = compiled.spec.linux().as_ref().unwrap().resources().clone().unwrap();
    assert!(resources.memory().as_ref().and_then(|m| m.limit()).is_none());
}

#[test]
fn weight_device_range_checked() {
    let ctx = TestContext::new();
    let mut spec = request("alpine", "blkio");
    spec.resources.limits.blkio_weight_device = vec!["/dev/sda:500".into()];
    assert!(ctx.compile(&spec, &alpine_image()).is_ok());

    for bad in ["/dev/sda:5", "/dev/sda:1500"] {
        spec.resources.limits.blkio_weight_device = vec![bad.into()];
        assert!(ctx.compile(&spec, &alpine_image()).is_err(), "{bad}");
    }
}

#[test]
fn rootless_devices_become_binds() {
    let mut ctx = TestContext::new();
    ctx.engine = EngineConfig::rootless();
    let mut spec = request("alpine", "rootless");
    spec.storage.devices = vec!["/dev/fuse".into()];
    let compiled = ctx.compile(&spec, &alpine_image()).unwrap();

    assert!(compiled.spec.linux().as_ref().unwrap().devices().as_ref().is_none_or(|d| d.is_empty()));
    assert!(mount_destinations(&compiled).contains(&"/dev/fuse".to_string()));
    let rlimits = compiled.spec.process().as_ref().unwrap().rlimits().clone().unwrap_or_default();
    assert!(rlimits.is_empty());
}

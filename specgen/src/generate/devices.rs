//! Device nodes and device cgroup rules.
//!
//! Privileged containers get every host device and an allow-all rule.
//! Everything else starts from deny-all and opens one rule per requested
//! device. Rootless engines cannot create device nodes, so requested devices
//! become bind mounts instead.

use crate::host::{DeviceKind, HostDevice, HostIntrospector};
use crate::mounts::Mount;
use oci_spec::runtime::{
    LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType,
};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::path::Path;

const DEFAULT_PERMISSIONS: &str = "rwm";

/// A `src[:dst][:perms]` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub source: String,
    pub destination: String,
    pub permissions: String,
}

fn is_permissions(s: &str) -> bool {
    !s.is_empty() && s.len() <= 3 && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm'))
}

/// Parse `src[:dst][:perms]`. A lone second field that looks like
/// permissions is taken as such.
pub fn parse_device(raw: &str) -> SpecgenResult<DeviceRequest> {
    let parts: Vec<&str> = raw.split(':').collect();
    let bad = |why: &str| SpecgenError::parse(format!("invalid device {:?}: {}", raw, why));

    let (source, destination, permissions) = match parts.as_slice() {
        [src] => (*src, *src, DEFAULT_PERMISSIONS),
        [src, second] if is_permissions(second) => (*src, *src, *second),
        [src, dst] => (*src, *dst, DEFAULT_PERMISSIONS),
        [src, dst, perms] => {
            if !is_permissions(perms) {
                return Err(bad("permissions must be a combination of r, w and m"));
            }
            (*src, *dst, *perms)
        }
        _ => return Err(bad("expected src[:dst][:perms]")),
    };
    if !source.starts_with('/') {
        return Err(bad("source must be an absolute path"));
    }
    if !destination.starts_with('/') {
        return Err(bad("destination must be an absolute path"));
    }
    Ok(DeviceRequest {
        source: source.to_string(),
        destination: destination.to_string(),
        permissions: permissions.to_string(),
    })
}

fn oci_type(kind: DeviceKind) -> LinuxDeviceType {
    match kind {
        DeviceKind::Char => LinuxDeviceType::C,
        DeviceKind::Block => LinuxDeviceType::B,
    }
}

/// Parse a device cgroup rule `type major:minor access`.
///
/// `type` is `a`, `b` or `c`; major and minor may be `*`.
pub fn parse_device_cgroup_rule(raw: &str) -> SpecgenResult<LinuxDeviceCgroup> {
    let bad = |why: &str| SpecgenError::parse(format!("invalid device cgroup rule {:?}: {}", raw, why));
    let fields: Vec<&str> = raw.split_whitespace().collect();
    let [typ, numbers, access] = fields.as_slice() else {
        return Err(bad("expected \"type major:minor access\""));
    };

    let typ = match *typ {
        "a" => LinuxDeviceType::A,
        "b" => LinuxDeviceType::B,
        "c" => LinuxDeviceType::C,
        _ => return Err(bad("type must be a, b or c")),
    };
    let (major, minor) = numbers
        .split_once(':')
        .ok_or_else(|| bad("expected major:minor"))?;
    let number = |n: &str| -> SpecgenResult<Option<i64>> {
        match n {
            "*" => Ok(None),
            n => n.parse().map(Some).map_err(|_| bad("major and minor must be numbers or *")),
        }
    };
    if !is_permissions(access) {
        return Err(bad("access must be a combination of r, w and m"));
    }

    let mut builder = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .access(access.to_string());
    if let Some(major) = number(major)? {
        builder = builder.major(major);
    }
    if let Some(minor) = number(minor)? {
        builder = builder.minor(minor);
    }
    builder
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build device cgroup rule: {}", e)))
}

fn allow_rule(device: &HostDevice, access: &str) -> SpecgenResult<LinuxDeviceCgroup> {
    LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(oci_type(device.kind))
        .major(device.major)
        .minor(device.minor)
        .access(access.to_string())
        .build()
        .map_err(|e| {
            SpecgenError::Internal(format!("Failed to build device rule for {}: {}", device.path, e))
        })
}

fn blanket_rule(allow: bool) -> SpecgenResult<LinuxDeviceCgroup> {
    LinuxDeviceCgroupBuilder::default()
        .allow(allow)
        .access(DEFAULT_PERMISSIONS.to_string())
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build device rule: {}", e)))
}

fn linux_device(device: &HostDevice, destination: &str) -> SpecgenResult<LinuxDevice> {
    LinuxDeviceBuilder::default()
        .path(destination)
        .typ(oci_type(device.kind))
        .major(device.major)
        .minor(device.minor)
        .file_mode(device.file_mode)
        .uid(device.uid)
        .gid(device.gid)
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build device {}: {}", destination, e)))
}

/// Devices, cgroup rules and (rootless) bind mounts of one container.
#[derive(Debug, Clone, Default)]
pub struct DeviceSetup {
    pub devices: Vec<LinuxDevice>,
    pub rules: Vec<LinuxDeviceCgroup>,
    pub mounts: Vec<Mount>,
}

impl DeviceSetup {
    fn has_destination(&self, destination: &str) -> bool {
        self.devices.iter().any(|d| d.path() == Path::new(destination))
            || self.mounts.iter().any(|m| m.destination == destination)
    }

    fn add(&mut self, device: &HostDevice, destination: &str, access: &str, rootless: bool) -> SpecgenResult<()> {
        if self.has_destination(destination) {
            return Ok(());
        }
        if rootless {
            self.mounts.push(
                Mount::bind(&device.path, destination).with_options(["bind", "nosuid", "noexec"]),
            );
            return Ok(());
        }
        self.devices.push(linux_device(device, destination)?);
        self.rules.push(allow_rule(device, access)?);
        Ok(())
    }
}

/// Build the device configuration.
///
/// `requested` are `src[:dst][:perms]` strings (engine defaults first, then
/// the request); directory sources expand to every device below them.
pub fn assemble_devices(
    requested: &[String],
    cgroup_rules: &[String],
    privileged: bool,
    rootless: bool,
    host: &dyn HostIntrospector,
) -> SpecgenResult<DeviceSetup> {
    let mut setup = DeviceSetup::default();

    if privileged {
        setup.rules.push(blanket_rule(true)?);
        if !rootless {
            for device in host.devices_under(Path::new("/dev"))? {
                setup.devices.push(linux_device(&device, &device.path)?);
            }
        }
    } else {
        setup.rules.push(blanket_rule(false)?);
    }

    for raw in requested {
        let request = parse_device(raw)?;
        let source = Path::new(&request.source);
        if host.is_dir(source) {
            let devices = host.devices_under(source)?;
            tracing::debug!(source = %request.source, count = devices.len(), "Expanding device directory");
            for device in devices {
                let relative = device
                    .path
                    .strip_prefix(request.source.trim_end_matches('/'))
                    .unwrap_or(&device.path);
                let destination = format!("{}{}", request.destination.trim_end_matches('/'), relative);
                setup.add(&device, &destination, &request.permissions, rootless)?;
            }
        } else {
            let device = host.stat_device(source)?;
            setup.add(&device, &request.destination, &request.permissions, rootless)?;
        }
    }

    if !privileged {
        for raw in cgroup_rules {
            setup.rules.push(parse_device_cgroup_rule(raw)?);
        }
    }
    Ok(setup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use specgen_shared::ErrorKind;

    fn host() -> StaticHost {
        StaticHost::default()
            .with_char_device("/dev/fuse", 10, 229)
            .with_char_device("/dev/snd/controlC0", 116, 2)
            .with_char_device("/dev/snd/pcmC0D0p", 116, 3)
            .with_block_device("/dev/sda", 8, 0)
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_device() {
        assert_eq!(
            parse_device("/dev/fuse").unwrap(),
            DeviceRequest {
                source: "/dev/fuse".into(),
                destination: "/dev/fuse".into(),
                permissions: "rwm".into()
            }
        );
        assert_eq!(parse_device("/dev/fuse:r").unwrap().permissions, "r");
        assert_eq!(parse_device("/dev/sda:/dev/xvda").unwrap().destination, "/dev/xvda");
        assert_eq!(parse_device("/dev/sda:/dev/xvda:rw").unwrap().permissions, "rw");
        assert!(parse_device("/dev/sda:/dev/xvda:rwx").is_err());
        assert!(parse_device("dev/sda").is_err());
        assert!(parse_device("/a:/b:r:x").is_err());
    }

    #[test]
    fn test_parse_cgroup_rule() {
        let rule = parse_device_cgroup_rule("c 10:* rwm").unwrap();
        assert_eq!(rule.typ(), Some(LinuxDeviceType::C));
        assert_eq!(rule.major(), Some(10));
        assert_eq!(rule.minor(), None);
        assert!(rule.allow());

        for bad in ["x 1:2 r", "c 1 r", "c a:b r", "c 1:2 q", "c 1:2"] {
            assert_eq!(parse_device_cgroup_rule(bad).unwrap_err().kind(), ErrorKind::ParseError, "{bad}");
        }
    }

    #[test]
    fn test_unprivileged_deny_first() {
        let setup = assemble_devices(&strings(&["/dev/fuse"]), &strings(&["b 8:* r"]), false, false, &host()).unwrap();
        assert_eq!(setup.devices.len(), 1);
        assert_eq!(setup.rules.len(), 3);
        assert!(!setup.rules[0].allow());
        assert_eq!(setup.rules[1].major(), Some(10));
        assert_eq!(setup.rules[1].minor(), Some(229));
    }

    #[test]
    fn test_directory_expansion() {
        let setup = assemble_devices(&strings(&["/dev/snd:/dev/audio"]), &[], false, false, &host()).unwrap();
        let paths: Vec<_> = setup.devices.iter().map(|d| d.path().display().to_string()).collect();
        assert_eq!(paths, vec!["/dev/audio/controlC0", "/dev/audio/pcmC0D0p"]);
    }

    #[test]
    fn test_privileged_all_devices() {
        let setup = assemble_devices(&[], &strings(&["c 1:1 r"]), true, false, &host()).unwrap();
        assert_eq!(setup.devices.len(), 4);
        assert_eq!(setup.rules.len(), 1);
        assert!(setup.rules[0].allow());
    }

    #[test]
    fn test_rootless_binds() {
        let setup = assemble_devices(&strings(&["/dev/fuse"]), &[], false, true, &host()).unwrap();
        assert!(setup.devices.is_empty());
        assert_eq!(setup.mounts.len(), 1);
        assert_eq!(setup.mounts[0].destination, "/dev/fuse");
    }

    #[test]
    fn test_missing_device() {
        let err = assemble_devices(&strings(&["/dev/nvidia0"]), &[], false, false, &host()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LookupFailure);
    }
}

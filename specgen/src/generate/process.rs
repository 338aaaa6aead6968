//! Process-level settings: argv, environment, user, working directory,
//! hostname and stop signal.

use crate::image::ImageMetadata;
use crate::request::{IdMappingOptions, SpecGenerator};
use nix::sys::signal::Signal;
use oci_spec::runtime::{LinuxIdMapping, LinuxIdMappingBuilder, User, UserBuilder};
use specgen_shared::constants::container::{DEFAULT_PATH, DEFAULT_WORKDIR, ENGINE_NAME};
use specgen_shared::{SpecgenError, SpecgenResult};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Resolved argv with the parts it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
}

impl ResolvedCommand {
    pub fn argv(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.command.iter()).cloned().collect()
    }
}

/// `entrypoint ++ command`, each falling back to the image.
///
/// An explicit entrypoint (even empty) replaces the image's and drops the
/// image's command, so `--entrypoint ""` with no command is an error.
pub fn resolve_command(spec: &SpecGenerator, image: &ImageMetadata) -> SpecgenResult<ResolvedCommand> {
    let (entrypoint, inherit_cmd) = match &spec.basic.entrypoint {
        Some(ep) => (ep.clone(), false),
        None => (image.entrypoint.clone(), true),
    };
    let command = if !spec.basic.command.is_empty() {
        spec.basic.command.clone()
    } else if inherit_cmd {
        image.cmd.clone()
    } else {
        Vec::new()
    };

    let resolved = ResolvedCommand { entrypoint, command };
    if resolved.entrypoint.is_empty() && resolved.command.is_empty() {
        return Err(SpecgenError::NoCommand);
    }
    Ok(resolved)
}

fn split_env(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

/// Environment inputs in precedence order.
#[derive(Debug, Clone, Copy)]
pub struct EnvSources<'a> {
    pub engine: &'a [String],
    pub image: &'a [String],
    pub user: &'a BTreeMap<String, String>,
    pub terminal: bool,
    pub hostname: Option<&'a str>,
}

/// Merge engine, image and user environment; later sources win.
///
/// `container` always names the engine. `TERM`, `HOSTNAME` and `PATH` are
/// only filled in when nothing else set them.
pub fn merge_env(sources: EnvSources<'_>) -> Vec<String> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();
    for entry in sources.engine.iter().chain(sources.image.iter()) {
        let (k, v) = split_env(entry);
        if !k.is_empty() {
            env.insert(k.to_string(), v.to_string());
        }
    }
    for (k, v) in sources.user {
        env.insert(k.clone(), v.clone());
    }

    env.entry("PATH".into()).or_insert_with(|| DEFAULT_PATH.to_string());
    if sources.terminal {
        env.entry("TERM".into()).or_insert_with(|| "xterm".to_string());
    }
    if let Some(hostname) = sources.hostname {
        env.entry("HOSTNAME".into()).or_insert_with(|| hostname.to_string());
    }
    env.insert("container".into(), ENGINE_NAME.to_string());

    env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Request working directory, else the image's, else `/`.
pub fn resolve_workdir(spec: &SpecGenerator, image: &ImageMetadata) -> SpecgenResult<String> {
    let dir = spec
        .storage
        .work_dir
        .as_deref()
        .filter(|d| !d.is_empty())
        .or(Some(image.working_dir.as_str()).filter(|d| !d.is_empty()))
        .unwrap_or(DEFAULT_WORKDIR);
    if !dir.starts_with('/') {
        return Err(SpecgenError::invalid_config(format!(
            "working directory {:?} must be an absolute path",
            dir
        )));
    }
    Ok(dir.to_string())
}

// ============================================================================
// Signals
// ============================================================================

#[cfg(target_os = "linux")]
fn realtime_range() -> (i32, i32) {
    (libc::SIGRTMIN(), libc::SIGRTMAX())
}

#[cfg(not(target_os = "linux"))]
fn realtime_range() -> (i32, i32) {
    (34, 64)
}

/// Signal systemd expects for a clean shutdown.
pub fn systemd_stop_signal() -> i32 {
    realtime_range().0 + 3
}

/// Parse a signal given as a number, `SIGNAME`, `NAME` or `RTMIN+n`.
pub fn parse_signal(raw: &str) -> SpecgenResult<i32> {
    let bad = || SpecgenError::parse(format!("invalid signal {:?}", raw));
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        let (_, max) = realtime_range();
        if n <= 0 || n > max {
            return Err(bad());
        }
        return Ok(n);
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let (min, max) = realtime_range();
    if let Some(rest) = name.strip_prefix("RTMIN") {
        let offset: i32 = match rest.strip_prefix('+') {
            Some(n) => n.parse().map_err(|_| bad())?,
            None if rest.is_empty() => 0,
            None => return Err(bad()),
        };
        return Some(min + offset).filter(|s| *s <= max).ok_or_else(bad);
    }
    if let Some(rest) = name.strip_prefix("RTMAX") {
        let offset: i32 = match rest.strip_prefix('-') {
            Some(n) => n.parse().map_err(|_| bad())?,
            None if rest.is_empty() => 0,
            None => return Err(bad()),
        };
        return Some(max - offset).filter(|s| *s >= min).ok_or_else(bad);
    }

    Signal::from_str(&format!("SIG{}", name))
        .map(|s| s as i32)
        .map_err(|_| bad())
}

/// Request stop signal, else the image's, else SIGRTMIN+3 under systemd,
/// else SIGTERM.
pub fn resolve_stop_signal(spec: &SpecGenerator, image: &ImageMetadata, systemd: bool) -> SpecgenResult<i32> {
    if let Some(raw) = spec.basic.stop_signal.as_deref().filter(|s| !s.is_empty()) {
        return parse_signal(raw);
    }
    if let Some(raw) = image.stop_signal.as_deref().filter(|s| !s.is_empty()) {
        return parse_signal(raw);
    }
    if systemd {
        return Ok(systemd_stop_signal());
    }
    Ok(Signal::SIGTERM as i32)
}

// ============================================================================
// User
// ============================================================================

/// Parse an octal umask such as `0022`.
pub fn parse_umask(raw: &str) -> SpecgenResult<u32> {
    u32::from_str_radix(raw.trim(), 8)
        .ok()
        .filter(|m| *m <= 0o777)
        .ok_or_else(|| SpecgenError::parse(format!("invalid umask {:?}: must be octal 0000-0777", raw)))
}

/// OCI user for `user` (`uid[:gid]` or names).
///
/// Numeric IDs go straight into the spec. Names are left to the engine,
/// which resolves them against the container's `/etc/passwd`; the spec then
/// carries root until it does.
pub fn build_user(user: &str, groups: &[String], umask: Option<&str>) -> SpecgenResult<User> {
    let (uid, gid) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    let uid: u32 = uid.parse().unwrap_or(0);
    let gid: u32 = match gid {
        Some(g) => g.parse().unwrap_or(0),
        None => 0,
    };

    let mut builder = UserBuilder::default().uid(uid).gid(gid);
    let additional: Vec<u32> = groups.iter().filter_map(|g| g.parse().ok()).collect();
    if !additional.is_empty() {
        builder = builder.additional_gids(additional);
    }
    if let Some(raw) = umask {
        builder = builder.umask(parse_umask(raw)?);
    }
    builder
        .build()
        .map_err(|e| SpecgenError::Internal(format!("Failed to build user spec: {}", e)))
}

/// OCI ID mappings for a user namespace.
pub fn id_mappings(options: &IdMappingOptions) -> SpecgenResult<(Vec<LinuxIdMapping>, Vec<LinuxIdMapping>)> {
    let convert = |maps: &[crate::request::IdMap], what: &str| -> SpecgenResult<Vec<LinuxIdMapping>> {
        maps.iter()
            .map(|m| {
                LinuxIdMappingBuilder::default()
                    .container_id(m.container_id)
                    .host_id(m.host_id)
                    .size(m.size)
                    .build()
                    .map_err(|e| SpecgenError::Internal(format!("Failed to build {} mapping: {}", what, e)))
            })
            .collect()
    };
    Ok((convert(&options.uid_map, "UID")?, convert(&options.gid_map, "GID")?))
}

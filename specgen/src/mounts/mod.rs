//! Mount and volume assembly.
//!
//! User storage comes in four destination-keyed classes: plain mounts (bind,
//! tmpfs, ramfs, devpts), named volumes, overlay volumes and image volumes.
//! [`AssembledMounts`] keeps all four and enforces that a destination is
//! claimed at most once across them, after path cleaning.
//!
//! ```text
//! --volume / --mount / --tmpfs   → OnConflict::Error   (identical repeats accepted)
//! engine default mounts          → OnConflict::Ignore  (user input wins)
//! image VOLUME declarations      → skipped when the destination is taken
//! ```

pub mod glob;
pub mod parse;

use crate::host::HostIntrospector;
use oci_spec::runtime::MountBuilder;
use serde::{Deserialize, Serialize};
use specgen_shared::constants::paths::INIT_MOUNT;
use specgen_shared::{MountError, SpecgenError, SpecgenResult};
use std::collections::BTreeSet;

pub use parse::{
    MountType, ParsedMount, parse_mount, parse_tmpfs, parse_volume, validate_volume_options,
};

// ============================================================================
// Mount Classes
// ============================================================================

/// Filesystem type of a plain mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Tmpfs,
    Ramfs,
    Devpts,
}

impl MountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountKind::Bind => "bind",
            MountKind::Tmpfs => "tmpfs",
            MountKind::Ramfs => "ramfs",
            MountKind::Devpts => "devpts",
        }
    }
}

/// A bind, tmpfs, ramfs or devpts mount requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            kind: MountKind::Bind,
            source: source.into(),
            options: Vec::new(),
        }
    }

    pub fn tmpfs(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            kind: MountKind::Tmpfs,
            source: "tmpfs".to_string(),
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Options as handed to the runtime, with kernel defaults filled in.
    pub fn finalized_options(&self) -> Vec<String> {
        finalize_options(self.kind, &self.options)
    }

    pub fn to_oci(&self) -> SpecgenResult<oci_spec::runtime::Mount> {
        MountBuilder::default()
            .destination(&self.destination)
            .typ(self.kind.as_str())
            .source(&self.source)
            .options(self.finalized_options())
            .build()
            .map_err(|e| {
                SpecgenError::Internal(format!(
                    "Failed to build mount {} → {}: {}",
                    self.source, self.destination, e
                ))
            })
    }
}

/// An engine-managed volume. An empty name means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVolume {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Host directory mounted as the lower layer of an overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayVolume {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Contents of another image mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVolume {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// How image `VOLUME` declarations are materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVolumeMode {
    /// Anonymous named volume.
    #[default]
    Anonymous,
    Tmpfs,
    Ignore,
}

/// Lexically clean an absolute path: collapse separators, drop `.`,
/// resolve `..` without climbing above `/`.
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn has_any(options: &[String], wanted: &[&str]) -> bool {
    options.iter().any(|o| wanted.contains(&o.as_str()))
}

const PROPAGATION: &[&str] = &[
    "shared",
    "rshared",
    "private",
    "rprivate",
    "slave",
    "rslave",
    "unbindable",
    "runbindable",
];

/// Fill in the kernel defaults a runtime expects for each mount type.
///
/// Bind mounts become recursive and private unless told otherwise. Tmpfs
/// mounts default to `rw,noexec,nosuid,nodev,rprivate` and copy up the
/// image contents unless `notmpcopyup` is given.
pub fn finalize_options(kind: MountKind, options: &[String]) -> Vec<String> {
    let mut out: Vec<String> = options.to_vec();
    match kind {
        MountKind::Bind => {
            if !has_any(&out, &["bind", "rbind"]) {
                out.push("rbind".to_string());
            }
            if !has_any(&out, PROPAGATION) {
                out.push("rprivate".to_string());
            }
        }
        MountKind::Tmpfs => {
            let copy_up = !has_any(&out, &["notmpcopyup"]);
            out.retain(|o| o != "notmpcopyup" && o != "tmpcopyup");
            for (option, opposite) in [("rw", "ro"), ("noexec", "exec"), ("nosuid", "suid"), ("nodev", "dev")] {
                if !has_any(&out, &[option, opposite]) {
                    out.push(option.to_string());
                }
            }
            if !has_any(&out, PROPAGATION) {
                out.push("rprivate".to_string());
            }
            if copy_up {
                out.push("tmpcopyup".to_string());
            }
        }
        MountKind::Ramfs | MountKind::Devpts => {}
    }
    out
}

// ============================================================================
// Assembly
// ============================================================================

/// What to do when a destination is already claimed by something different.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Error,
    Ignore,
}

/// Every user storage request, keyed by cleaned destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledMounts {
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub volumes: Vec<NamedVolume>,
    #[serde(default)]
    pub overlay_volumes: Vec<OverlayVolume>,
    #[serde(default)]
    pub image_volumes: Vec<ImageVolume>,
}

fn destination_of(item: &ParsedMount) -> &str {
    match item {
        ParsedMount::Mount(m) => &m.destination,
        ParsedMount::Volume(v) => &v.destination,
        ParsedMount::Overlay(o) => &o.destination,
        ParsedMount::Image(i) => &i.destination,
        ParsedMount::Glob { pattern, .. } => pattern,
    }
}

/// Same item with options sorted, so option order does not matter.
fn normalized(item: &ParsedMount) -> ParsedMount {
    let mut item = item.clone();
    match &mut item {
        ParsedMount::Mount(m) => m.options.sort(),
        ParsedMount::Volume(v) => v.options.sort(),
        ParsedMount::Overlay(o) => o.options.sort(),
        ParsedMount::Glob { options, .. } => options.sort(),
        ParsedMount::Image(_) => {}
    }
    item
}

impl AssembledMounts {
    /// Every claimed destination.
    pub fn destinations(&self) -> BTreeSet<String> {
        self.mounts
            .iter()
            .map(|m| m.destination.clone())
            .chain(self.volumes.iter().map(|v| v.destination.clone()))
            .chain(self.overlay_volumes.iter().map(|o| o.destination.clone()))
            .chain(self.image_volumes.iter().map(|i| i.destination.clone()))
            .collect()
    }

    pub fn contains_destination(&self, destination: &str) -> bool {
        let destination = clean_path(destination);
        self.find(&destination).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
            && self.volumes.is_empty()
            && self.overlay_volumes.is_empty()
            && self.image_volumes.is_empty()
    }

    fn find(&self, destination: &str) -> Option<ParsedMount> {
        if let Some(m) = self.mounts.iter().find(|m| m.destination == destination) {
            return Some(ParsedMount::Mount(m.clone()));
        }
        if let Some(v) = self.volumes.iter().find(|v| v.destination == destination) {
            return Some(ParsedMount::Volume(v.clone()));
        }
        if let Some(o) = self.overlay_volumes.iter().find(|o| o.destination == destination) {
            return Some(ParsedMount::Overlay(o.clone()));
        }
        self.image_volumes
            .iter()
            .find(|i| i.destination == destination)
            .map(|i| ParsedMount::Image(i.clone()))
    }

    /// Claim the destination of one resolved item.
    ///
    /// Returns `Ok(true)` if the item was added, `Ok(false)` if it repeated an
    /// identical claim or lost a conflict under [`OnConflict::Ignore`].
    pub fn add(&mut self, item: ParsedMount, on_conflict: OnConflict) -> SpecgenResult<bool> {
        let destination = clean_path(destination_of(&item));
        if let Some(existing) = self.find(&destination) {
            if normalized(&existing) == normalized(&item) {
                tracing::debug!(destination = %destination, "Skipping identical mount");
                return Ok(false);
            }
            return match on_conflict {
                OnConflict::Error => Err(MountError::duplicate(destination).into()),
                OnConflict::Ignore => {
                    tracing::debug!(
                        destination = %destination,
                        "Default mount overridden by user mount"
                    );
                    Ok(false)
                }
            };
        }

        match item {
            ParsedMount::Mount(mut m) => {
                m.destination = destination;
                self.mounts.push(m);
            }
            ParsedMount::Volume(mut v) => {
                v.destination = destination;
                self.volumes.push(v);
            }
            ParsedMount::Overlay(mut o) => {
                o.destination = destination;
                self.overlay_volumes.push(o);
            }
            ParsedMount::Image(mut i) => {
                i.destination = destination;
                self.image_volumes.push(i);
            }
            ParsedMount::Glob { pattern, .. } => {
                return Err(SpecgenError::Internal(format!(
                    "glob {:?} must be expanded before assembly",
                    pattern
                )));
            }
        }
        Ok(true)
    }

    fn add_all(
        &mut self,
        items: Vec<ParsedMount>,
        host: &dyn HostIntrospector,
        on_conflict: OnConflict,
    ) -> SpecgenResult<()> {
        for item in items {
            for resolved in resolve(item, host)? {
                self.add(resolved, on_conflict)?;
            }
        }
        Ok(())
    }

    /// Merge engine default mounts (`--mount` syntax). Conflicts are ignored.
    pub fn merge_defaults(
        &mut self,
        defaults: &[String],
        host: &dyn HostIntrospector,
    ) -> SpecgenResult<()> {
        let parsed = defaults
            .iter()
            .map(|raw| parse_mount(raw))
            .collect::<SpecgenResult<Vec<_>>>()?;
        self.add_all(parsed, host, OnConflict::Ignore)
    }

    /// Add image `VOLUME` declarations according to `mode`.
    pub fn add_image_volumes(&mut self, declared: &[String], mode: ImageVolumeMode) -> SpecgenResult<()> {
        if mode == ImageVolumeMode::Ignore {
            return Ok(());
        }
        for dest in declared {
            let destination = clean_path(dest);
            if self.find(&destination).is_some() {
                tracing::debug!(destination = %destination, "Image volume superseded by user mount");
                continue;
            }
            let item = match mode {
                ImageVolumeMode::Tmpfs => ParsedMount::Mount(Mount::tmpfs(&destination)),
                _ => ParsedMount::Volume(NamedVolume {
                    name: String::new(),
                    destination,
                    options: ["rprivate", "rw", "nodev", "exec"].map(String::from).to_vec(),
                }),
            };
            self.add(item, OnConflict::Ignore)?;
        }
        Ok(())
    }

    /// Add tmpfs mounts at `destinations` unless already claimed.
    pub fn add_tmpfs_defaults(&mut self, destinations: &[&str], options: &[&str]) -> SpecgenResult<()> {
        for dest in destinations {
            if self.find(&clean_path(dest)).is_none() {
                let mount = Mount::tmpfs(*dest).with_options(options.iter().copied());
                self.add(ParsedMount::Mount(mount), OnConflict::Ignore)?;
            }
        }
        Ok(())
    }

    /// Bind the init binary at its fixed location.
    pub fn add_init_binary(&mut self, host_path: &str) -> SpecgenResult<()> {
        let mount = Mount::bind(host_path, INIT_MOUNT).with_options(["bind", "ro"]);
        if self.find(INIT_MOUNT).is_some() {
            return Err(MountError::duplicate(INIT_MOUNT).into());
        }
        self.add(ParsedMount::Mount(mount), OnConflict::Error)?;
        Ok(())
    }
}

/// Expand globs and make relative bind sources absolute.
fn resolve(item: ParsedMount, host: &dyn HostIntrospector) -> SpecgenResult<Vec<ParsedMount>> {
    match item {
        ParsedMount::Mount(mut m) if m.kind == MountKind::Bind => {
            m.source = absolutize(&m.source, host)?;
            Ok(vec![ParsedMount::Mount(m)])
        }
        ParsedMount::Overlay(mut o) => {
            o.source = absolutize(&o.source, host)?;
            Ok(vec![ParsedMount::Overlay(o)])
        }
        ParsedMount::Glob {
            pattern,
            destination,
            options,
        } => {
            let matches = host.glob(&pattern)?;
            tracing::debug!(pattern = %pattern, matches = matches.len(), "Resolved glob mount");
            Ok(matches
                .into_iter()
                .map(|source| {
                    let target = match &destination {
                        Some(dir) => {
                            let base = source.rsplit('/').next().unwrap_or(&source);
                            clean_path(&format!("{}/{}", dir, base))
                        }
                        None => source.clone(),
                    };
                    ParsedMount::Mount(Mount::bind(source, target).with_options(options.clone()))
                })
                .collect())
        }
        other => Ok(vec![other]),
    }
}

fn absolutize(source: &str, host: &dyn HostIntrospector) -> SpecgenResult<String> {
    if source.starts_with('/') {
        return Ok(clean_path(source));
    }
    let cwd = host.current_dir()?;
    Ok(clean_path(&format!("{}/{}", cwd, source)))
}

/// Parse and combine `--volume`, `--mount` and `--tmpfs` values.
///
/// Any destination claimed twice with a different source or options is a
/// [`MountError::DuplicateDest`].
pub fn assemble_mounts(
    volumes: &[String],
    mounts: &[String],
    tmpfs: &[String],
    host: &dyn HostIntrospector,
) -> SpecgenResult<AssembledMounts> {
    let mut parsed = Vec::with_capacity(volumes.len() + mounts.len() + tmpfs.len());
    for raw in volumes {
        parsed.push(parse_volume(raw)?);
    }
    for raw in mounts {
        parsed.push(parse_mount(raw)?);
    }
    for raw in tmpfs {
        parsed.push(ParsedMount::Mount(parse_tmpfs(raw)?));
    }

    let mut assembled = AssembledMounts::default();
    assembled.add_all(parsed, host, OnConflict::Error)?;
    tracing::debug!(
        mounts = assembled.mounts.len(),
        volumes = assembled.volumes.len(),
        overlays = assembled.overlay_volumes.len(),
        images = assembled.image_volumes.len(),
        "Assembled user mounts"
    );
    Ok(assembled)
}

/// Combine runtime default mounts with user mounts.
///
/// Defaults whose destination a user mount claims are dropped. A user
/// mount at `/dev` drops every default below `/dev/`.
pub fn supersede(
    user: &BTreeSet<String>,
    defaults: Vec<oci_spec::runtime::Mount>,
) -> Vec<oci_spec::runtime::Mount> {
    let mount_dev = user.contains("/dev");
    defaults
        .into_iter()
        .filter(|m| {
            let dest = clean_path(&m.destination().to_string_lossy());
            if user.contains(&dest) {
                tracing::debug!(destination = %dest, "Default mount superseded");
                return false;
            }
            !(mount_dev && dest.starts_with("/dev/"))
        })
        .collect()
}

//! `--volume`, `--mount` and `--tmpfs` syntax.
//!
//! ```text
//! --volume [src:]dest[:opts]         src "/" or "." → bind (overlay with O), else named volume
//! --mount  type=<t>,key[=value],...  t ∈ bind, tmpfs, ramfs, devpts, volume, image, glob
//! --tmpfs  dest[:opts]
//! ```

use super::{ImageVolume, Mount, MountKind, NamedVolume, OverlayVolume, clean_path};
use specgen_shared::{MountError, SpecgenResult};
use std::collections::HashSet;

/// `type=` token of a `--mount` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Bind,
    Tmpfs,
    Ramfs,
    Devpts,
    Volume,
    Image,
    Glob,
}

impl MountType {
    pub fn from_token(token: &str) -> SpecgenResult<Self> {
        match token {
            "bind" => Ok(MountType::Bind),
            "tmpfs" => Ok(MountType::Tmpfs),
            "ramfs" => Ok(MountType::Ramfs),
            "devpts" => Ok(MountType::Devpts),
            "volume" => Ok(MountType::Volume),
            "image" => Ok(MountType::Image),
            "glob" => Ok(MountType::Glob),
            other => Err(MountError::InvalidType(other.to_string()).into()),
        }
    }
}

/// One parsed mount specification, before conflict checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMount {
    Mount(Mount),
    Volume(NamedVolume),
    Overlay(OverlayVolume),
    Image(ImageVolume),
    /// Expands to one bind mount per matching host path.
    Glob {
        pattern: String,
        destination: Option<String>,
        options: Vec<String>,
    },
}

/// Mutually exclusive option pairs; each may appear once.
const OPTION_GROUPS: &[&[&str]] = &[
    &["ro", "rw"],
    &["nosuid", "suid"],
    &["nodev", "dev"],
    &["noexec", "exec"],
    &["z", "Z"],
    &["copy", "nocopy"],
    &["bind", "rbind"],
    &["tmpcopyup", "notmpcopyup"],
    &[
        "shared",
        "rshared",
        "private",
        "rprivate",
        "slave",
        "rslave",
        "unbindable",
        "runbindable",
    ],
];

fn option_group(option: &str) -> Option<usize> {
    OPTION_GROUPS.iter().position(|g| g.contains(&option))
}

/// Check options that may only appear once per group.
struct OptionSet {
    options: Vec<String>,
    groups: HashSet<usize>,
}

impl OptionSet {
    fn new() -> Self {
        Self {
            options: Vec::new(),
            groups: HashSet::new(),
        }
    }

    fn push(&mut self, option: impl Into<String>) -> SpecgenResult<()> {
        let option = option.into();
        if let Some(group) = option_group(&option) {
            if !self.groups.insert(group) {
                return Err(MountError::invalid_option(
                    option,
                    format!(
                        "cannot pass more than one of {:?}",
                        OPTION_GROUPS[group].join(", ")
                    ),
                )
                .into());
            }
        } else if self.options.contains(&option) {
            return Err(MountError::invalid_option(option, "passed more than once").into());
        }
        self.options.push(option);
        Ok(())
    }

    fn into_vec(self) -> Vec<String> {
        self.options
    }
}

/// Validate a `--volume` option list.
pub fn validate_volume_options(raw: &str) -> SpecgenResult<Vec<String>> {
    let mut set = OptionSet::new();
    for opt in raw.split(',').filter(|o| !o.is_empty()) {
        let key = opt.split_once('=').map(|(k, _)| k).unwrap_or(opt);
        match key {
            "ro" | "rw" | "nosuid" | "suid" | "nodev" | "dev" | "noexec" | "exec" | "z" | "Z"
            | "copy" | "nocopy" | "bind" | "rbind" | "shared" | "rshared" | "private"
            | "rprivate" | "slave" | "rslave" | "unbindable" | "runbindable" | "O" | "U"
            | "noatime" | "idmap" | "upperdir" | "workdir" => set.push(opt)?,
            _ => return Err(MountError::invalid_option(opt, "invalid option type").into()),
        }
    }
    Ok(set.into_vec())
}

fn check_destination(dest: &str, raw: &str) -> SpecgenResult<String> {
    if dest.is_empty() {
        return Err(MountError::NoDestination.into());
    }
    if !dest.starts_with('/') {
        return Err(MountError::InvalidSyntax(format!(
            "{}: container path {:?} must be absolute",
            raw, dest
        ))
        .into());
    }
    Ok(clean_path(dest))
}

fn is_host_path(src: &str) -> bool {
    src.starts_with('/') || src.starts_with('.')
}

/// Parse one `--volume` value.
pub fn parse_volume(raw: &str) -> SpecgenResult<ParsedMount> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (src, dest, opts) = match parts.as_slice() {
        [dest] => ("", *dest, ""),
        [src, dest] => (*src, *dest, ""),
        [src, dest, opts] => (*src, *dest, *opts),
        _ => return Err(MountError::InvalidSyntax(raw.to_string()).into()),
    };
    if parts.len() > 1 && src.is_empty() {
        return Err(MountError::InvalidSyntax(raw.to_string()).into());
    }

    let destination = check_destination(dest, raw)?;
    let options = validate_volume_options(opts)?;

    if is_host_path(src) {
        if options.iter().any(|o| o == "O") {
            return Ok(ParsedMount::Overlay(OverlayVolume {
                source: src.to_string(),
                destination,
                options: options.into_iter().filter(|o| o != "O").collect(),
            }));
        }
        return Ok(ParsedMount::Mount(Mount {
            destination,
            kind: MountKind::Bind,
            source: src.to_string(),
            options,
        }));
    }

    if options.iter().any(|o| o == "O") {
        return Err(MountError::invalid_option("O", "overlay mounts require a host directory").into());
    }
    Ok(ParsedMount::Volume(NamedVolume {
        name: src.to_string(),
        destination,
        options,
    }))
}

fn parse_bool(key: &str, value: &str) -> SpecgenResult<bool> {
    match value {
        "true" | "" => Ok(true),
        "false" => Ok(false),
        _ => Err(MountError::invalid_option(
            key,
            format!("must be set to true or false, instead received {:?}", value),
        )
        .into()),
    }
}

fn require_value<'a>(key: &str, value: Option<&'a str>) -> SpecgenResult<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MountError::invalid_option(key, "must provide an argument for option").into()),
    }
}

/// Options shared by bind, tmpfs, volume and glob mounts.
///
/// Returns `Ok(false)` for keys it does not recognise.
fn common_option(set: &mut OptionSet, key: &str, value: Option<&str>) -> SpecgenResult<bool> {
    match key {
        "ro" | "readonly" | "read-only" => {
            let ro = parse_bool(key, value.unwrap_or(""))?;
            set.push(if ro { "ro" } else { "rw" })?;
        }
        "rw" | "readwrite" => {
            let rw = parse_bool(key, value.unwrap_or(""))?;
            set.push(if rw { "rw" } else { "ro" })?;
        }
        "nosuid" | "suid" | "nodev" | "dev" | "noexec" | "exec" => {
            if value.is_some() {
                return Err(MountError::invalid_option(key, "does not take a value").into());
            }
            set.push(key)?;
        }
        "U" | "chown" => {
            if parse_bool(key, value.unwrap_or(""))? {
                set.push("U")?;
            }
        }
        "idmap" => match value {
            Some(v) if !v.is_empty() => set.push(format!("idmap={}", v))?,
            _ => set.push("idmap")?,
        },
        _ => return Ok(false),
    }
    Ok(true)
}

fn split_kv(token: &str) -> (&str, Option<&str>) {
    match token.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (token, None),
    }
}

/// Parse one `--mount` value.
pub fn parse_mount(raw: &str) -> SpecgenResult<ParsedMount> {
    let tokens: Vec<&str> = raw.split(',').filter(|t| !t.is_empty()).collect();
    let mut typ = None;
    let mut rest = Vec::new();
    for token in &tokens {
        match split_kv(token) {
            ("type", Some(t)) => {
                if typ.replace(MountType::from_token(t)?).is_some() {
                    return Err(MountError::invalid_option("type", "passed more than once").into());
                }
            }
            kv => rest.push(kv),
        }
    }
    let typ = typ.ok_or_else(|| {
        MountError::InvalidSyntax(format!(
            "{}: should be --mount type=<bind|glob|tmpfs|ramfs|devpts|volume|image>,[src=<host-dir|volume-name>,]target=<ctr-dir>[,options]",
            raw
        ))
    })?;

    match typ {
        MountType::Bind | MountType::Glob => parse_bind_like(typ, &rest),
        MountType::Tmpfs | MountType::Ramfs => parse_tmpfs_like(typ, &rest),
        MountType::Devpts => parse_devpts(&rest),
        MountType::Volume => parse_named_volume(&rest),
        MountType::Image => parse_image(&rest),
    }
}

fn parse_bind_like(typ: MountType, kvs: &[(&str, Option<&str>)]) -> SpecgenResult<ParsedMount> {
    let mut set = OptionSet::new();
    let mut source = None;
    let mut destination = None;

    for &(key, value) in kvs {
        if common_option(&mut set, key, value)? {
            continue;
        }
        match key {
            "src" | "source" => source = Some(require_value(key, value)?.to_string()),
            "target" | "dst" | "destination" => {
                destination = Some(require_value(key, value)?.to_string())
            }
            "bind-propagation" => set.push(require_value(key, value)?)?,
            "bind-nonrecursive" => set.push("bind")?,
            "shared" | "rshared" | "private" | "rprivate" | "slave" | "rslave" | "z" | "Z" => {
                set.push(key)?
            }
            "relabel" => match require_value(key, value)? {
                "shared" => set.push("z")?,
                "private" => set.push("Z")?,
                _ => {
                    return Err(MountError::invalid_option(
                        key,
                        "relabel must be 'private' or 'shared'",
                    )
                    .into());
                }
            },
            "consistency" => {}
            _ => return Err(MountError::invalid_option(key, "unknown mount option").into()),
        }
    }

    let source = source.ok_or_else(|| MountError::invalid_option("src", "must set source"))?;
    let options = set.into_vec();

    if typ == MountType::Glob {
        let destination = match destination {
            Some(d) => Some(check_destination(&d, &d)?),
            None => None,
        };
        return Ok(ParsedMount::Glob {
            pattern: source,
            destination,
            options,
        });
    }

    let destination = destination.ok_or(MountError::NoDestination)?;
    Ok(ParsedMount::Mount(Mount {
        destination: check_destination(&destination, &destination)?,
        kind: MountKind::Bind,
        source,
        options,
    }))
}

fn parse_tmpfs_like(typ: MountType, kvs: &[(&str, Option<&str>)]) -> SpecgenResult<ParsedMount> {
    let mut set = OptionSet::new();
    let mut destination = None;

    for &(key, value) in kvs {
        if common_option(&mut set, key, value)? {
            continue;
        }
        match key {
            "target" | "dst" | "destination" => {
                destination = Some(require_value(key, value)?.to_string())
            }
            "tmpfs-size" => set.push(format!("size={}", require_value(key, value)?))?,
            "tmpfs-mode" => {
                let mode = require_value(key, value)?;
                u32::from_str_radix(mode, 8).map_err(|_| {
                    MountError::invalid_option(key, format!("{:?} is not an octal mode", mode))
                })?;
                set.push(format!("mode={}", mode))?;
            }
            "tmpcopyup" | "notmpcopyup" => set.push(key)?,
            "src" | "source" => {
                return Err(MountError::invalid_option(
                    key,
                    "source is not supported with tmpfs mounts",
                )
                .into());
            }
            _ => return Err(MountError::invalid_option(key, "unknown mount option").into()),
        }
    }

    let destination = destination.ok_or(MountError::NoDestination)?;
    let kind = if typ == MountType::Ramfs {
        MountKind::Ramfs
    } else {
        MountKind::Tmpfs
    };
    Ok(ParsedMount::Mount(Mount {
        destination: check_destination(&destination, &destination)?,
        kind,
        source: kind.as_str().to_string(),
        options: set.into_vec(),
    }))
}

fn parse_devpts(kvs: &[(&str, Option<&str>)]) -> SpecgenResult<ParsedMount> {
    let mut set = OptionSet::new();
    let mut destination = None;

    for &(key, value) in kvs {
        match key {
            "target" | "dst" | "destination" => {
                destination = Some(require_value(key, value)?.to_string())
            }
            "uid" | "gid" | "max" => {
                let v = require_value(key, value)?;
                v.parse::<u32>().map_err(|_| {
                    MountError::invalid_option(key, format!("{:?} is not a number", v))
                })?;
                set.push(format!("{}={}", key, v))?;
            }
            "mode" | "ptxmode" => {
                let v = require_value(key, value)?;
                u32::from_str_radix(v, 8).map_err(|_| {
                    MountError::invalid_option(key, format!("{:?} is not an octal mode", v))
                })?;
                set.push(format!("{}={}", key, v))?;
            }
            "newinstance" => set.push("newinstance")?,
            _ => return Err(MountError::invalid_option(key, "unknown devpts option").into()),
        }
    }

    let destination = destination.ok_or(MountError::NoDestination)?;
    Ok(ParsedMount::Mount(Mount {
        destination: check_destination(&destination, &destination)?,
        kind: MountKind::Devpts,
        source: "devpts".to_string(),
        options: set.into_vec(),
    }))
}

fn parse_named_volume(kvs: &[(&str, Option<&str>)]) -> SpecgenResult<ParsedMount> {
    let mut set = OptionSet::new();
    let mut name = None;
    let mut destination = None;

    for &(key, value) in kvs {
        if common_option(&mut set, key, value)? {
            continue;
        }
        match key {
            "src" | "source" => name = Some(require_value(key, value)?.to_string()),
            "target" | "dst" | "destination" => {
                destination = Some(require_value(key, value)?.to_string())
            }
            "volume-opt" | "subpath" | "volume-subpath" => {
                set.push(format!("{}={}", key, require_value(key, value)?))?
            }
            "nocopy" | "copy" => set.push(key)?,
            _ => return Err(MountError::invalid_option(key, "unknown volume option").into()),
        }
    }

    let destination = destination.ok_or(MountError::NoDestination)?;
    Ok(ParsedMount::Volume(NamedVolume {
        name: name.unwrap_or_default(),
        destination: check_destination(&destination, &destination)?,
        options: set.into_vec(),
    }))
}

fn parse_image(kvs: &[(&str, Option<&str>)]) -> SpecgenResult<ParsedMount> {
    let mut source = None;
    let mut destination = None;
    let mut read_write = false;
    let mut sub_path = None;

    for &(key, value) in kvs {
        match key {
            "src" | "source" => source = Some(require_value(key, value)?.to_string()),
            "target" | "dst" | "destination" => {
                destination = Some(require_value(key, value)?.to_string())
            }
            "rw" | "readwrite" => read_write = parse_bool(key, value.unwrap_or(""))?,
            "subpath" => sub_path = Some(require_value(key, value)?.to_string()),
            _ => return Err(MountError::invalid_option(key, "unknown image option").into()),
        }
    }

    let source = source.ok_or_else(|| MountError::invalid_option("src", "must set source image"))?;
    let destination = destination.ok_or(MountError::NoDestination)?;
    Ok(ParsedMount::Image(ImageVolume {
        source,
        destination: check_destination(&destination, &destination)?,
        read_write,
        sub_path,
    }))
}

/// Parse one `--tmpfs dest[:opts]` value.
pub fn parse_tmpfs(raw: &str) -> SpecgenResult<Mount> {
    let (dest, opts) = match raw.split_once(':') {
        Some((d, o)) => (d, o),
        None => (raw, ""),
    };
    let mut set = OptionSet::new();
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        set.push(opt)?;
    }
    Ok(Mount {
        destination: check_destination(dest, raw)?,
        kind: MountKind::Tmpfs,
        source: "tmpfs".to_string(),
        options: set.into_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgen_shared::{ErrorKind, SpecgenError};

    fn mount(parsed: ParsedMount) -> Mount {
        match parsed {
            ParsedMount::Mount(m) => m,
            other => panic!("expected a mount, got {:?}", other),
        }
    }

    #[test]
    fn test_volume_classification() {
        let bind = mount(parse_volume("/host:/ctr:ro").unwrap());
        assert_eq!(bind.kind, MountKind::Bind);
        assert_eq!(bind.options, vec!["ro"]);

        match parse_volume("data:/var/lib/data").unwrap() {
            ParsedMount::Volume(v) => assert_eq!(v.name, "data"),
            other => panic!("{:?}", other),
        }
        match parse_volume("/var/cache").unwrap() {
            ParsedMount::Volume(v) => {
                assert!(v.name.is_empty());
                assert_eq!(v.destination, "/var/cache");
            }
            other => panic!("{:?}", other),
        }
        match parse_volume("./src:/src:O").unwrap() {
            ParsedMount::Overlay(o) => {
                assert_eq!(o.source, "./src");
                assert!(o.options.is_empty());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_volume_errors() {
        assert!(parse_volume("/a:/b:/c:/d").is_err());
        assert!(parse_volume("/a:relative").is_err());
        assert!(parse_volume("/a:/b:ro,rw").is_err());
        assert!(parse_volume("/a:/b:bogus").is_err());
        assert!(parse_volume("vol:/b:O").is_err());
    }

    #[test]
    fn test_mount_bind_matches_volume() {
        let from_mount = mount(parse_mount("type=bind,src=/host,target=/ctr,ro=true").unwrap());
        let from_volume = mount(parse_volume("/host:/ctr:ro").unwrap());
        assert_eq!(from_mount, from_volume);
    }

    #[test]
    fn test_mount_type_errors() {
        let err = parse_mount("type=nfs,target=/x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert!(matches!(
            err,
            SpecgenError::Mount(MountError::InvalidType(ref t)) if t == "nfs"
        ));

        let err = parse_mount("type=bind,src=/x").unwrap_err();
        assert!(matches!(err, SpecgenError::Mount(MountError::NoDestination)));
        assert!(err.to_string().contains("must set volume destination"));

        assert!(parse_mount("src=/x,target=/y").is_err());
    }

    #[test]
    fn test_mount_tmpfs() {
        let m = mount(parse_mount("type=tmpfs,target=/scratch,tmpfs-size=64m,tmpfs-mode=1777").unwrap());
        assert_eq!(m.kind, MountKind::Tmpfs);
        assert_eq!(m.options, vec!["size=64m", "mode=1777"]);
        assert!(parse_mount("type=tmpfs,src=/x,target=/y").is_err());
        assert!(parse_mount("type=tmpfs,target=/y,tmpfs-mode=999").is_err());
    }

    #[test]
    fn test_mount_devpts_and_image() {
        let m = mount(parse_mount("type=devpts,target=/dev/pts,gid=5,mode=620,newinstance").unwrap());
        assert_eq!(m.kind, MountKind::Devpts);
        assert_eq!(m.options, vec!["gid=5", "mode=620", "newinstance"]);

        match parse_mount("type=image,source=fedora,target=/img,rw=true").unwrap() {
            ParsedMount::Image(img) => {
                assert_eq!(img.source, "fedora");
                assert!(img.read_write);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_mount_relabel_and_propagation() {
        let m = mount(
            parse_mount("type=bind,src=/a,dst=/b,relabel=private,bind-propagation=rshared").unwrap(),
        );
        assert_eq!(m.options, vec!["Z", "rshared"]);
        assert!(parse_mount("type=bind,src=/a,dst=/b,relabel=sometimes").is_err());
        assert!(parse_mount("type=bind,src=/a,dst=/b,ro,rw").is_err());
    }

    #[test]
    fn test_glob() {
        match parse_mount("type=glob,src=/usr/lib/libfoo*,ro").unwrap() {
            ParsedMount::Glob {
                pattern,
                destination,
                options,
            } => {
                assert_eq!(pattern, "/usr/lib/libfoo*");
                assert_eq!(destination, None);
                assert_eq!(options, vec!["ro"]);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_tmpfs_flag() {
        let m = parse_tmpfs("/run:size=10m,noexec").unwrap();
        assert_eq!(m.destination, "/run");
        assert_eq!(m.options, vec!["size=10m", "noexec"]);
        assert!(parse_tmpfs("run").is_err());
    }
}

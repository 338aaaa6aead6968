//! SELinux label options.

use specgen_shared::{SecurityError, SpecgenResult};

/// Keys accepted in `label=<key>:<value>` options.
const LABEL_KEYS: &[&str] = &["user", "role", "type", "level", "filetype"];

/// Option value that turns SELinux separation off.
pub const LABEL_DISABLE: &str = "disable";

/// Validate and normalize `--security-opt label=` values.
///
/// Accepts `disable`, `nested` and `key:value` for the keys above. Values
/// may be given with or without the `label=` prefix.
pub fn parse_label_options(opts: &[String]) -> SpecgenResult<Vec<String>> {
    let mut out = Vec::with_capacity(opts.len());
    for raw in opts {
        let opt = raw.strip_prefix("label=").unwrap_or(raw);
        if opt == LABEL_DISABLE || opt == "nested" {
            out.push(opt.to_string());
            continue;
        }
        match opt.split_once(':') {
            Some((key, value)) if LABEL_KEYS.contains(&key) && !value.is_empty() => {
                out.push(format!("{}:{}", key, value));
            }
            _ => return Err(SecurityError::InvalidLabel(raw.clone()).into()),
        }
    }
    Ok(out)
}

/// Split a process label `user:role:type:level` into label options.
///
/// The level may itself contain colons (`s0:c1,c2`). Empty labels yield
/// no options.
pub fn dup_label(process_label: &str) -> SpecgenResult<Vec<String>> {
    if process_label.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = process_label.splitn(4, ':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(role), Some(typ), level) => {
            let mut out = vec![
                format!("user:{}", user),
                format!("role:{}", role),
                format!("type:{}", typ),
            ];
            if let Some(level) = level.filter(|l| !l.is_empty()) {
                out.push(format!("level:{}", level));
            }
            Ok(out)
        }
        _ => Err(SecurityError::InvalidLabel(process_label.to_string()).into()),
    }
}

/// Whether the options turn SELinux off.
pub fn is_disabled(opts: &[String]) -> bool {
    opts.iter().any(|o| o == LABEL_DISABLE)
}

//! Shell-style glob expansion for `--mount type=glob`.
//!
//! Supports `*`, `?` and `[...]` classes within a path segment. `**` is not
//! special. Walking starts at the deepest directory without wildcards.

use regex::Regex;
use specgen_shared::{MountError, SpecgenResult};
use std::path::Path;
use walkdir::WalkDir;

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// Translate a glob pattern into an anchored regex.
fn to_regex(pattern: &str) -> SpecgenResult<Regex> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                if !closed {
                    return Err(MountError::invalid_option(pattern, "unterminated character class").into());
                }
                out.push(']');
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| MountError::invalid_option(pattern, e.to_string()).into())
}

/// Host paths matching `pattern`, sorted. A pattern without wildcards
/// yields itself when the path exists.
pub fn expand(pattern: &str) -> SpecgenResult<Vec<String>> {
    if !pattern.starts_with('/') {
        return Err(MountError::invalid_option(pattern, "glob source must be an absolute path").into());
    }
    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let literal = segments.iter().take_while(|s| !has_wildcard(s)).count();

    if literal == segments.len() {
        return Ok(if Path::new(pattern).exists() {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        });
    }

    let base = format!("/{}", segments[..literal].join("/"));
    let depth = segments.len() - literal;
    let matcher = to_regex(&format!("/{}", segments.join("/")))?;

    let mut matches: Vec<String> = WalkDir::new(&base)
        .min_depth(depth)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.path().to_str().map(str::to_string))
        .filter(|path| matcher.is_match(path))
        .collect();
    matches.sort();
    tracing::debug!(pattern, count = matches.len(), "Expanded glob");
    Ok(matches)
}

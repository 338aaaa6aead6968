pub mod compile;
pub mod parse_namespace;
pub mod parse_port;

use serde::Serialize;

/// Print `value` as JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    println!("{}", to_json(value, pretty)?);
    Ok(())
}

pub(crate) fn to_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

use clap::Args;
use specgen::ports::parse_port_spec;

#[derive(Args, Debug)]
pub struct ParsePortArgs {
    /// Publish flag: `[[ip:]hostport[-end]:]ctrport[-end][/proto]`
    #[arg(required = true, num_args = 1..)]
    pub specs: Vec<String>,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

pub fn execute(args: ParsePortArgs) -> anyhow::Result<()> {
    let mut mappings = Vec::with_capacity(args.specs.len());
    let mut errors = Vec::new();

    for spec in &args.specs {
        match parse_port_spec(spec) {
            Ok(mapping) => mappings.push(mapping),
            Err(e) => errors.push(format!("{}: {}", spec, e)),
        }
    }

    if !errors.is_empty() {
        anyhow::bail!(
            "Failed to parse {} of {} port spec(s)\nErrors:\n  {}",
            errors.len(),
            args.specs.len(),
            errors.join("\n  ")
        );
    }
    super::print_json(&mappings, args.pretty)
}

use clap::Args;
use specgen::namespace::{
    Namespace, NamespaceFamily, parse_cgroup_namespace, parse_for_family, parse_ipc_namespace,
    parse_network_namespace, parse_user_namespace,
};

#[derive(Args, Debug)]
pub struct ParseNamespaceArgs {
    /// Namespace family: pid, ipc, uts, user, cgroup, net or mnt
    pub family: String,

    /// Flag value, e.g. `host`, `container:db` or `bridge:ip=10.88.0.5`
    #[arg(default_value = "", allow_hyphen_values = true)]
    pub value: String,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

pub fn execute(args: ParseNamespaceArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let family = NamespaceFamily::from_name(&args.family)
        .ok_or_else(|| anyhow::anyhow!("unknown namespace family {:?}", args.family))?;

    let output = match family {
        NamespaceFamily::Network => {
            let selection = parse_network_namespace(&args.value)?;
            serde_json::json!({
                "namespace": selection.namespace,
                "networks": selection.networks,
                "options": selection.options,
            })
        }
        _ => {
            let ns: Namespace = match family {
                NamespaceFamily::Ipc => parse_ipc_namespace(&args.value)?,
                NamespaceFamily::User => parse_user_namespace(&args.value)?,
                NamespaceFamily::Cgroup => {
                    let host = global.load_host()?;
                    parse_cgroup_namespace(&args.value, host.get().cgroup_version()?)?
                }
                _ => parse_for_family(&args.value, family)?,
            };
            serde_json::json!({ "namespace": ns })
        }
    };
    super::print_json(&output, args.pretty)
}

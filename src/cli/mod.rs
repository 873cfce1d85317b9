use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(about = "GitOpsConfig operator")]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) command: Command,

    #[clap(
        short,
        long,
        default_value = "/etc/man10gitops/config.yaml",
        global = true
    )]
    pub(crate) config: PathBuf,
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum Command {
    /// Run the controller, the Job watch and the webhook ingress.
    Run {},
    /// Print the GitOpsConfig CustomResourceDefinition as YAML.
    Crd {},
}

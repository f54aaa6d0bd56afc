use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "skyforge")]
#[command(about = "Deploy vLLM and OpenWebUI to AWS", long_about = None)]
pub struct Args {
    /// Config file (JSON)
    #[arg(long, env = "SKYFORGE_CONFIG", default_value = "skyforge.json")]
    pub config: PathBuf,

    /// Where deploy records live: a file path, memory:// or etcd://host:port[,host:port]
    #[arg(long, env = "SKYFORGE_STATE", default_value = ".skyforge/state.json")]
    pub state: String,

    /// Target region (falls back to AWS_REGION, then the config file)
    #[arg(long, env = "SKYFORGE_REGION")]
    pub region: Option<String>,

    /// Target account, used to scope recorded state
    #[arg(long, env = "SKYFORGE_ACCOUNT")]
    pub account: Option<String>,

    /// Model served by vLLM, overrides the config file
    #[arg(long, env = "SKYFORGE_MODEL")]
    pub model: Option<String>,

    /// Run against a simulated provider and a throwaway copy of the state
    #[arg(long)]
    pub dry_run: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "SKYFORGE_LOG", default_value = "info")]
    pub log_level: String,

    /// OTLP/HTTP endpoint for trace export
    #[arg(long, env = "SKYFORGE_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP endpoint
    #[arg(long, env = "SKYFORGE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List stacks and their recorded status
    List,
    /// Render the stack templates
    Synth {
        /// Write `<Stack>.template.json` files here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show what a deploy would change (all stacks if none given)
    Diff(Selection),
    /// Deploy stacks in dependency order
    Deploy(Selection),
    /// Destroy stacks in reverse dependency order
    Destroy(Selection),
    /// Create the toolkit stack holding the template bucket
    Bootstrap,
    /// Probe the deployed endpoints
    Verify {
        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[derive(Debug, clap::Args)]
pub struct Selection {
    /// Select every stack
    #[arg(long, conflicts_with = "stacks")]
    pub all: bool,

    /// Stack names
    pub stacks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_all() {
        let args = Args::try_parse_from(["skyforge", "--dry-run", "deploy", "--all"]).unwrap();
        assert!(args.dry_run);
        match args.command {
            Command::Deploy(sel) => {
                assert!(sel.all);
                assert!(sel.stacks.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_named_stacks() {
        let args = Args::try_parse_from(["skyforge", "destroy", "SkyforgeService", "SkyforgeLoadBalancer"]).unwrap();
        match args.command {
            Command::Destroy(sel) => assert_eq!(sel.stacks, vec!["SkyforgeService", "SkyforgeLoadBalancer"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_all_conflicts_with_names() {
        assert!(Args::try_parse_from(["skyforge", "deploy", "--all", "SkyforgeService"]).is_err());
    }
}

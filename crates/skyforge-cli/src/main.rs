mod args;
mod config;
mod output;
mod verify;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use skyforge_common::{telemetry, AppConfig};
use skyforge_deploy::{CloudFormationProvider, CloudProvider, Deployer, SimulatedProvider};
use skyforge_stacks::App;
use skyforge_state::{MemoryStateStore, StateStore};

use crate::args::{Args, Command};
use crate::config::load_config;
use crate::output::{
    print_bootstrap, print_deploy_report, print_destroy_report, print_diffs, print_error,
    print_stacks, print_synth, print_verify,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let provider = telemetry::init_tracing(
        "skyforge",
        &args.log_level,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let code = match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            print_error(&err);
            ExitCode::FAILURE
        }
    };
    telemetry::shutdown(provider);
    code
}

/// Runs one command. `Ok(false)` means it completed but found problems.
async fn run(args: Args) -> Result<bool> {
    let cfg = load_config(&args)?;

    match &args.command {
        Command::Synth { out } => synth(&cfg, out.as_deref()).await?,
        Command::List => {
            let deployer = open_deployer(&args, &cfg).await?;
            let stacks = deployer.list().await?;
            print_stacks(&stacks, deployer.provider_name());
        }
        Command::Diff(sel) => {
            let deployer = open_deployer(&args, &cfg).await?;
            let all = sel.all || sel.stacks.is_empty();
            let diffs = deployer.diff(&sel.stacks, all).await?;
            print_diffs(&diffs);
        }
        Command::Deploy(sel) => {
            let deployer = open_deployer(&args, &cfg).await?;
            let report = deployer.deploy(&sel.stacks, sel.all).await?;
            print_deploy_report(&report);
        }
        Command::Destroy(sel) => {
            let deployer = open_deployer(&args, &cfg).await?;
            let report = deployer.destroy(&sel.stacks, sel.all).await?;
            print_destroy_report(&report);
        }
        Command::Bootstrap => {
            let deployer = open_deployer(&args, &cfg).await?;
            let record = deployer.bootstrap().await?;
            print_bootstrap(&record);
        }
        Command::Verify { timeout_secs } => {
            if args.dry_run {
                bail!("verify probes live endpoints and cannot run with --dry-run");
            }
            let deployer = open_deployer(&args, &cfg).await?;
            let results = verify::verify(&cfg, &deployer, Duration::from_secs(*timeout_secs)).await?;
            print_verify(&results);
            return Ok(results.iter().all(|r| r.ok));
        }
    }
    Ok(true)
}

async fn synth(cfg: &AppConfig, out: Option<&Path>) -> Result<()> {
    let app = App::synth(cfg)?;
    app.validate()?;
    if let Some(dir) = out {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        for t in app.stacks() {
            let path = dir.join(format!("{}.template.json", t.name));
            tokio::fs::write(&path, t.to_pretty_json())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
    }
    print_synth(app.stacks(), out);
    Ok(())
}

/// Opens the state store and provider. A dry run works on an in-memory copy
/// of the state against the simulated provider.
async fn open_deployer(args: &Args, cfg: &AppConfig) -> Result<Deployer> {
    let mut store = skyforge_state::open(&args.state).await?;
    let provider: Arc<dyn CloudProvider> = if args.dry_run {
        store = Arc::new(MemoryStateStore::snapshot_of(store.as_ref()).await?) as Arc<dyn StateStore>;
        tracing::info!("dry run: simulated provider, state changes are discarded");
        Arc::new(SimulatedProvider::new())
    } else {
        Arc::new(CloudFormationProvider::new(&cfg.env.region))
    };
    let deployer = Deployer::new(cfg, store, provider)?;
    tracing::debug!(
        provider = deployer.provider_name(),
        region = %cfg.env.region,
        account = cfg.env.account_or_default(),
        "deployer ready"
    );
    Ok(deployer)
}

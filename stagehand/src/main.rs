//! stagehand CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use stagehand::flow::{self, GlobalState, Manifest};
use stagehand::logging::init_logging;
use stagehand::{DockerEngine, SharedEngine};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run release, deploy and destroy pipelines in containers.
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root of the project (holds stagehand.json, config/ and infra/).
    #[arg(long, default_value = ".")]
    code_dir: PathBuf,

    /// Component name, defaults to the code directory's name.
    #[arg(long, env = "STAGEHAND_COMPONENT")]
    component: Option<String>,

    /// Commit being released.
    #[arg(long, env = "STAGEHAND_COMMIT", default_value = "")]
    commit: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and publish a release.
    Release { version: String },

    /// Deploy a release to an environment.
    Deploy {
        /// Stop after generating the plan.
        #[arg(short, long)]
        plan_only: bool,
        env: String,
        version: String,
    },

    /// Destroy an environment's infrastructure.
    Destroy {
        /// Stop after generating the plan.
        #[arg(short, long)]
        plan_only: bool,
        env: String,
        version: Option<String>,
    },
}

fn component_name(cli: &Cli, code_dir: &std::path::Path) -> anyhow::Result<String> {
    if let Some(component) = &cli.component {
        return Ok(component.clone());
    }
    code_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("cannot derive component name from code directory, pass --component")
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let code_dir = cli
        .code_dir
        .canonicalize()
        .with_context(|| format!("code directory {}", cli.code_dir.display()))?;
    let manifest = Manifest::load(&code_dir)?;
    let component = component_name(&cli, &code_dir)?;

    let engine: SharedEngine = Arc::new(DockerEngine::connect()?);
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let global = GlobalState::new(engine, code_dir, manifest, component, cli.commit)
        .with_env(env)
        .with_cancel(cancel);

    match cli.command {
        Command::Release { version } => flow::release(&global, &version).await?,
        Command::Deploy {
            plan_only,
            env,
            version,
        } => flow::deploy(&global, &env, &version, plan_only).await?,
        Command::Destroy {
            plan_only,
            env,
            version,
        } => flow::destroy(&global, &env, version.as_deref(), plan_only).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cleaning up");
            on_signal.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stagehand: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

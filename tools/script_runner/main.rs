//! Run a rig script file through a full bridge session with the mock rig.
//!
//! ```text
//! RUST_LOG=info script_runner demos/mock_rig_tour.rhai
//! ```
//!
//! Ctrl-C asks the session to stop; a script that ignores the request is
//! forcibly terminated after the configured grace period.

use clap::Parser;
use rig_script::config::Settings;
use rig_script::devices;
use rig_script::scripting::{RhaiRuntime, ScriptRuntime};
use rig_script::session::{Outcome, SessionController, SessionPlan};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "script_runner", about = "Execute a rig script with the mock device set")]
struct Args {
    /// Path to the script file
    script: PathBuf,

    /// Optional TOML settings file
    #[arg(long)]
    config: Option<String>,

    /// Session name shown in logs and the report
    #[arg(long, default_value = "cli")]
    name: String,

    /// Validate the script and exit without running it
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(error) = run(Args::parse()).await {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.script)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", args.script.display()))?;

    let runtime = Arc::new(RhaiRuntime::new());
    if let Err(fault) = runtime.validate(&source).await {
        anyhow::bail!("{fault}");
    }
    if args.check {
        println!("{} is valid", args.script.display());
        return Ok(());
    }

    let settings = Settings::new(args.config.as_deref())?;
    let controller = Arc::new(SessionController::new(settings));

    let stopper = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.request_stop();
        }
    });

    let mut plan = SessionPlan::new(runtime, Arc::new(devices::standard_manifest()?));
    for (identifier, capability) in devices::standard_capabilities() {
        plan = plan.with_capability(identifier, capability);
    }

    let report = controller.begin(&args.name, &source, plan).await?;

    for line in &report.feedback {
        println!("> {line}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    match &report.outcome {
        Outcome::Normal => {
            println!(
                "Session '{}' completed in {:.2}s",
                report.name,
                report.duration.as_secs_f64()
            );
            Ok(())
        }
        Outcome::Stopped => {
            println!("Session '{}' was stopped", report.name);
            Ok(())
        }
        Outcome::FatalException { message } | Outcome::FatalMessage { message } => {
            anyhow::bail!("{message}")
        }
    }
}

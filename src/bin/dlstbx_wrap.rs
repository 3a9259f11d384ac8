//! # dlstbx-wrap
//!
//! Runs a single wrapped job for one recipe step. The recipe wrapper is read
//! from a file written by whoever scheduled the job; success or failure is
//! published to the step's outputs and to the status topic.

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

use dlstbx::clock::{Clock, SystemClock};
use dlstbx::config::ConfigManager;
use dlstbx::logging::init_structured_logging;
use dlstbx::messaging::connect_transport;
use dlstbx::recipe::RecipeWrapper;
use dlstbx::wrapper::{WrapperRegistry, WrapperRunner};

#[derive(Parser)]
#[command(name = "dlstbx-wrap")]
#[command(about = "Run a wrapped processing job for one recipe step")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_help_flag = true)]
struct Cli {
    /// Wrapper plugin to run
    #[arg(long)]
    wrap: String,

    /// Serialized recipe wrapper for the job
    #[arg(long)]
    recipewrapper: PathBuf,

    /// Configuration file (overrides DLSTBX_CONFIG)
    #[arg(short, long, env = "DLSTBX_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print help
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => process::exit(0),
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("Wrapper failed: {e:#}");
            eprintln!("dlstbx-wrap: {e:#}");
            process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let manager = ConfigManager::load_from_file(cli.config.as_deref())
        .context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(cli.verbose, config.logging.directory.as_deref());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = connect_transport(config, clock.clone())
        .await
        .context("connecting to the message transport")?;
    let rw = RecipeWrapper::from_file(&cli.recipewrapper, transport)
        .await
        .with_context(|| format!("loading {}", cli.recipewrapper.display()))?;

    info!(
        wrapper = %cli.wrap,
        recipewrapper = %cli.recipewrapper.display(),
        "Running wrapped job"
    );
    let runner = WrapperRunner::new(WrapperRegistry::with_defaults(), clock);
    Ok(runner.run(&cli.wrap, rw).await?)
}

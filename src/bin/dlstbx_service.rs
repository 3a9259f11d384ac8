//! # dlstbx-service
//!
//! Runs one long-lived recipe service (filewatcher, trigger or ISPyB
//! connector) against the configured broker and metadata store until
//! interrupted. Exits non-zero when a handler asked for the instance to be
//! replaced.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

use dlstbx::clock::{Clock, SystemClock};
use dlstbx::config::ConfigManager;
use dlstbx::database::connect_store;
use dlstbx::filewatcher::FilewatcherService;
use dlstbx::ispyb::IspybConnector;
use dlstbx::logging::init_structured_logging;
use dlstbx::messaging::connect_transport;
use dlstbx::service::{CommonService, ServiceContext, ServiceRuntime};
use dlstbx::trigger::TriggerService;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServiceKind {
    /// Watch for detector files named by a list or a pattern
    Filewatcher,
    /// Create downstream processing jobs
    Trigger,
    /// Write processing results to the metadata store
    #[value(name = "ispyb_connector")]
    IspybConnector,
}

#[derive(Parser)]
#[command(name = "dlstbx-service")]
#[command(about = "Run a recipe-driven processing service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    after_help = "This build has no HDF5 library binding: filewatcher messages asking for an \
                  `hdf5` watch are moved to the dead-letter queue."
)]
struct Cli {
    /// Service to run
    #[arg(short, long, value_enum)]
    service: ServiceKind,

    /// Configuration file (overrides DLSTBX_CONFIG)
    #[arg(short, long, env = "DLSTBX_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Service failed: {e:#}");
            eprintln!("dlstbx-service: {e:#}");
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let manager = ConfigManager::load_from_file(cli.config.as_deref())
        .context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(cli.verbose, config.logging.directory.as_deref());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = connect_transport(config, clock.clone())
        .await
        .context("connecting to the message transport")?;

    let service: Arc<dyn CommonService> = match cli.service {
        ServiceKind::Filewatcher => {
            warn!("No HDF5 backend available; hdf5 watches will be dead-lettered");
            Arc::new(FilewatcherService::new(config.filewatcher.clone()))
        }
        ServiceKind::Trigger => {
            let store = connect_store(&config.database)
                .await
                .context("connecting to the metadata store")?;
            Arc::new(TriggerService::new(store, config.trigger.clone()))
        }
        ServiceKind::IspybConnector => {
            let store = connect_store(&config.database)
                .await
                .context("connecting to the metadata store")?;
            Arc::new(IspybConnector::new(store, config.ispyb.clone()))
        }
    };

    let context = ServiceContext::new(transport, clock);
    let runtime = ServiceRuntime::new(service, context, config);

    let stopper = runtime.context().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            stopper.stop();
        }
    });

    let exit = runtime.run().await?;
    Ok(exit.exit_code())
}

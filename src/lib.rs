#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, ISPyB in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # dlstbx core
//!
//! Recipe-driven message processing for beamline data-processing services.
//!
//! ## Overview
//!
//! Work moves between services as *recipe messages*: a small graph of
//! processing steps, a pointer to the current step, an environment of
//! variables and a payload. Each service consumes one queue, interprets the
//! current step's parameters, and either forwards results to the step's named
//! outputs or *checkpoints* the message back to itself with a delay. Polling,
//! backoff and multi-step database writes are all built from checkpoints, so
//! no worker ever blocks waiting on the outside world.
//!
//! ## Module Organization
//!
//! - [`recipe`] - Recipe graph, per-message wrapper, parameter substitution
//! - [`messaging`] - Transport trait, pgmq and in-memory transports, transactions
//! - [`service`] - Consumer loop, worker pool and lifecycle hooks
//! - [`filewatcher`] - Watch for files from the detector and fan out per image
//! - [`trigger`] - Named downstream-processing triggers with backoff
//! - [`ispyb`] - Structured metadata-store commands, multipart and buffered
//! - [`wrapper`] - Runner for external processing jobs
//! - [`database`] - Metadata store trait with PostgreSQL and in-memory backends
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dlstbx::clock::SystemClock;
//! use dlstbx::config::ConfigManager;
//! use dlstbx::filewatcher::FilewatcherService;
//! use dlstbx::messaging::connect_transport;
//! use dlstbx::service::{ServiceContext, ServiceRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! let clock = Arc::new(SystemClock);
//! let transport = connect_transport(config, clock.clone()).await?;
//!
//! let service = Arc::new(FilewatcherService::new(config.filewatcher.clone()));
//! let runtime = ServiceRuntime::new(service, ServiceContext::new(transport, clock), config);
//! let exit = runtime.run().await?;
//! std::process::exit(exit.exit_code());
//! # }
//! ```
//!
//! ## Testing
//!
//! Every service runs unchanged against [`messaging::InMemoryTransport`],
//! [`database::InMemoryMetadataStore`] and [`clock::FakeClock`]:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and scenario tests
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod filewatcher;
pub mod ispyb;
pub mod logging;
pub mod messaging;
pub mod recipe;
pub mod service;
pub mod trigger;
pub mod wrapper;

pub use config::{ConfigManager, DlstbxConfig};
pub use error::{DlstbxError, Result};
pub use recipe::{ParameterChain, RecipeWrapper};

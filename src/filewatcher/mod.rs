//! # Filewatcher
//!
//! Waits for the files of a data collection to appear and notifies
//! downstream steps as they do. A watch never blocks a worker: each
//! activation checks at most `burst-limit` files, then checkpoints the
//! message (with its progress embedded) back to itself.
//!
//! ## Step parameters
//!
//! Exactly one of:
//!
//! - `list`: file names in order; `[null]` is an empty watch
//! - `pattern` with `pattern-start` / `pattern-end`: e.g. `tst_%05d.cbf`
//! - `hdf5`: a master file whose frames are read through [`Hdf5Backend`]
//!
//! plus `burst-limit`, `burst-wait`, `timeout`, `timeout-first`,
//! `log-timeout-as-info` and `expected-per-image-delay`.
//!
//! ## Outputs
//!
//! `first`, `every`, `every-N`, `select-N`, `last` and integer names fire per
//! file (see [`cadence`]). `any`, `finally`, `timeout` and `error` fire once
//! when the watch ends.

pub mod cadence;
pub mod hdf5;
pub mod status;
pub mod watchers;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FilewatcherConfig;
use crate::constants::{outputs, queues};
use crate::messaging::{Delivery, Transaction, TransportError};
use crate::recipe::{ParameterChain, RecipeError, RecipeWrapper};
use crate::service::{CommonService, ServiceContext};

pub use cadence::{is_every, is_selected, CadenceOutputs};
pub use hdf5::{FileHandles, FrameLocation, Hdf5Backend, Hdf5DataFile, Hdf5Error};
pub use status::WatchStatus;
pub use watchers::{ActiveWatch, FilePattern, FileCheck, WatchMode};

#[derive(Error, Debug)]
pub enum FilewatcherError {
    #[error("No watch mode given; one of list, pattern or hdf5 is required")]
    NoWatchMode,

    #[error("Conflicting watch modes: {modes}")]
    ConflictingModes { modes: String },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Non-conforming file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid filewatcher status: {reason}")]
    InvalidStatus { reason: String },

    #[error("Message payload must be an object, found {kind}")]
    InvalidPayload { kind: &'static str },

    #[error("HDF5 watching is not available in this build")]
    Hdf5Unavailable,

    #[error("HDF5 error on {path}: {source}")]
    Hdf5 {
        path: String,
        #[source]
        source: Hdf5Error,
    },

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FilewatcherError {
    pub fn invalid_parameter<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_payload(kind: &'static str) -> Self {
        Self::InvalidPayload { kind }
    }

    pub fn hdf5<P: Into<String>>(path: P, source: Hdf5Error) -> Self {
        Self::Hdf5 {
            path: path.into(),
            source,
        }
    }

    pub fn is_malformed(&self) -> bool {
        match self {
            Self::NoWatchMode
            | Self::ConflictingModes { .. }
            | Self::InvalidParameter { .. }
            | Self::InvalidPattern { .. }
            | Self::InvalidStatus { .. }
            | Self::InvalidPayload { .. }
            | Self::Hdf5Unavailable => true,
            Self::Recipe(e) => e.is_malformed(),
            _ => false,
        }
    }

    /// A known-ephemeral HDF5 condition; the watch is retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Hdf5 { source, .. } if source.is_transient())
    }
}

/// Per-watch settings, step parameters over service defaults
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSettings {
    pub burst_limit: u64,
    pub burst_wait: f64,
    pub timeout: f64,
    pub timeout_first: f64,
    pub log_timeout_as_info: bool,
    pub expected_per_image_delay: Option<f64>,
}

impl WatchSettings {
    pub fn from_parameters(
        parameters: &ParameterChain,
        defaults: &FilewatcherConfig,
    ) -> Result<Self, FilewatcherError> {
        let number = |name: &str, default: f64| -> Result<f64, FilewatcherError> {
            match parameters.get_raw(name) {
                None => Ok(default),
                Some(_) => parameters
                    .get_f64(name)
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .ok_or_else(|| {
                        FilewatcherError::invalid_parameter(name, "non-negative number required")
                    }),
            }
        };

        let timeout = number("timeout", defaults.timeout_seconds)?;
        Ok(Self {
            burst_limit: (number("burst-limit", defaults.burst_limit as f64)? as u64).max(1),
            burst_wait: number("burst-wait", defaults.burst_wait_seconds)?,
            timeout,
            timeout_first: number("timeout-first", timeout)?,
            log_timeout_as_info: parameters.get_bool("log-timeout-as-info").unwrap_or(false),
            expected_per_image_delay: match parameters.get_raw("expected-per-image-delay") {
                None => None,
                Some(_) => Some(number("expected-per-image-delay", 0.0)?),
            },
        })
    }
}

/// How one activation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Success,
    ListError,
    Timeout,
    Checkpointed,
}

#[derive(Debug)]
pub struct FilewatcherService {
    defaults: FilewatcherConfig,
    hdf5: Option<Arc<dyn Hdf5Backend>>,
}

impl FilewatcherService {
    pub fn new(defaults: FilewatcherConfig) -> Self {
        Self {
            defaults,
            hdf5: None,
        }
    }

    pub fn with_hdf5_backend(mut self, backend: Arc<dyn Hdf5Backend>) -> Self {
        self.hdf5 = Some(backend);
        self
    }

    /// Run one activation of the watch carried by `delivery`
    pub async fn process(
        &self,
        context: &ServiceContext,
        delivery: &Delivery,
    ) -> Result<WatchOutcome, FilewatcherError> {
        let rw = context.recipe_wrapper(delivery)?;
        let parameters = rw.parameters();
        let settings = WatchSettings::from_parameters(&parameters, &self.defaults)?;
        let mode = WatchMode::from_parameters(&parameters)?;
        let now = context.clock().epoch_secs();
        let status = WatchStatus::from_payload(rw.payload())?.unwrap_or_else(|| WatchStatus::new(now));

        let transport = context.transport();
        let mut transaction = transport.transaction_begin(delivery.header.subscription_id.as_deref());
        transport
            .ack(&delivery.header, Some(&mut transaction))
            .await?;

        let result = {
            let mut activation = Activation {
                rw: &rw,
                settings: &settings,
                cadence: CadenceOutputs::from_step(rw.current_step()),
                status,
                now,
                transaction: &mut transaction,
            };
            activation.run(&mode, self.hdf5.as_deref()).await
        };

        match result {
            Ok(outcome) => {
                transport.transaction_commit(transaction).await?;
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                info!(
                    recipe_pointer = rw.pointer(),
                    error = %e,
                    "Transient HDF5 condition, retrying later"
                );
                transport.transaction_abort(transaction);
                let mut retry = transport.transaction_begin(delivery.header.subscription_id.as_deref());
                rw.checkpoint(
                    rw.payload().clone(),
                    Some(Duration::from_secs_f64(settings.burst_wait.max(1.0))),
                    Some(&mut retry),
                )
                .await?;
                transport.ack(&delivery.header, Some(&mut retry)).await?;
                transport.transaction_commit(retry).await?;
                Ok(WatchOutcome::Checkpointed)
            }
            Err(e) => {
                transport.transaction_abort(transaction);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CommonService for FilewatcherService {
    fn name(&self) -> &'static str {
        "filewatcher"
    }

    fn queue(&self) -> String {
        queues::FILEWATCHER.to_string()
    }

    async fn on_message(
        &self,
        context: &ServiceContext,
        delivery: Delivery,
    ) -> crate::error::Result<()> {
        let outcome = self.process(context, &delivery).await?;
        debug!(outcome = ?outcome, "Filewatcher activation finished");
        Ok(())
    }
}

/// State of one activation
struct Activation<'a> {
    rw: &'a RecipeWrapper,
    settings: &'a WatchSettings,
    cadence: CadenceOutputs,
    status: WatchStatus,
    now: f64,
    transaction: &'a mut Transaction,
}

impl Activation<'_> {
    async fn run(
        &mut self,
        mode: &WatchMode,
        hdf5: Option<&dyn Hdf5Backend>,
    ) -> Result<WatchOutcome, FilewatcherError> {
        let mut watch = ActiveWatch::open(mode, hdf5)?;
        let expected = watch.expected();
        if matches!(mode, WatchMode::Hdf5 { .. }) {
            self.status.image_count = Some(expected);
        }

        if expected == 0 {
            self.finish(expected, true).await?;
            return Ok(WatchOutcome::Success);
        }

        let mut found = 0;
        let mut gap = false;
        while self.status.seen_count < expected && found < self.settings.burst_limit {
            let index = self.status.seen_count + 1;
            match watch.check(index).await? {
                FileCheck::Found(mut fields) => {
                    self.status.seen_count = index;
                    found += 1;
                    fields.insert("file-seen-at".into(), json!(self.now));
                    self.notify_file(index, expected, fields).await?;
                }
                FileCheck::Absent => break,
                FileCheck::Gap => {
                    gap = true;
                    break;
                }
            }
        }
        let seen = self.status.seen_count;
        debug!(mode = mode.name(), seen, expected, found, "Checked files");

        if seen == expected {
            info!(
                mode = mode.name(),
                files = expected,
                duration_seconds = self.now - self.status.start_time,
                "All files found"
            );
            self.finish(expected, true).await?;
            return Ok(WatchOutcome::Success);
        }

        if gap {
            let mut fields = watch.describe(seen + 1);
            fields.insert("success".into(), json!(false));
            warn!(
                file_list_index = seen + 1,
                "Empty entry in file list, ending watch"
            );
            self.send(outputs::ERROR, Value::Object(fields)).await?;
            self.finish(expected, false).await?;
            return Ok(WatchOutcome::ListError);
        }

        if found == 0 {
            if let Some(unexpected_delay) = self.timed_out() {
                let mut fields = watch.describe(seen + 1);
                fields.insert("success".into(), json!(false));
                let file = fields.get("file").cloned().unwrap_or(Value::Null);
                if self.settings.log_timeout_as_info {
                    info!(file = %file, seen, expected, unexpected_delay, "Filewatcher timed out");
                } else {
                    warn!(file = %file, seen, expected, unexpected_delay, "Filewatcher timed out");
                }
                self.send(outputs::TIMEOUT, Value::Object(fields)).await?;
                self.finish(expected, false).await?;
                return Ok(WatchOutcome::Timeout);
            }
            self.checkpoint(self.settings.burst_wait.max(1.0)).await?;
        } else {
            self.status.last_seen = Some(self.now);
            self.checkpoint(self.settings.burst_wait).await?;
        }
        Ok(WatchOutcome::Checkpointed)
    }

    /// Seconds of unexpected delay if the applicable timeout has passed
    fn timed_out(&self) -> Option<f64> {
        let seen = self.status.seen_count;
        let (reference, limit) = if seen == 0 {
            (self.status.start_time, self.settings.timeout_first)
        } else {
            (
                self.status.last_seen.unwrap_or(self.status.start_time),
                self.settings.timeout,
            )
        };
        let expected_at = match self.settings.expected_per_image_delay {
            Some(delay) => reference.max(self.status.start_time + seen as f64 * delay),
            None => reference,
        };
        let unexpected_delay = self.now - expected_at;
        (unexpected_delay > limit).then_some(unexpected_delay)
    }

    async fn notify_file(
        &mut self,
        index: u64,
        expected: u64,
        fields: Map<String, Value>,
    ) -> Result<(), FilewatcherError> {
        let names: Vec<String> = self
            .cadence
            .outputs_for(index, expected)
            .into_iter()
            .map(str::to_string)
            .collect();
        let payload = Value::Object(fields);
        for name in names {
            self.send(&name, payload.clone()).await?;
        }
        Ok(())
    }

    /// Emit `any` (if something was seen) and `finally`
    async fn finish(&mut self, expected: u64, success: bool) -> Result<(), FilewatcherError> {
        let seen = self.status.seen_count;
        if seen > 0 {
            self.send(
                outputs::ANY,
                json!({"files-expected": expected, "files-seen": seen}),
            )
            .await?;
        }
        self.send(
            outputs::FINALLY,
            json!({"files-expected": expected, "files-seen": seen, "success": success}),
        )
        .await
    }

    async fn send(&mut self, output: &str, payload: Value) -> Result<(), FilewatcherError> {
        self.rw
            .send_to(output, payload, Some(&mut *self.transaction))
            .await?;
        Ok(())
    }

    async fn checkpoint(&mut self, delay: f64) -> Result<(), FilewatcherError> {
        let payload = self.status.embed_in(self.rw.payload())?;
        self.rw
            .checkpoint(
                payload,
                Some(Duration::from_secs_f64(delay)),
                Some(&mut *self.transaction),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::hdf5::testing::FakeHdf5;
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::messaging::{InMemoryTransport, Transport};

    fn envelope(parameters: Value, payload: Value) -> Value {
        json!({
            "recipe": {
                "1": {
                    "queue": "filewatcher",
                    "parameters": parameters,
                    "output": {"every": 2, "finally": 3, "timeout": 4}
                },
                "2": {"queue": "every"},
                "3": {"queue": "finally"},
                "4": {"queue": "timeout"},
                "start": [[1, []]]
            },
            "recipe-pointer": 1,
            "environment": {},
            "payload": payload
        })
    }

    struct Harness {
        transport: Arc<InMemoryTransport>,
        clock: FakeClock,
        context: ServiceContext,
    }

    impl Harness {
        fn new() -> Self {
            let clock = FakeClock::new();
            let transport = Arc::new(InMemoryTransport::with_clock(Arc::new(clock.clone())));
            let context = ServiceContext::new(transport.clone(), Arc::new(clock.clone()));
            Self {
                transport,
                clock,
                context,
            }
        }

        async fn deliver(&self, message: Value) -> Delivery {
            self.transport
                .send("filewatcher", message, None, None)
                .await
                .unwrap();
            self.transport
                .receive("filewatcher", 1, Duration::from_secs(60))
                .await
                .unwrap()
                .remove(0)
        }
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let defaults = FilewatcherConfig::default();
        let params = ParameterChain::new(Map::new())
            .with_value_layer(&json!({"timeout": 120, "burst-limit": "3"}));
        let settings = WatchSettings::from_parameters(&params, &defaults).unwrap();
        assert_eq!(settings.burst_limit, 3);
        assert_eq!(settings.burst_wait, 1.0);
        assert_eq!(settings.timeout_first, 120.0);
        assert_eq!(settings.expected_per_image_delay, None);

        let params = ParameterChain::new(Map::new()).with_value_layer(&json!({"timeout": "soon"}));
        assert!(WatchSettings::from_parameters(&params, &defaults)
            .unwrap_err()
            .is_malformed());
    }

    #[tokio::test]
    async fn test_missing_mode_is_malformed() {
        let h = Harness::new();
        let service = FilewatcherService::new(FilewatcherConfig::default());
        let delivery = h.deliver(envelope(json!({}), json!({}))).await;
        let err = service.process(&h.context, &delivery).await.unwrap_err();
        assert!(err.is_malformed());
        // Nothing was acked or published
        assert_eq!(h.transport.queue_length("filewatcher").await, 1);
        assert!(h.transport.published_to("finally").is_empty());
    }

    #[tokio::test]
    async fn test_expected_per_image_delay_extends_timeout() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let list: Vec<String> = (0..3)
            .map(|i| dir.path().join(format!("f{i}")).display().to_string())
            .collect();
        let params = json!({
            "list": list, "timeout-first": 10, "expected-per-image-delay": 30
        });
        let service = FilewatcherService::new(FilewatcherConfig::default());

        // 20s in with nothing seen: past the 10s allowed for the first file
        h.clock.advance_secs(20.0);
        let mut status = WatchStatus::new(h.clock.epoch_secs() - 20.0);
        status.seen_count = 0;
        let delivery = h.deliver(envelope(params.clone(), status.embed_in(&json!({})).unwrap())).await;
        let outcome = service.process(&h.context, &delivery).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Timeout);

        // One file seen at the start: the second is only expected 30s in
        std::fs::write(&list[0], b"").unwrap();
        let mut status = WatchStatus::new(h.clock.epoch_secs() - 35.0);
        status.seen_count = 1;
        status.last_seen = Some(status.start_time);
        let params = json!({
            "list": list, "timeout": 10, "expected-per-image-delay": 30
        });
        let delivery = h.deliver(envelope(params, status.embed_in(&json!({})).unwrap())).await;
        let outcome = service.process(&h.context, &delivery).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Checkpointed);
    }

    #[tokio::test]
    async fn test_transient_hdf5_error_checkpoints_unchanged_message() {
        let h = Harness::new();
        let fake = FakeHdf5::with_frames(1, 4);
        fake.state.lock().master_error = Some(Hdf5Error::new("file is not in SWMR writing mode"));
        let service = FilewatcherService::new(FilewatcherConfig::default())
            .with_hdf5_backend(Arc::new(fake.clone()));

        let message = envelope(json!({"hdf5": "/data/x_master.h5"}), json!({"dcid": 1}));
        let delivery = h.deliver(message).await;
        let outcome = service.process(&h.context, &delivery).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Checkpointed);

        let queued = h.transport.take_messages("filewatcher").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message["payload"], json!({"dcid": 1}));
        assert_eq!(queued[0].delay, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_hdf5_watch_completes_and_closes_handles() {
        let h = Harness::new();
        let fake = FakeHdf5::with_frames(2, 2);
        fake.write_frames(4);
        let service = FilewatcherService::new(FilewatcherConfig::default())
            .with_hdf5_backend(Arc::new(fake.clone()));

        let delivery = h
            .deliver(envelope(json!({"hdf5": "/data/x_master.h5"}), json!({})))
            .await;
        let outcome = service.process(&h.context, &delivery).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Success);

        let every = h.transport.published_to("every");
        let numbers: Vec<u64> = every
            .iter()
            .map(|m| m["payload"]["file-number"].as_u64().unwrap())
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(every[0]["payload"]["hdf5-index"], 0);

        let state = fake.state.lock();
        assert_eq!(state.opened, state.closed);
    }

    #[tokio::test]
    async fn test_non_transient_hdf5_error_fails_activation() {
        let h = Harness::new();
        let fake = FakeHdf5::with_frames(1, 2);
        fake.state.lock().master_error = Some(Hdf5Error::new("unable to open file"));
        let service = FilewatcherService::new(FilewatcherConfig::default())
            .with_hdf5_backend(Arc::new(fake));

        let delivery = h
            .deliver(envelope(json!({"hdf5": "/data/x_master.h5"}), json!({})))
            .await;
        let err = service.process(&h.context, &delivery).await.unwrap_err();
        assert!(!err.is_malformed());
        assert!(!err.is_transient());
        // Still held, unacked, for the runtime to nack
        assert_eq!(h.transport.queue_length("filewatcher").await, 1);
        assert!(h.transport.published_to("finally").is_empty());
    }
}

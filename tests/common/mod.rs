//! Shared harness for the scenario tests.
//!
//! Services run against an in-memory broker whose scheduled deliveries follow
//! a fake clock, so watches, backoff and buffer waits that span minutes finish
//! in milliseconds.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dlstbx::clock::{Clock, FakeClock};
use dlstbx::messaging::{
    Delivery, InMemoryTransport, Transport, TransportError, TransportOperation, TransportResult,
};
use dlstbx::service::{dispatch_delivery, CommonService, ServiceContext};

/// Broker that loses its connection for a number of upcoming commits
#[derive(Debug)]
pub struct FlakyTransport {
    inner: Arc<InMemoryTransport>,
    failures: AtomicU32,
}

impl FlakyTransport {
    pub fn new(inner: Arc<InMemoryTransport>) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` batches of operations, applying none of them
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn provider_name(&self) -> &'static str {
        "flaky"
    }

    async fn ensure_queue(&self, queue: &str) -> TransportResult<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> TransportResult<Vec<Delivery>> {
        self.inner.receive(queue, max_messages, visibility_timeout).await
    }

    async fn apply(&self, operations: Vec<TransportOperation>) -> TransportResult<()> {
        let lost = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(TransportError::database_connection("broker connection lost"));
        }
        self.inner.apply(operations).await
    }
}

pub struct Harness {
    pub clock: FakeClock,
    pub transport: Arc<InMemoryTransport>,
    pub context: ServiceContext,
    start: f64,
}

impl Harness {
    pub fn new() -> Self {
        let clock = FakeClock::new();
        let transport = Arc::new(InMemoryTransport::with_clock(Arc::new(clock.clone())));
        let context = ServiceContext::new(transport.clone(), Arc::new(clock.clone()));
        let start = clock.epoch_secs();
        Self {
            clock,
            transport,
            context,
            start,
        }
    }

    /// A harness whose services settle and publish through a [`FlakyTransport`]
    ///
    /// `transport` still exposes the underlying broker for inspection.
    pub fn with_flaky_transport() -> (Self, Arc<FlakyTransport>) {
        let clock = FakeClock::new();
        let transport = Arc::new(InMemoryTransport::with_clock(Arc::new(clock.clone())));
        let flaky = Arc::new(FlakyTransport::new(transport.clone()));
        let context = ServiceContext::new(flaky.clone(), Arc::new(clock.clone()));
        let start = clock.epoch_secs();
        let harness = Self {
            clock,
            transport,
            context,
            start,
        };
        (harness, flaky)
    }

    /// Seconds of fake time since the harness was created
    pub fn elapsed(&self) -> f64 {
        self.clock.epoch_secs() - self.start
    }

    /// Epoch seconds at `offset` seconds after the harness was created
    pub fn at(&self, offset: f64) -> f64 {
        self.start + offset
    }

    /// Put a message on a queue outside any recipe, then forget the publish
    pub async fn inject(&self, queue: &str, message: Value) {
        self.transport
            .send(queue, message, None, None)
            .await
            .unwrap();
        self.transport.clear_publish_log();
    }

    /// Hand every currently visible message on the service's queue to the service
    ///
    /// Returns the number of activations.
    pub async fn activate(&self, service: &dyn CommonService) -> usize {
        let deliveries = self
            .transport
            .receive(&service.queue(), 100, Duration::from_secs(300))
            .await
            .unwrap();
        let count = deliveries.len();
        for delivery in deliveries {
            dispatch_delivery(service, &self.context, delivery).await;
        }
        count
    }

    /// Messages still held on a queue, visible or scheduled
    pub async fn pending(&self, queue: &str) -> usize {
        self.transport.queue_length(queue).await
    }

    /// Payloads of the recipe messages published to `queue`
    pub fn payloads(&self, queue: &str) -> Vec<Value> {
        self.transport
            .published_to(queue)
            .into_iter()
            .map(|message| message["payload"].clone())
            .collect()
    }
}

/// A recipe whose step 1 runs on `queue` and whose outputs each lead to a
/// step on queue `out.<name>`
pub fn fan_out_recipe(queue: &str, parameters: Value, outputs: &[&str]) -> Value {
    let mut recipe = Map::new();
    let mut wiring = Map::new();
    for (i, name) in outputs.iter().enumerate() {
        let label = i + 2;
        wiring.insert((*name).to_string(), json!(label));
        recipe.insert(label.to_string(), json!({ "queue": format!("out.{name}") }));
    }
    recipe.insert(
        "1".to_string(),
        json!({ "queue": queue, "parameters": parameters, "output": wiring }),
    );
    recipe.insert("start".to_string(), json!([[1, []]]));
    Value::Object(recipe)
}

/// Recipe envelope pointing at step 1
pub fn envelope(recipe: Value, environment: Value, payload: Value) -> Value {
    json!({
        "recipe": recipe,
        "recipe-pointer": 1,
        "recipe-path": [],
        "environment": environment,
        "payload": payload
    })
}

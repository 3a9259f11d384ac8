//! Multipart sequences and buffered references through the ISPyB connector.

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use common::{envelope, fan_out_recipe, Harness};
use dlstbx::config::IspybConfig;
use dlstbx::database::InMemoryMetadataStore;
use dlstbx::messaging::Transport;
use dlstbx::ispyb::{CommandCall, CommandOutcome, CommandRegistry, IspybCommand, IspybConnector, IspybError};
use dlstbx::service::CommonService;

/// Asks to be called again until it has been resumed `rounds` times
#[derive(Debug)]
struct AwaitIndexing {
    rounds: u64,
}

#[async_trait]
impl IspybCommand for AwaitIndexing {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let attempt = call.message.get("attempt").and_then(Value::as_u64).unwrap_or(0);
        if attempt < self.rounds {
            return Ok(CommandOutcome::Checkpoint {
                message: json!({"attempt": attempt + 1}),
                delay: Some(Duration::from_secs(5)),
            });
        }
        Ok(CommandOutcome::success(json!("indexed")))
    }
}

#[derive(Debug)]
struct Reject;

#[async_trait]
impl IspybCommand for Reject {
    async fn run(&self, _call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        Ok(CommandOutcome::failure("no such sample"))
    }
}

/// Returns its `value` parameter
#[derive(Debug)]
struct Emit;

#[async_trait]
impl IspybCommand for Emit {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        Ok(CommandOutcome::success(
            call.parameters.get("value").unwrap_or(Value::Null),
        ))
    }
}

/// Records the `parent_id` it was called with
#[derive(Debug, Default)]
struct RecordParent {
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl IspybCommand for RecordParent {
    async fn run(&self, call: &mut CommandCall<'_>) -> Result<CommandOutcome, IspybError> {
        let parent = call.required_i64("parent_id")?;
        self.seen.lock().push(parent);
        Ok(CommandOutcome::success(json!(parent)))
    }
}

struct Setup {
    h: Harness,
    store: Arc<InMemoryMetadataStore>,
    connector: IspybConnector,
    recorder: Arc<RecordParent>,
}

fn setup() -> Setup {
    let h = Harness::new();
    let store = Arc::new(InMemoryMetadataStore::new());
    let recorder = Arc::new(RecordParent::default());
    let mut registry = CommandRegistry::with_defaults();
    registry.register("await_indexing", Arc::new(AwaitIndexing { rounds: 2 }));
    registry.register("reject", Arc::new(Reject));
    registry.register("emit", Arc::new(Emit));
    registry.register("record_parent", recorder.clone());
    let config = IspybConfig {
        redelivery_delay_ms: 1,
        ..IspybConfig::default()
    };
    let connector = IspybConnector::new(store.clone(), config).with_registry(registry);
    Setup {
        h,
        store,
        connector,
        recorder,
    }
}

fn multipart(commands: Value) -> Value {
    let recipe = fan_out_recipe(
        "ispyb_connector",
        json!({"ispyb_command": "multipart_message", "ispyb_command_list": commands}),
        &[""],
    );
    envelope(recipe, json!({}), json!({}))
}

/// Activate until the queue drains, advancing the clock between rounds
async fn drain(h: &Harness, connector: &IspybConnector, step: f64) -> usize {
    let mut activations = 0;
    for _ in 0..100 {
        activations += h.activate(connector).await;
        if h.pending("ispyb_connector").await == 0 {
            return activations;
        }
        h.clock.advance_secs(step);
    }
    panic!("ispyb_connector queue never drained");
}

#[tokio::test]
async fn test_multipart_resumes_a_checkpointing_step_without_repeating_others() {
    let Setup {
        h, store, connector, ..
    } = setup();
    h.inject(
        "ispyb_connector",
        multipart(json!([
            {"ispyb_command": "register_processing", "program": "xia2", "store_result": "program_id"},
            {"ispyb_command": "await_indexing"},
            {"ispyb_command": "add_program_message", "program_id": "$program_id", "message": "indexed"}
        ])),
    )
    .await;

    let activations = drain(&h, &connector, 5.0).await;
    assert_eq!(activations, 5);

    // Steps 1 and 3 each wrote exactly once
    assert_eq!(store.calls(), vec!["register_processing", "add_program_message"]);
    let program_id = store.programs()[0].program_id;
    assert_eq!(store.program_messages()[0].program_id, program_id);

    // Two advances between steps plus two resumptions of the middle step
    let carriers = h.payloads("ispyb_connector");
    assert_eq!(carriers.len(), 4);
    let resumed: Vec<&Value> = carriers
        .iter()
        .filter_map(|c| c.get("step_message"))
        .collect();
    assert_eq!(resumed, vec![&json!({"attempt": 1}), &json!({"attempt": 2})]);
    assert_eq!(carriers[3]["checkpoint"], 2);
    assert_eq!(carriers[3]["ispyb_command_list"].as_array().unwrap().len(), 1);

    let downstream = h.payloads("out.");
    assert_eq!(downstream.len(), 1);
    assert_eq!(
        h.transport.published_to("out.")[0]["environment"]["program_id"],
        json!(program_id)
    );
}

#[tokio::test]
async fn test_multipart_failure_stops_the_sequence() {
    let Setup {
        h, store, connector, ..
    } = setup();
    h.inject(
        "ispyb_connector",
        multipart(json!([
            {"ispyb_command": "register_processing", "program": "xia2"},
            {"ispyb_command": "reject"},
            {"ispyb_command": "add_program_message", "program_id": 1, "message": "unreachable"}
        ])),
    )
    .await;

    drain(&h, &connector, 1.0).await;

    assert_eq!(store.calls(), vec!["register_processing"]);
    assert!(store.program_messages().is_empty());
    assert_eq!(h.transport.dead_letters("ispyb_connector").await.len(), 1);
    assert!(h.payloads("out.").is_empty());
}

fn buffer_message(payload: Value) -> Value {
    let recipe = fan_out_recipe("ispyb_connector", json!({"ispyb_command": "buffer"}), &[""]);
    envelope(recipe, json!({}), payload)
}

#[tokio::test]
async fn test_buffer_lookup_waits_for_the_producer() {
    let Setup {
        h,
        connector,
        recorder,
        ..
    } = setup();

    // Consumer starts first and misses
    h.inject(
        "ispyb_connector",
        buffer_message(json!({
            "program_id": 42,
            "buffer_command": {"ispyb_command": "record_parent"},
            "buffer_lookup": {"parent_id": "X"},
            "buffer_expiry_time": h.at(600.0)
        })),
    )
    .await;
    h.activate(&connector).await;
    let checkpoints = h.transport.published();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].delay, Some(Duration::from_secs(20)));
    assert!(recorder.seen.lock().is_empty());

    // Producer stores the value at t=15
    h.clock.advance_secs(15.0);
    h.transport
        .send(
            "ispyb_connector",
            buffer_message(json!({
                "program_id": 42,
                "buffer_command": {"ispyb_command": "emit", "value": 77},
                "buffer_store": "X"
            })),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(h.activate(&connector).await, 1);
    assert!(recorder.seen.lock().is_empty());

    // The consumer's next activation finds it
    h.clock.advance_secs(5.0);
    assert_eq!(h.activate(&connector).await, 1);
    assert_eq!(*recorder.seen.lock(), vec![77]);
    assert_eq!(h.pending("ispyb_connector").await, 0);
    assert_eq!(h.payloads("out.").last().unwrap()["result"], 77);
    assert!(h.transport.dead_letters("ispyb_connector").await.is_empty());
}

#[tokio::test]
async fn test_expired_buffer_lookup_fails_and_entries_are_evicted() {
    let Setup {
        h,
        store,
        connector,
        recorder,
    } = setup();

    h.inject(
        "ispyb_connector",
        buffer_message(json!({
            "program_id": 42,
            "buffer_command": {"ispyb_command": "emit", "value": 77},
            "buffer_store": "X"
        })),
    )
    .await;
    h.activate(&connector).await;
    assert_eq!(store.buffer_len(), 1);

    // A lookup whose window has already closed is rejected
    h.inject(
        "ispyb_connector",
        buffer_message(json!({
            "program_id": 42,
            "buffer_command": {"ispyb_command": "record_parent"},
            "buffer_lookup": {"parent_id": "Y"},
            "buffer_expiry_time": h.at(-1.0)
        })),
    )
    .await;
    h.activate(&connector).await;
    assert_eq!(h.transport.dead_letters("ispyb_connector").await.len(), 1);
    assert!(recorder.seen.lock().is_empty());

    // Entries outlive neither their TTL nor a service restart
    h.clock.advance_secs(601.0);
    connector.initializing(&h.context).await.unwrap();
    assert_eq!(store.buffer_len(), 0);
}

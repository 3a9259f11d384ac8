//! The generic runner loading a serialized recipe wrapper from disk.

use serde_json::{json, Value};
use std::sync::Arc;

use dlstbx::clock::FakeClock;
use dlstbx::messaging::InMemoryTransport;
use dlstbx::recipe::RecipeWrapper;
use dlstbx::wrapper::{WrapperError, WrapperRegistry, WrapperRunner};

fn serialized(workdir: &str, cmd: Value) -> Value {
    json!({
        "recipe": {
            "1": {
                "queue": "cluster.submission",
                "parameters": {"workingdir": "$workdir"},
                "wrapper": {"cmd": cmd, "timeout": 30},
                "output": {
                    "success": [2],
                    "failure": [3],
                    "result-individual-file": [4]
                }
            },
            "2": {"queue": "ispyb_connector", "parameters": {"ispyb_command": "update_processing_status", "status": "success"}},
            "3": {"queue": "ispyb_connector", "parameters": {"ispyb_command": "update_processing_status", "status": "failure"}},
            "4": {"queue": "ispyb_connector", "parameters": {"ispyb_command": "add_program_attachment"}},
            "start": [[1, {}]]
        },
        "recipe-pointer": 1,
        "recipe-path": [],
        "environment": {"workdir": workdir, "program_id": 1001},
        "payload": {"dcid": 5}
    })
}

async fn load(dir: &tempfile::TempDir, cmd: Value, transport: Arc<InMemoryTransport>) -> RecipeWrapper {
    let workdir = dir.path().join("job").display().to_string();
    let file = dir.path().join("recipewrapper.json");
    std::fs::write(&file, serialized(&workdir, cmd).to_string()).unwrap();
    RecipeWrapper::from_file(&file, transport).await.unwrap()
}

fn runner() -> WrapperRunner {
    WrapperRunner::new(WrapperRegistry::with_defaults(), Arc::new(FakeClock::new()))
}

fn statuses(transport: &InMemoryTransport) -> Vec<String> {
    transport
        .published_to("transient_status")
        .iter()
        .map(|m| m["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_subprocess_success_reports_to_ispyb() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let rw = load(&dir, json!(["sh", "-c", "echo processed"]), transport.clone()).await;

    assert!(runner().run("subprocess", rw).await.unwrap());

    let to_ispyb = transport.published_to("ispyb_connector");
    assert_eq!(to_ispyb.len(), 2);
    assert_eq!(to_ispyb[0]["recipe-pointer"], 4);
    assert_eq!(to_ispyb[0]["payload"]["file_name"], "subprocess.stdout");
    assert_eq!(to_ispyb[1]["recipe-pointer"], 2);
    assert_eq!(to_ispyb[1]["payload"], json!({"dcid": 5}));
    assert_eq!(to_ispyb[1]["environment"]["program_id"], 1001);
    assert_eq!(statuses(&transport), vec!["starting", "finished"]);
    assert!(dir.path().join("job").join("subprocess.stdout").exists());
}

#[tokio::test]
async fn test_subprocess_failure_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let rw = load(&dir, json!("echo broken >&2; exit 1"), transport.clone()).await;

    assert!(!runner().run("subprocess", rw).await.unwrap());

    let pointers: Vec<Value> = transport
        .published_to("ispyb_connector")
        .iter()
        .map(|m| m["recipe-pointer"].clone())
        .collect();
    assert_eq!(pointers, vec![json!(4), json!(3)]);
    assert_eq!(statuses(&transport), vec!["starting", "failed"]);
}

#[tokio::test]
async fn test_unknown_wrapper_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let rw = load(&dir, json!(["true"]), transport.clone()).await;

    let err = runner().run("autoPROC", rw).await.unwrap_err();
    assert!(matches!(err, WrapperError::UnknownWrapper { .. }));
    assert!(transport.published().is_empty());
}

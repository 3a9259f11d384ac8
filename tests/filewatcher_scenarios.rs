//! End-to-end filewatcher watches driven by a fake clock.

mod common;

use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use common::{envelope, fan_out_recipe, Harness};
use dlstbx::config::FilewatcherConfig;
use dlstbx::filewatcher::FilewatcherService;

const OUTPUTS: &[&str] = &[
    "first", "every", "every-2", "last", "select-3", "7", "finally", "any", "timeout",
];

/// Files that appear on disk once the fake clock reaches their time
struct Schedule {
    files: Vec<(f64, PathBuf)>,
}

impl Schedule {
    fn new() -> Self {
        Self { files: Vec::new() }
    }

    fn add(&mut self, at: f64, path: PathBuf) {
        self.files.push((at, path));
    }

    fn materialize(&self, elapsed: f64) {
        for (at, path) in &self.files {
            if *at <= elapsed && !path.exists() {
                std::fs::write(path, b"").unwrap();
            }
        }
    }
}

/// Activate the watch once per fake second until it ends or `limit` passes
async fn run_watch(h: &Harness, service: &FilewatcherService, schedule: &Schedule, limit: f64) {
    while h.elapsed() <= limit {
        schedule.materialize(h.elapsed());
        h.activate(service).await;
        if h.pending("filewatcher").await == 0 {
            return;
        }
        h.clock.advance_secs(1.0);
    }
    panic!("watch still running after {limit}s");
}

fn indices(h: &Harness, output: &str, key: &str) -> Vec<u64> {
    h.payloads(&format!("out.{output}"))
        .iter()
        .map(|p| p[key].as_u64().unwrap())
        .collect()
}

fn letter_files(dir: &Path) -> Vec<PathBuf> {
    ('A'..='J').map(|c| dir.join(c.to_string())).collect()
}

fn list_parameters(files: &[PathBuf]) -> Value {
    let list: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
    json!({
        "list": list,
        "burst-limit": 3,
        "timeout-first": 60,
        "timeout": 120
    })
}

#[tokio::test]
async fn test_list_mode_happy_path() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let files = letter_files(dir.path());
    let mut schedule = Schedule::new();
    for (i, file) in files.iter().enumerate() {
        schedule.add(if i < 5 { 5.0 } else { 65.0 }, file.clone());
    }

    let recipe = fan_out_recipe("filewatcher", list_parameters(&files), OUTPUTS);
    h.inject("filewatcher", envelope(recipe, json!({}), json!({}))).await;
    let service = FilewatcherService::new(FilewatcherConfig::default());
    run_watch(&h, &service, &schedule, 300.0).await;

    let first = h.payloads("out.first");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["file"], files[0].display().to_string());
    assert_eq!(first[0]["file-list-index"], 1);

    assert_eq!(
        indices(&h, "every", "file-list-index"),
        (1..=10).collect::<Vec<_>>()
    );
    assert_eq!(indices(&h, "every-2", "file-list-index"), vec![1, 3, 5, 7, 9]);
    assert_eq!(indices(&h, "select-3", "file-list-index"), vec![1, 6, 10]);
    assert_eq!(indices(&h, "7", "file-list-index"), vec![7]);
    assert_eq!(indices(&h, "last", "file-list-index"), vec![10]);

    assert_eq!(
        h.payloads("out.finally"),
        vec![json!({"files-expected": 10, "files-seen": 10, "success": true})]
    );
    assert_eq!(
        h.payloads("out.any"),
        vec![json!({"files-expected": 10, "files-seen": 10})]
    );
    assert!(h.payloads("out.timeout").is_empty());
    assert!(h.elapsed() >= 65.0);
}

#[tokio::test]
async fn test_list_mode_timeout_first() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let files = letter_files(dir.path());

    let recipe = fan_out_recipe("filewatcher", list_parameters(&files), OUTPUTS);
    h.inject("filewatcher", envelope(recipe, json!({}), json!({}))).await;
    let service = FilewatcherService::new(FilewatcherConfig::default());
    run_watch(&h, &service, &Schedule::new(), 300.0).await;

    assert!(h.elapsed() >= 60.0);
    for output in ["first", "every", "every-2", "last", "select-3", "7", "any"] {
        assert!(h.payloads(&format!("out.{output}")).is_empty(), "{output} fired");
    }
    assert_eq!(
        h.payloads("out.timeout"),
        vec![json!({
            "file": files[0].display().to_string(),
            "file-list-index": 1,
            "success": false
        })]
    );
    let finally = h.payloads("out.finally");
    assert_eq!(finally.len(), 1);
    assert_eq!(finally[0]["success"], false);
    assert_eq!(finally[0]["files-seen"], 0);
}

#[tokio::test]
async fn test_pattern_mode_selection() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let mut schedule = Schedule::new();
    for i in 1..=200u32 {
        let at = if i <= 100 {
            0.1 * f64::from(i)
        } else {
            60.0 + 0.1 * f64::from(i - 101)
        };
        schedule.add(at, dir.path().join(format!("tst_{i:05}.cbf")));
    }

    let parameters = json!({
        "pattern": dir.path().join("tst_%05d.cbf").display().to_string(),
        "pattern-start": 1,
        "pattern-end": 200,
        "burst-limit": 40,
        "timeout-first": 60,
        "timeout": 120
    });
    let recipe = fan_out_recipe(
        "filewatcher",
        parameters,
        &["select-30", "last", "finally", "timeout"],
    );
    h.inject("filewatcher", envelope(recipe, json!({}), json!({}))).await;
    let service = FilewatcherService::new(FilewatcherConfig::default());
    run_watch(&h, &service, &schedule, 300.0).await;

    let expected: Vec<u64> = vec![
        1, 7, 14, 21, 28, 35, 42, 49, 56, 63, 69, 76, 83, 90, 97, 104, 111, 118, 125, 132, 138,
        145, 152, 159, 166, 173, 180, 187, 194, 200,
    ];
    assert_eq!(indices(&h, "select-30", "file-number"), expected);
    assert_eq!(indices(&h, "last", "file-number"), vec![200]);
    let finally = h.payloads("out.finally");
    assert_eq!(finally.len(), 1);
    assert_eq!(finally[0]["success"], true);
    assert!(h.payloads("out.timeout").is_empty());
}

#[tokio::test]
async fn test_empty_list_short_circuits() {
    let h = Harness::new();
    let recipe = fan_out_recipe("filewatcher", json!({"list": [null]}), OUTPUTS);
    h.inject("filewatcher", envelope(recipe, json!({}), json!({}))).await;
    let service = FilewatcherService::new(FilewatcherConfig::default());

    assert_eq!(h.activate(&service).await, 1);

    assert_eq!(h.pending("filewatcher").await, 0);
    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].destination, "out.finally");
    assert_eq!(
        published[0].message["payload"],
        json!({"files-expected": 0, "files-seen": 0, "success": true})
    );
}

#[tokio::test]
async fn test_redelivered_activation_repeats_the_same_effects() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let files = letter_files(dir.path());
    for file in &files[..4] {
        std::fs::write(file, b"").unwrap();
    }
    let recipe = fan_out_recipe("filewatcher", list_parameters(&files), OUTPUTS);
    let message = envelope(recipe, json!({}), json!({"dcid": 7}));
    let service = FilewatcherService::new(FilewatcherConfig::default());

    let mut runs = Vec::new();
    for _ in 0..2 {
        h.inject("filewatcher", message.clone()).await;
        h.activate(&service).await;
        let mut effects: Vec<(String, Value)> = h
            .transport
            .published()
            .into_iter()
            .map(|record| (record.destination, record.message["payload"].clone()))
            .collect();
        effects.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.to_string().cmp(&b.1.to_string())));
        runs.push(effects);
        h.transport.take_messages("filewatcher").await;
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(
        runs[0].iter().filter(|(d, _)| d == "out.every").count(),
        3
    );
}

#[tokio::test]
async fn test_lost_broker_commit_dead_letters_and_stops_the_service() {
    let (h, broker) = Harness::with_flaky_transport();
    let dir = tempfile::tempdir().unwrap();
    let files = letter_files(dir.path());
    std::fs::write(&files[0], b"").unwrap();
    let recipe = fan_out_recipe("filewatcher", list_parameters(&files), OUTPUTS);
    h.inject("filewatcher", envelope(recipe, json!({}), json!({}))).await;
    let service = FilewatcherService::new(FilewatcherConfig::default());

    broker.fail_next(1);
    assert_eq!(h.activate(&service).await, 1);

    assert!(h.context.termination_requested());
    assert!(h.transport.published().is_empty());
    assert_eq!(h.transport.dead_letters("filewatcher").await.len(), 1);
    assert_eq!(h.pending("filewatcher").await, 0);
}

#[tokio::test]
async fn test_unusable_messages_are_dead_lettered_without_stopping() {
    let h = Harness::new();
    let service = FilewatcherService::new(FilewatcherConfig::default());
    let list = fan_out_recipe("filewatcher", json!({"list": ["/x/A"]}), OUTPUTS);
    h.inject("filewatcher", envelope(list, json!({}), json!(["not", "an", "object"])))
        .await;
    let hdf5 = fan_out_recipe("filewatcher", json!({"hdf5": "/x/x_master.h5"}), OUTPUTS);
    h.inject("filewatcher", envelope(hdf5, json!({}), json!({}))).await;

    assert_eq!(h.activate(&service).await, 2);

    assert!(!h.context.termination_requested());
    assert_eq!(h.transport.dead_letters("filewatcher").await.len(), 2);
    assert!(h.transport.published().is_empty());
}

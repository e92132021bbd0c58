use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use wasmgate_daemon::config::{GateConfig, WorkerTuning};
use wasmgate_daemon::ingress::{dispatch_impl, patch_impl, status_impl, PatchBody};
use wasmgate_daemon::{snapshot, GateState};

static NEXT_PORT: AtomicU16 = AtomicU16::new(15600);

const NOOP_WAT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")))"#;

struct TestGate {
    state: GateState,
    _root: tempfile::TempDir,
}

fn build_gate(mutate: impl FnOnce(&mut GateConfig)) -> TestGate {
    let root = tempfile::tempdir().unwrap();
    let artifact = root.path().join("fn.wasm");
    std::fs::write(&artifact, wat::parse_str(NOOP_WAT).unwrap()).unwrap();

    let mut cfg = GateConfig::default();
    cfg.path = artifact;
    cfg.data_dir = root.path().join("data");
    cfg.crash_path = root.path().join("crashes");
    cfg.cluster_port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    cfg.api_keys = vec!["abc".to_string()];
    mutate(&mut cfg);

    let state = GateState::build_with_tuning(
        cfg,
        WorkerTuning {
            backoff_unit: Duration::from_millis(10),
            ack_wait: Duration::from_millis(300),
        },
    )
    .unwrap();
    TestGate { state, _root: root }
}

async fn submit(state: &GateState, path: &str) {
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", HeaderValue::from_static("abc"));
    let uri: Uri = path.parse().unwrap();
    dispatch_impl(
        state,
        "10.0.0.9:41000".parse().unwrap(),
        Method::POST,
        uri,
        headers,
        Bytes::from_static(b"{}"),
    )
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn patch_reload_drains_running_workers() {
    let gate = build_gate(|_| {});
    let state = &gate.state;

    submit(state, "/warmup").await;
    assert_eq!(state.workers.running_tenants(), vec!["abc".to_string()]);

    let patched = patch_impl(
        state,
        PatchBody {
            pool_size: None,
            reload: true,
        },
    )
    .await;
    assert_eq!(patched["status"], "patched");
    assert!(state.workers.running_tenants().is_empty());

    // Lazy machinery restarts the pool on the next request.
    submit(state, "/after-reload").await;
    assert_eq!(state.workers.running_tenants(), vec!["abc".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn patch_without_fields_changes_nothing() {
    let gate = build_gate(|_| {});
    let state = &gate.state;
    submit(state, "/warmup").await;

    patch_impl(state, PatchBody::default()).await;
    assert_eq!(state.workers.pool_size(), 2);
    assert_eq!(state.workers.running_tenants(), vec!["abc".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reflects_provisioned_streams() {
    let gate = build_gate(|cfg| cfg.pool_size = 0);
    let state = &gate.state;
    submit(state, "/one").await;
    submit(state, "/two").await;

    let status = status_impl(state);
    assert_eq!(status["streams"]["WORKER_ABC"], 2);
    assert_eq!(status["pool_size"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_then_restore_recovers_queued_work() {
    let gate = build_gate(|cfg| cfg.pool_size = 0);
    let state = &gate.state;

    submit(state, "/precious").await;
    assert_eq!(state.broker.stream("WORKER_ABC").unwrap().depth(), 1);

    let snap = snapshot::create_snapshot(state.broker.data_dir()).unwrap();
    assert!(snap.exists());

    // Wreck the live journal, schedule the restore, apply it the way the
    // next startup would.
    let journal = state
        .broker
        .data_dir()
        .join("streams/WORKER_ABC/journal.log");
    std::fs::write(&journal, b"corruption").unwrap();
    snapshot::schedule_restore(state.broker.data_dir(), &snap).unwrap();
    let applied = snapshot::apply_pending_restore(state.broker.data_dir()).unwrap();
    assert_eq!(applied, Some(snap));

    // A fresh broker over the restored directory sees the queued job.
    let reopened = wasmgate_broker::Broker::open(state.broker.data_dir()).unwrap();
    let stream = reopened
        .ensure_stream(wasmgate_broker::StreamConfig {
            name: "WORKER_ABC".to_string(),
            subjects: vec!["wasmgate.tenant.abc.exec.*".to_string()],
            ..wasmgate_broker::StreamConfig::default()
        })
        .unwrap();
    assert_eq!(stream.depth(), 1);
}

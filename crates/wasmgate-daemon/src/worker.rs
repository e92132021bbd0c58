// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wasmgate_broker::{Delivery, Stream};
use wasmgate_core::{
    EngineSettings, HostServices, Invocation, InvocationContext, Mount, RequestEnvelope,
    ResponseEnvelope, SandboxEngine, SandboxError,
};

use crate::audit::{audit_key, AuditRecord, AuditSigner};
use crate::crash::{CrashRecorder, CrashSnapshot};
use crate::telemetry::Telemetry;
use crate::tenant::TenantManager;

/// Delivery attempts before a job is dead-lettered.
pub const MAX_RETRIES: u32 = 5;

/// Everything a worker needs, shared across all tenants' pools.
pub struct WorkerShared {
    pub module_bytes: Vec<u8>,
    pub artifact_path: PathBuf,
    pub engine_settings: EngineSettings,
    pub services: Arc<HostServices>,
    pub tenants: Arc<TenantManager>,
    pub audit: AuditSigner,
    pub crashes: CrashRecorder,
    pub telemetry: Telemetry,
    pub timeout: Duration,
    pub backoff_unit: Duration,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub pool_size: Arc<AtomicUsize>,
}

struct TenantWorkers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Lazily started per-tenant subscriber pools. Every worker owns its own
/// compiled engine; the shared stream ready-queue load-balances them.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    runtime: Handle,
    running: Mutex<HashMap<String, TenantWorkers>>,
}

impl WorkerPool {
    pub fn new(shared: Arc<WorkerShared>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            shared,
            runtime,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size.load(Ordering::Relaxed)
    }

    pub fn set_pool_size(&self, size: usize) -> usize {
        self.shared.pool_size.swap(size, Ordering::Relaxed)
    }

    /// Starts the tenant's subscribers if none are running. Idempotent; a
    /// pool size of zero leaves the tenant's queue untouched.
    pub fn ensure_started(&self, tenant: &str) {
        let mut running = self.running.lock();
        if running.contains_key(tenant) {
            return;
        }
        let size = self.pool_size();
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            let shared = self.shared.clone();
            let tenant = tenant.to_string();
            let cancel = cancel.clone();
            handles.push(self.runtime.spawn(async move {
                run_worker(shared, tenant, worker_id, cancel).await;
            }));
        }
        tracing::info!(tenant, workers = size, "tenant worker pool started");
        running.insert(tenant.to_string(), TenantWorkers { cancel, handles });
    }

    /// Drains one tenant: stop pulling, finish in-flight work, forget the
    /// pool so the lazy-start machinery can rebuild it.
    pub async fn drain_tenant(&self, tenant: &str) {
        let entry = self.running.lock().remove(tenant);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            for handle in entry.handles {
                let _ = handle.await;
            }
            tracing::info!(tenant, "tenant workers drained");
        }
    }

    /// Hot reload: drain every tenant's subscribers. Fresh pools spin up
    /// on demand with the current pool size.
    pub async fn drain_all(&self) {
        let drained: Vec<(String, TenantWorkers)> = self.running.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!("hot reload initiated: recycling tenant workers");
        for (tenant, entry) in drained {
            entry.cancel.cancel();
            for handle in entry.handles {
                let _ = handle.await;
            }
            tracing::debug!(tenant, "workers drained");
        }
        tracing::info!("hot reload complete; workers will spin up on demand");
    }

    pub fn running_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.running.lock().keys().cloned().collect();
        tenants.sort();
        tenants
    }
}

async fn run_worker(
    shared: Arc<WorkerShared>,
    tenant: String,
    worker_id: usize,
    cancel: CancellationToken,
) {
    let engine = match SandboxEngine::new(
        &shared.module_bytes,
        shared.engine_settings.clone(),
        shared.services.clone(),
    ) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            tracing::error!(tenant, worker_id, error = %err, "failed to build worker sandbox engine");
            return;
        }
    };
    let stream = match shared.tenants.stream(&tenant) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(tenant, worker_id, error = %err, "failed to bind tenant stream");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = stream.next() => {
                process_delivery(&shared, &tenant, engine.clone(), &stream, delivery).await;
            }
        }
    }
}

fn invocation_for(shared: &WorkerShared, body: &[u8], deadline: Duration) -> Invocation {
    let context = match RequestEnvelope::from_json(body) {
        Ok(request) if request.method == "ASYNC" => InvocationContext::Background {
            payload: request.body,
        },
        Ok(request) => InvocationContext::Http { request },
        Err(_) => InvocationContext::Background {
            payload: String::from_utf8_lossy(body).into_owned(),
        },
    };
    Invocation {
        stdin: body.to_vec(),
        argv: shared.argv.clone(),
        env: shared.env.clone(),
        mounts: shared.mounts.clone(),
        deadline,
        context,
    }
}

async fn process_delivery(
    shared: &Arc<WorkerShared>,
    tenant: &str,
    engine: Arc<SandboxEngine>,
    stream: &Arc<Stream>,
    delivery: Delivery,
) {
    stream.in_progress(delivery.seq);
    let seq = delivery.seq;
    let attempt = delivery.delivered;

    let invocation = invocation_for(shared, &delivery.body, shared.timeout);
    shared.telemetry.sandbox_started();
    let outcome = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.run(invocation)).await
    };
    shared.telemetry.sandbox_finished();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(join_err) => {
            tracing::error!(tenant, seq, error = %join_err, "sandbox task aborted");
            shared.telemetry.job_failed(tenant);
            stream.nak_with_delay(seq, shared.backoff_unit * attempt);
            return;
        }
    };

    match outcome {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            match ResponseEnvelope::from_json(stdout.as_bytes()) {
                Ok(response) => {
                    tracing::info!(tenant, seq, status = response.status, "guest response");
                }
                Err(_) if !stdout.is_empty() => {
                    tracing::debug!(tenant, seq, "guest emitted non-protocol output");
                }
                Err(_) => {}
            }
            if !stdout.is_empty() {
                tracing::info!(tenant, seq, stdout = %stdout, "tenant worker output");
            }
            if !stderr.is_empty() {
                tracing::info!(tenant, seq, stderr = %stderr, "tenant worker log");
            }

            write_audit_record(shared, tenant, seq, &stdout, &stderr);

            shared.telemetry.job_succeeded(tenant);
            if let Err(err) = stream.ack(seq) {
                tracing::warn!(tenant, seq, error = %err, "failed to ack job");
            }
        }
        Err(failure) => {
            let error_text = format!("wasm execution failed: {failure}");
            if failure.error.is_resource_exhausted() {
                tracing::warn!(tenant, seq, attempt, error = %failure.error, "job hit a resource bound");
            } else if let SandboxError::Trap(ref reason) = failure.error {
                tracing::warn!(tenant, seq, attempt, reason = %reason, "job trapped");
            }

            if attempt >= MAX_RETRIES {
                let snapshot = CrashSnapshot::new(
                    error_text,
                    &delivery.body,
                    shared.env.clone(),
                    shared.artifact_path.clone(),
                );
                shared.crashes.record(tenant, seq, &snapshot);
                shared.telemetry.job_dead_lettered(tenant);
                // Poison-message removal: the retry budget is spent.
                if let Err(err) = stream.ack(seq) {
                    tracing::warn!(tenant, seq, error = %err, "failed to ack dead-lettered job");
                }
            } else {
                shared.telemetry.job_failed(tenant);
                stream.nak_with_delay(seq, shared.backoff_unit * attempt);
            }
        }
    }
}

fn write_audit_record(shared: &Arc<WorkerShared>, tenant: &str, seq: u64, stdout: &str, stderr: &str) {
    let kv = match shared.tenants.ensure(tenant) {
        Ok(kv) => kv,
        Err(err) => {
            tracing::error!(tenant, seq, error = %err, "tenant state bucket unavailable; audit skipped");
            return;
        }
    };
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let signature = shared.audit.sign(tenant, seq, stdout, stderr, &timestamp);
    let record = AuditRecord {
        job_id: seq,
        timestamp,
        signature: signature.clone(),
        status: "success".to_string(),
    };
    let body = match serde_json::to_vec(&record) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(tenant, seq, error = %err, "failed to encode audit record");
            return;
        }
    };
    match kv.put(&audit_key(seq), &body) {
        Ok(_) => {
            let preview = signature.get(..16).unwrap_or(&signature);
            tracing::info!(tenant, key = %audit_key(seq), signature = %format!("{preview}..."), "signed audit record saved");
        }
        Err(err) => {
            tracing::error!(tenant, seq, error = %err, "failed to persist audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_tests() -> WorkerShared {
        let dir = tempfile::tempdir().unwrap();
        let broker = wasmgate_broker::Broker::open(dir.path()).unwrap();
        WorkerShared {
            module_bytes: Vec::new(),
            artifact_path: PathBuf::from("fn.wasm"),
            engine_settings: EngineSettings::default(),
            services: HostServices::detached(),
            tenants: Arc::new(TenantManager::new(broker, 1, Duration::from_secs(30), 6)),
            audit: AuditSigner::new("test"),
            crashes: CrashRecorder::new(dir.path().join("crashes"), true),
            telemetry: Telemetry::new(),
            timeout: Duration::from_secs(1),
            backoff_unit: Duration::from_millis(10),
            argv: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            pool_size: Arc::new(AtomicUsize::new(2)),
        }
    }

    #[test]
    fn http_envelopes_keep_their_request_context() {
        let shared = shared_for_tests();
        let body = br#"{"method":"POST","uri":"/x","headers":{},"body":"hi"}"#;
        let invocation = invocation_for(&shared, body, Duration::from_secs(1));
        match invocation.context {
            InvocationContext::Http { request } => {
                assert_eq!(request.method, "POST");
                assert_eq!(request.body, "hi");
            }
            other => panic!("expected http context, got {}", other.kind()),
        }
    }

    #[test]
    fn async_envelopes_become_background_context() {
        let shared = shared_for_tests();
        let body =
            br#"{"method":"ASYNC","uri":"internal://async/job","headers":{},"body":"{\"k\":1}"}"#;
        let invocation = invocation_for(&shared, body, Duration::from_secs(1));
        match invocation.context {
            InvocationContext::Background { payload } => assert_eq!(payload, "{\"k\":1}"),
            other => panic!("expected background context, got {}", other.kind()),
        }
    }

    #[test]
    fn malformed_bodies_still_run_as_background() {
        let shared = shared_for_tests();
        let invocation = invocation_for(&shared, b"raw bytes", Duration::from_secs(1));
        assert!(matches!(invocation.context, InvocationContext::Background { .. }));
        assert_eq!(invocation.stdin, b"raw bytes");
    }
}

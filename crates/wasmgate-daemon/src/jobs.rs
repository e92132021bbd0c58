use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use wasmgate_core::bridge::{BridgeError, JobSink};
use wasmgate_core::RequestEnvelope;

use crate::tenant::{self, TenantManager, SYSTEM_TENANT};
use crate::worker::WorkerPool;

/// Routes `host_enqueue` and cron work into the reserved `system` tenant's
/// stream. The worker pool is attached after construction because the pool
/// itself needs the sink to build its sandboxes.
pub struct GateJobSink {
    tenants: Arc<TenantManager>,
    workers: OnceCell<Arc<WorkerPool>>,
}

impl GateJobSink {
    pub fn new(tenants: Arc<TenantManager>) -> Arc<Self> {
        Arc::new(Self {
            tenants,
            workers: OnceCell::new(),
        })
    }

    pub fn attach_workers(&self, workers: Arc<WorkerPool>) {
        let _ = self.workers.set(workers);
    }

    /// The envelope background jobs carry; the module body reads it from
    /// stdin like any other job.
    pub fn background_envelope(payload: &str) -> RequestEnvelope {
        let mut headers = BTreeMap::new();
        headers.insert("X-Source".to_string(), vec!["internal".to_string()]);
        RequestEnvelope {
            method: "ASYNC".to_string(),
            uri: "internal://async/job".to_string(),
            headers,
            body: payload.to_string(),
        }
    }
}

impl JobSink for GateJobSink {
    fn enqueue(&self, module_path: &str, payload: &str) -> Result<(), BridgeError> {
        self.tenants
            .ensure(SYSTEM_TENANT)
            .map_err(|err| BridgeError::Backend(err.to_string()))?;
        if let Some(workers) = self.workers.get() {
            workers.ensure_started(SYSTEM_TENANT);
        }

        let envelope = Self::background_envelope(payload);
        let body = envelope
            .to_json()
            .map_err(|err| BridgeError::Backend(err.to_string()))?;

        let subject = tenant::exec_subject(SYSTEM_TENANT, &tenant::module_fingerprint(module_path));
        let msg_id = format!(
            "job_{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let (_, seq) = self
            .tenants
            .broker()
            .publish(&subject, &msg_id, &body)
            .map_err(|err| BridgeError::Backend(err.to_string()))?;

        tracing::info!(module = %module_path, msg_id = %msg_id, seq, "async job persisted and queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn enqueue_lands_in_the_system_stream() {
        let dir = tempfile::tempdir().unwrap();
        let broker = wasmgate_broker::Broker::open(dir.path()).unwrap();
        let tenants = Arc::new(TenantManager::new(broker.clone(), 1, Duration::from_secs(30), 6));
        let sink = GateJobSink::new(tenants);

        sink.enqueue("functions/report.wasm", r#"{"kind":"nightly"}"#).unwrap();

        let stream = broker.stream("WORKER_SYSTEM").unwrap();
        assert_eq!(stream.depth(), 1);
    }

    #[test]
    fn background_envelope_is_marked_async() {
        let envelope = GateJobSink::background_envelope("{}");
        assert_eq!(envelope.method, "ASYNC");
        assert_eq!(envelope.uri, "internal://async/job");
        assert_eq!(envelope.headers["X-Source"], vec!["internal".to_string()]);
    }
}

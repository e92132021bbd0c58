use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use wasmgate_broker::{Broker, BrokerError, KvBucket, KvConfig, Retention, Storage, Stream, StreamConfig};

/// All tenant subjects live under this prefix.
pub const SUBJECT_PREFIX: &str = "wasmgate.tenant";

/// Reserved tenant for cron and `host_enqueue` background work.
pub const SYSTEM_TENANT: &str = "system";

pub fn stream_name(tenant: &str) -> String {
    format!("WORKER_{}", tenant.to_uppercase())
}

pub fn kv_name(tenant: &str) -> String {
    format!("STATE_{}", tenant.to_uppercase())
}

pub fn subject_filter(tenant: &str) -> String {
    format!("{SUBJECT_PREFIX}.{tenant}.exec.*")
}

pub fn exec_subject(tenant: &str, fingerprint: &str) -> String {
    format!("{SUBJECT_PREFIX}.{tenant}.exec.{fingerprint}")
}

/// Stable fingerprint of a module path, used as the exec subject leaf.
pub fn module_fingerprint(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives a tenant id from the peer address when no API keys are
/// configured: the port is dropped and separator characters flattened so
/// the id is usable inside resource names and subjects.
pub fn tenant_from_addr(addr: &SocketAddr) -> String {
    addr.ip().to_string().replace(['.', ':'], "_")
}

/// Lazily provisions and caches per-tenant broker resources.
pub struct TenantManager {
    broker: Arc<Broker>,
    replicas: usize,
    ack_wait: Duration,
    max_deliver: u32,
    handles: Mutex<HashMap<String, Arc<KvBucket>>>,
}

impl TenantManager {
    pub fn new(broker: Arc<Broker>, replicas: usize, ack_wait: Duration, max_deliver: u32) -> Self {
        Self {
            broker,
            replicas,
            ack_wait,
            max_deliver,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Idempotent first-touch provisioning: ensures the tenant's work
    /// stream and state bucket exist, returning the cached bucket handle.
    pub fn ensure(&self, tenant: &str) -> Result<Arc<KvBucket>, BrokerError> {
        if let Some(kv) = self.handles.lock().get(tenant) {
            return Ok(kv.clone());
        }

        tracing::info!(tenant, stream = %stream_name(tenant), "provisioning isolated tenant stream");
        self.broker.ensure_stream(StreamConfig {
            name: stream_name(tenant),
            subjects: vec![subject_filter(tenant)],
            storage: Storage::File,
            retention: Retention::WorkQueue,
            replicas: self.replicas,
            max_deliver: self.max_deliver,
            ack_wait: self.ack_wait,
        })?;

        let kv = self.broker.ensure_kv(KvConfig {
            bucket: kv_name(tenant),
            description: format!("Isolated state for {tenant}"),
            storage: Storage::File,
            history: 1,
            replicas: self.replicas,
        })?;

        self.handles.lock().insert(tenant.to_string(), kv.clone());
        Ok(kv)
    }

    /// The tenant's work stream, provisioning on first touch.
    pub fn stream(&self, tenant: &str) -> Result<Arc<Stream>, BrokerError> {
        self.ensure(tenant)?;
        self.broker
            .stream(&stream_name(tenant))
            .ok_or(BrokerError::NotReady)
    }
}

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0} is not configured on this host")]
    Unconfigured(&'static str),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Read-query seam for `host_db_query`. The concrete drivers are external
/// collaborators; the host surface only needs rows-as-JSON.
pub trait SqlBridge: Send + Sync {
    fn query_json(&self, sql: &str) -> Result<Vec<u8>, BridgeError>;
}

/// Object-store seam for `host_s3_put` / `host_s3_get`.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), BridgeError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, BridgeError>;
}

/// Queue seam for `host_enqueue`: schedule an asynchronous execution of
/// another module with the given payload.
pub trait JobSink: Send + Sync {
    fn enqueue(&self, module_path: &str, payload: &str) -> Result<(), BridgeError>;
}

pub struct UnconfiguredSql;

impl SqlBridge for UnconfiguredSql {
    fn query_json(&self, _sql: &str) -> Result<Vec<u8>, BridgeError> {
        Err(BridgeError::Unconfigured("database"))
    }
}

pub struct UnconfiguredStore;

impl ObjectStore for UnconfiguredStore {
    fn put(&self, _key: &str, _data: &[u8]) -> Result<(), BridgeError> {
        Err(BridgeError::Unconfigured("object store"))
    }

    fn get(&self, _key: &str) -> Result<Vec<u8>, BridgeError> {
        Err(BridgeError::Unconfigured("object store"))
    }
}

pub struct UnconfiguredSink;

impl JobSink for UnconfiguredSink {
    fn enqueue(&self, _module_path: &str, _payload: &str) -> Result<(), BridgeError> {
        Err(BridgeError::Unconfigured("job queue"))
    }
}

/// Memory-backed object store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), BridgeError> {
        self.objects.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BridgeError> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(key.to_string()))
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// In-process key-value map backing `host_kv_set` / `host_kv_get`.
///
/// One instance is shared by every worker in the process, so guests see a
/// single consistent namespace. The tenant-scoped durable buckets are
/// reserved for audit records.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        self.inner.lock().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::journal::Journal;
use crate::stream::Storage;
use crate::BrokerError;

#[derive(Debug, Clone)]
pub struct KvConfig {
    pub bucket: String,
    pub description: String,
    pub storage: Storage,
    /// Revisions retained per key. The platform provisions history = 1:
    /// last writer wins, no version lookups.
    pub history: u32,
    pub replicas: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            description: String::new(),
            storage: Storage::File,
            history: 1,
            replicas: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KvPut {
    key: String,
    value: String,
    revision: u64,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    revision: u64,
}

struct KvState {
    entries: HashMap<String, KvEntry>,
    next_revision: u64,
    journal: Option<Journal>,
}

/// A history-1 durable key-value bucket.
pub struct KvBucket {
    cfg: KvConfig,
    state: Mutex<KvState>,
}

impl KvBucket {
    pub(crate) fn open(dir: PathBuf, cfg: KvConfig) -> Result<Arc<Self>, BrokerError> {
        let mut state = KvState {
            entries: HashMap::new(),
            next_revision: 1,
            journal: None,
        };
        if cfg.storage == Storage::File {
            let (journal, records) = Journal::open(dir.join("journal.log"))?;
            for raw in records {
                let Ok(put) = serde_json::from_slice::<KvPut>(&raw) else {
                    return Err(BrokerError::Corrupt(journal.path().to_path_buf()));
                };
                let value = base64::engine::general_purpose::STANDARD
                    .decode(put.value)
                    .map_err(|_| BrokerError::Corrupt(journal.path().to_path_buf()))?;
                state.next_revision = state.next_revision.max(put.revision + 1);
                state.entries.insert(
                    put.key,
                    KvEntry {
                        value,
                        revision: put.revision,
                    },
                );
            }
            state.journal = Some(journal);
        }
        Ok(Arc::new(Self {
            cfg,
            state: Mutex::new(state),
        }))
    }

    pub fn name(&self) -> &str {
        &self.cfg.bucket
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<u64, BrokerError> {
        let mut state = self.state.lock();
        let revision = state.next_revision;
        if let Some(journal) = state.journal.as_mut() {
            let record = KvPut {
                key: key.to_string(),
                value: base64::engine::general_purpose::STANDARD.encode(value),
                revision,
            };
            let payload =
                serde_json::to_vec(&record).map_err(|_| BrokerError::Corrupt(PathBuf::new()))?;
            journal.append(&payload)?;
        }
        state.next_revision += 1;
        state.entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_vec(),
                revision,
            },
        );
        Ok(revision)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(dir: &std::path::Path) -> Arc<KvBucket> {
        KvBucket::open(
            dir.to_path_buf(),
            KvConfig {
                bucket: "STATE_T".to_string(),
                ..KvConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn put_get_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kv = bucket(dir.path());
        let r1 = kv.put("audit.job.1", b"first").unwrap();
        let r2 = kv.put("audit.job.1", b"second").unwrap();
        assert!(r2 > r1);
        assert_eq!(kv.get("audit.job.1"), Some(b"second".to_vec()));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = bucket(dir.path());
            kv.put("audit.job.1", b"payload-a").unwrap();
            kv.put("audit.job.2", b"payload-b").unwrap();
        }
        let kv = bucket(dir.path());
        assert_eq!(kv.get("audit.job.1"), Some(b"payload-a".to_vec()));
        assert_eq!(kv.get("audit.job.2"), Some(b"payload-b".to_vec()));
        assert_eq!(kv.keys(), vec!["audit.job.1".to_string(), "audit.job.2".to_string()]);
        // Revisions continue past the replayed ones.
        assert!(kv.put("audit.job.3", b"c").unwrap() >= 3);
    }
}

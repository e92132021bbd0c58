// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! wasmgate-broker
//!
//! The embedded durable broker backing tenant isolation: file-backed
//! work-queue streams (each message is delivered to exactly one consumer
//! until acknowledged), history-1 key-value buckets, and the process-wide
//! registry that lets reprovisioning reuse a running instance.
//!
//! Durability is a crc-checked append-only journal per stream and bucket;
//! replication across hosts is out of scope.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod journal;
pub mod kv;
pub mod registry;
pub mod stream;
pub mod subject;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use crate::kv::{KvBucket, KvConfig};
pub use crate::registry::BrokerRegistry;
pub use crate::stream::{Delivery, Retention, Storage, Stream, StreamConfig};
pub use crate::subject::subject_matches;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corrupt at {0}")]
    Corrupt(PathBuf),

    #[error("subject {subject} does not match stream {stream}")]
    SubjectMismatch { subject: String, stream: String },

    #[error("no stream accepts subject {0}")]
    NoMatchingStream(String),

    #[error("broker is not ready")]
    NotReady,
}

/// One broker instance: a data directory of streams and buckets.
pub struct Broker {
    data_dir: PathBuf,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
    buckets: Mutex<HashMap<String, Arc<KvBucket>>>,
}

impl Broker {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Self>, BrokerError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join("streams"))?;
        std::fs::create_dir_all(data_dir.join("kv"))?;
        Ok(Arc::new(Self {
            data_dir,
            streams: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Creates the stream if it does not exist; an existing stream of the
    /// same name counts as success, which makes concurrent first-touch
    /// provisioning idempotent.
    pub fn ensure_stream(&self, cfg: StreamConfig) -> Result<Arc<Stream>, BrokerError> {
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(&cfg.name) {
            return Ok(existing.clone());
        }
        let dir = self.data_dir.join("streams").join(&cfg.name);
        let name = cfg.name.clone();
        let stream = Stream::open(dir, cfg)?;
        streams.insert(name, stream.clone());
        Ok(stream)
    }

    pub fn stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.lock().get(name).cloned()
    }

    pub fn ensure_kv(&self, cfg: KvConfig) -> Result<Arc<KvBucket>, BrokerError> {
        let mut buckets = self.buckets.lock();
        if let Some(existing) = buckets.get(&cfg.bucket) {
            return Ok(existing.clone());
        }
        let dir = self.data_dir.join("kv").join(&cfg.bucket);
        let name = cfg.bucket.clone();
        let bucket = KvBucket::open(dir, cfg)?;
        buckets.insert(name, bucket.clone());
        Ok(bucket)
    }

    pub fn kv(&self, name: &str) -> Option<Arc<KvBucket>> {
        self.buckets.lock().get(name).cloned()
    }

    /// Routes a publish to the first open stream whose filter matches.
    pub fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        body: &[u8],
    ) -> Result<(String, u64), BrokerError> {
        let target = {
            let streams = self.streams.lock();
            streams
                .values()
                .find(|s| s.accepts(subject))
                .cloned()
        };
        let Some(stream) = target else {
            return Err(BrokerError::NoMatchingStream(subject.to_string()));
        };
        let seq = stream.publish(subject, msg_id, body)?;
        Ok((stream.name().to_string(), seq))
    }

    /// Per-stream unacknowledged depth, for status reporting.
    pub fn stream_depths(&self) -> std::collections::BTreeMap<String, usize> {
        self.streams
            .lock()
            .iter()
            .map(|(name, stream)| (name.clone(), stream.depth()))
            .collect()
    }
}

// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::journal::Journal;
use crate::subject::subject_matches;
use crate::BrokerError;

pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DELIVER: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Each message is owned by exactly one consumer and removed on ack.
    #[default]
    WorkQueue,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: Storage,
    pub retention: Retention,
    /// Recorded for cluster topology parity; single-node operation does not
    /// replicate.
    pub replicas: usize,
    pub max_deliver: u32,
    pub ack_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            storage: Storage::File,
            retention: Retention::WorkQueue,
            replicas: 1,
            max_deliver: DEFAULT_MAX_DELIVER,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum StreamOp {
    Publish {
        seq: u64,
        subject: String,
        msg_id: String,
        body: String,
    },
    Ack {
        seq: u64,
    },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    body: Vec<u8>,
    delivered: u32,
}

struct StreamState {
    next_seq: u64,
    messages: BTreeMap<u64, StoredMessage>,
    ready: VecDeque<u64>,
    delayed: BTreeMap<u64, Instant>,
    inflight: HashMap<u64, Instant>,
    parked: BTreeSet<u64>,
    by_msg_id: HashMap<String, u64>,
    journal: Option<Journal>,
}

impl StreamState {
    /// Moves due delayed messages and expired in-flight deliveries back to
    /// the ready queue; exhausted messages are parked instead.
    fn promote(&mut self, now: Instant, cfg: &StreamConfig) {
        let due: Vec<u64> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in due {
            self.delayed.remove(&seq);
            self.requeue(seq, cfg);
        }

        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            self.inflight.remove(&seq);
            self.requeue(seq, cfg);
        }
    }

    fn requeue(&mut self, seq: u64, cfg: &StreamConfig) {
        let Some(msg) = self.messages.get(&seq) else {
            return;
        };
        if msg.delivered >= cfg.max_deliver {
            self.parked.insert(seq);
        } else {
            self.ready.push_back(seq);
        }
    }

    fn earliest_wakeup(&self, now: Instant) -> Option<Duration> {
        let delayed = self.delayed.values().min();
        let inflight = self.inflight.values().min();
        let next = match (delayed, inflight) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (Some(a), None) => Some(*a),
            (None, Some(b)) => Some(*b),
            (None, None) => None,
        }?;
        Some(next.saturating_duration_since(now))
    }
}

/// A durable work-queue stream. Consumers pull with `next`; the shared
/// ready queue is what load-balances a queue group.
pub struct Stream {
    cfg: StreamConfig,
    state: Mutex<StreamState>,
    notify: Notify,
}

impl Stream {
    pub(crate) fn open(dir: PathBuf, cfg: StreamConfig) -> Result<Arc<Self>, BrokerError> {
        let mut state = StreamState {
            next_seq: 1,
            messages: BTreeMap::new(),
            ready: VecDeque::new(),
            delayed: BTreeMap::new(),
            inflight: HashMap::new(),
            parked: BTreeSet::new(),
            by_msg_id: HashMap::new(),
            journal: None,
        };

        if cfg.storage == Storage::File {
            let (journal, records) = Journal::open(dir.join("journal.log"))?;
            for raw in records {
                let Ok(op) = serde_json::from_slice::<StreamOp>(&raw) else {
                    return Err(BrokerError::Corrupt(journal.path().to_path_buf()));
                };
                match op {
                    StreamOp::Publish { seq, subject, msg_id, body } => {
                        let body = base64::engine::general_purpose::STANDARD
                            .decode(body)
                            .map_err(|_| BrokerError::Corrupt(journal.path().to_path_buf()))?;
                        state.messages.insert(
                            seq,
                            StoredMessage {
                                subject,
                                body,
                                delivered: 0,
                            },
                        );
                        if !msg_id.is_empty() {
                            state.by_msg_id.insert(msg_id, seq);
                        }
                        state.next_seq = state.next_seq.max(seq + 1);
                    }
                    StreamOp::Ack { seq } => {
                        state.messages.remove(&seq);
                    }
                }
            }
            // Everything unacknowledged is deliverable again.
            for seq in state.messages.keys() {
                state.ready.push_back(*seq);
            }
            state.journal = Some(journal);
        }

        Ok(Arc::new(Self {
            cfg,
            state: Mutex::new(state),
            notify: Notify::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn accepts(&self, subject: &str) -> bool {
        self.cfg
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    /// Unacknowledged message count (ready + delayed + in-flight + parked).
    pub fn depth(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn publish(&self, subject: &str, msg_id: &str, body: &[u8]) -> Result<u64, BrokerError> {
        if !self.accepts(subject) {
            return Err(BrokerError::SubjectMismatch {
                subject: subject.to_string(),
                stream: self.cfg.name.clone(),
            });
        }
        let mut state = self.state.lock();
        // Message-id deduplication: republishing the same id is answered
        // with the original sequence instead of a second copy.
        if !msg_id.is_empty() {
            if let Some(existing) = state.by_msg_id.get(msg_id) {
                return Ok(*existing);
            }
        }
        let seq = state.next_seq;
        if let Some(journal) = state.journal.as_mut() {
            let op = StreamOp::Publish {
                seq,
                subject: subject.to_string(),
                msg_id: msg_id.to_string(),
                body: base64::engine::general_purpose::STANDARD.encode(body),
            };
            let payload =
                serde_json::to_vec(&op).map_err(|_| BrokerError::Corrupt(PathBuf::new()))?;
            journal.append(&payload)?;
        }
        state.next_seq += 1;
        state.messages.insert(
            seq,
            StoredMessage {
                subject: subject.to_string(),
                body: body.to_vec(),
                delivered: 0,
            },
        );
        if !msg_id.is_empty() {
            state.by_msg_id.insert(msg_id.to_string(), seq);
        }
        state.ready.push_back(seq);
        drop(state);
        self.notify.notify_waiters();
        Ok(seq)
    }

    /// Pulls the next delivery, waiting for publishes, nak delays, or
    /// ack-wait expiries as needed. The delivery is settled back through
    /// `ack` / `nak_with_delay` / `in_progress` with its sequence.
    pub async fn next(&self) -> Delivery {
        loop {
            let notified = self.notify.notified();
            let (delivery, wait) = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.promote(now, &self.cfg);
                if let Some(seq) = state.ready.pop_front() {
                    if let Some(msg) = state.messages.get_mut(&seq) {
                        msg.delivered += 1;
                        let delivered = msg.delivered;
                        let subject = msg.subject.clone();
                        let body = msg.body.clone();
                        state.inflight.insert(seq, now + self.cfg.ack_wait);
                        if !state.ready.is_empty() {
                            // Chain the wakeup so sibling consumers drain
                            // the backlog without waiting for a timer.
                            self.notify.notify_waiters();
                        }
                        (
                            Some(Delivery {
                                seq,
                                subject,
                                body,
                                delivered,
                            }),
                            None,
                        )
                    } else {
                        (None, Some(Duration::from_millis(1)))
                    }
                } else {
                    (None, state.earliest_wakeup(now))
                }
            };

            if let Some(delivery) = delivery {
                return delivery;
            }
            match wait {
                Some(dur) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(dur) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Acknowledges a delivery: the message is removed for good.
    pub fn ack(&self, seq: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(journal) = state.journal.as_mut() {
            let payload = serde_json::to_vec(&StreamOp::Ack { seq })
                .map_err(|_| BrokerError::Corrupt(PathBuf::new()))?;
            journal.append(&payload)?;
        }
        state.messages.remove(&seq);
        state.inflight.remove(&seq);
        state.parked.remove(&seq);
        Ok(())
    }

    /// Negative-acknowledges a delivery; it is redelivered after `delay`.
    pub fn nak_with_delay(&self, seq: u64, delay: Duration) {
        let mut state = self.state.lock();
        state.inflight.remove(&seq);
        if state.messages.contains_key(&seq) {
            state.delayed.insert(seq, Instant::now() + delay);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Re-arms the delivery deadline while a handler is still working.
    pub fn in_progress(&self, seq: u64) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + self.cfg.ack_wait;
        if let Some(entry) = state.inflight.get_mut(&seq) {
            *entry = deadline;
        }
    }
}

/// One in-flight delivery. Leaving it unsettled hands the message to the
/// ack-wait sweep, preserving at-least-once semantics.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: u64,
    pub subject: String,
    pub body: Vec<u8>,
    /// How many times this message has been delivered, this one included.
    pub delivered: u32,
}

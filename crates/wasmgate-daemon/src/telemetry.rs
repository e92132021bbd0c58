use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct TelemetryState {
    requests_total: HashMap<(String, String), u64>,
    jobs_succeeded: HashMap<String, u64>,
    jobs_failed: HashMap<String, u64>,
    jobs_dead_lettered: HashMap<String, u64>,
    active_sandboxes: i64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub requests_total: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub active_sandboxes: i64,
}

/// In-process counters for the status route and structured log events.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, tenant: &str, status: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .requests_total
            .entry((tenant.to_string(), status.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn job_succeeded(&self, tenant: &str) {
        let mut guard = self.state.lock();
        let entry = guard.jobs_succeeded.entry(tenant.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn job_failed(&self, tenant: &str) {
        let mut guard = self.state.lock();
        let entry = guard.jobs_failed.entry(tenant.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn job_dead_lettered(&self, tenant: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .jobs_dead_lettered
            .entry(tenant.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn sandbox_started(&self) {
        self.state.lock().active_sandboxes += 1;
    }

    pub fn sandbox_finished(&self) {
        let mut guard = self.state.lock();
        guard.active_sandboxes = (guard.active_sandboxes - 1).max(0);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let guard = self.state.lock();
        TelemetrySnapshot {
            requests_total: guard.requests_total.values().sum(),
            jobs_succeeded: guard.jobs_succeeded.values().sum(),
            jobs_failed: guard.jobs_failed.values().sum(),
            jobs_dead_lettered: guard.jobs_dead_lettered.values().sum(),
            active_sandboxes: guard.active_sandboxes,
        }
    }
}

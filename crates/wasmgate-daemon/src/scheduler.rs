use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use wasmgate_core::bridge::JobSink;

use crate::config::{parse_duration, ConfigError, CronEntry};

/// Parses the embedded schedule subset: `@every 30s`, `every 30s`, or a
/// bare duration. Full cron expressions belong to an external scheduler.
pub fn parse_schedule(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let spec = trimmed
        .strip_prefix("@every ")
        .or_else(|| trimmed.strip_prefix("every "))
        .unwrap_or(trimmed);
    let interval = parse_duration(spec)?;
    if interval.is_zero() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }
    Ok(interval)
}

/// Spawns one interval task per cron entry; each tick enqueues a
/// background execution through the job sink.
pub fn start(entries: &[CronEntry], sink: Arc<dyn JobSink>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for entry in entries {
        let interval = match parse_schedule(&entry.schedule) {
            Ok(interval) => interval,
            Err(err) => {
                tracing::error!(schedule = %entry.schedule, error = %err, "skipping invalid cron entry");
                continue;
            }
        };
        let path = entry.path.to_string_lossy().into_owned();
        let sink = sink.clone();
        tracing::info!(schedule = %entry.schedule, module = %path, "cron entry scheduled");
        handles.push(tokio::spawn(async move {
            let payload = r#"{"event_type":"cron","source":"wasmgate_scheduler"}"#;
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = sink.enqueue(&path, payload) {
                    tracing::warn!(module = %path, error = %err, "cron enqueue failed");
                }
            }
        }));
    }
    handles
}

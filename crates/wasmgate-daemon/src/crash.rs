use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wasmgate_core::{Invocation, InvocationOutput, SandboxEngine, SandboxFailure};

/// Everything needed to replay a dead-lettered job offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashSnapshot {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub input: serde_json::Value,
    pub env: BTreeMap<String, String>,
    pub wasm_file: PathBuf,
}

impl CrashSnapshot {
    pub fn new(
        error: String,
        input_bytes: &[u8],
        env: BTreeMap<String, String>,
        wasm_file: PathBuf,
    ) -> Self {
        // The job envelope is JSON; anything else is preserved verbatim as
        // a string so the dump never loses the input.
        let input = serde_json::from_slice(input_bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(input_bytes).into_owned())
        });
        Self {
            timestamp: Utc::now(),
            error,
            input,
            env,
            wasm_file,
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// The exact bytes the job carried on stdin.
    pub fn input_bytes(&self) -> Vec<u8> {
        match &self.input {
            serde_json::Value::String(raw) => raw.clone().into_bytes(),
            other => serde_json::to_vec(other).unwrap_or_default(),
        }
    }
}

/// Re-runs a dead-lettered job offline, with the environment it crashed
/// under, through a fresh sandbox.
pub fn replay(
    snapshot: &CrashSnapshot,
    engine: &SandboxEngine,
    deadline: Duration,
) -> Result<InvocationOutput, SandboxFailure> {
    let mut invocation = Invocation::background(snapshot.input_bytes(), deadline);
    invocation.env = snapshot.env.clone();
    engine.run(invocation)
}

pub struct CrashRecorder {
    dir: PathBuf,
    enabled: bool,
}

impl CrashRecorder {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `crash_tenant_<T>_<ts>_seq<n>.json`; returns the path, or
    /// `None` when recording is disabled or the write failed (the job is
    /// acknowledged either way).
    pub fn record(&self, tenant: &str, seq: u64, snapshot: &CrashSnapshot) -> Option<PathBuf> {
        if !self.enabled {
            tracing::warn!(tenant, seq, "crash recording disabled; dropping snapshot");
            return None;
        }
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            tracing::error!(error = %err, "failed to create crash directory");
            return None;
        }
        let filename = format!(
            "crash_tenant_{tenant}_{}_seq{seq}.json",
            snapshot.timestamp.format("%Y%m%d-%H%M%S")
        );
        let path = self.dir.join(filename);
        let body = match serde_json::to_vec_pretty(snapshot) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode crash snapshot");
                return None;
            }
        };
        match std::fs::write(&path, body) {
            Ok(()) => {
                tracing::info!(file = %path.display(), "crash dump saved");
                Some(path)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to write crash dump");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_written_with_input_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CrashRecorder::new(dir.path(), true);
        let snapshot = CrashSnapshot::new(
            "wasm trap: unreachable".to_string(),
            br#"{"method":"POST","uri":"/x","headers":{},"body":"hi"}"#,
            BTreeMap::new(),
            PathBuf::from("fn.wasm"),
        );
        let path = recorder.record("abc", 3, &snapshot).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("crash_tenant_abc_"));
        assert!(name.ends_with("_seq3.json"));

        let written: CrashSnapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written.error, "wasm trap: unreachable");
        assert_eq!(written.input["body"], "hi");
        assert_eq!(written.wasm_file, PathBuf::from("fn.wasm"));
    }

    #[test]
    fn non_json_input_is_kept_as_a_string() {
        let snapshot = CrashSnapshot::new(
            "boom".to_string(),
            b"not json at all",
            BTreeMap::new(),
            PathBuf::from("fn.wasm"),
        );
        assert_eq!(snapshot.input, serde_json::Value::String("not json at all".to_string()));
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CrashRecorder::new(dir.path(), true);
        let snapshot = CrashSnapshot::new(
            "deadline exceeded".to_string(),
            br#"{"method":"POST","uri":"/x","headers":{},"body":"slow"}"#,
            BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            PathBuf::from("fn.wasm"),
        );
        let path = recorder.record("abc", 9, &snapshot).unwrap();

        let loaded = CrashSnapshot::load(&path).unwrap();
        assert_eq!(loaded.error, "deadline exceeded");
        assert_eq!(loaded.env["MODE"], "prod");
        assert_eq!(loaded.input_bytes(), snapshot.input_bytes());
    }

    #[test]
    fn replay_reruns_the_original_input() {
        let wat = r#"(module
          (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
          (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (func (export "_start")
            (i32.store (i32.const 0) (i32.const 64))
            (i32.store (i32.const 4) (i32.const 1024))
            (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
            (i32.store (i32.const 4) (i32.load (i32.const 8)))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))"#;
        let wasm = wat::parse_str(wat).unwrap();
        let engine = SandboxEngine::new(
            &wasm,
            wasmgate_core::EngineSettings::default(),
            wasmgate_core::HostServices::detached(),
        )
        .unwrap();

        let body = br#"{"method":"POST","uri":"/x","headers":{},"body":"again"}"#;
        let snapshot =
            CrashSnapshot::new("boom".to_string(), body, BTreeMap::new(), PathBuf::new());

        let output = replay(&snapshot, &engine, Duration::from_secs(5)).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&output.stdout).unwrap(),
            serde_json::from_slice::<serde_json::Value>(body).unwrap()
        );
    }

    #[test]
    fn disabled_recorder_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CrashRecorder::new(dir.path().join("crashes"), false);
        let snapshot = CrashSnapshot::new("x".to_string(), b"{}", BTreeMap::new(), PathBuf::new());
        assert!(recorder.record("abc", 1, &snapshot).is_none());
        assert!(!dir.path().join("crashes").exists());
    }
}

use thiserror::Error;

use crate::sandbox::InvocationOutput;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("invalid wasm module: {0}")]
    InvalidModule(String),

    #[error("sandbox deadline exceeded")]
    DeadlineExceeded,

    #[error("sandbox output quota exceeded")]
    OutputQuota,

    #[error("sandbox fuel exhausted")]
    FuelExhausted,

    #[error("guest exited with status {0}")]
    GuestExit(i32),

    #[error("wasm trap: {0}")]
    Trap(String),

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

impl SandboxError {
    /// Memory, output-quota, and deadline failures share one retry policy
    /// downstream; the worker does not distinguish them.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::OutputQuota | Self::FuelExhausted
        )
    }
}

/// A failed invocation, carrying whatever the guest managed to emit before
/// it died. The captured stderr feeds worker logs and crash snapshots.
#[derive(Debug)]
pub struct SandboxFailure {
    pub error: SandboxError,
    pub output: InvocationOutput,
}

impl std::fmt::Display for SandboxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stderr = String::from_utf8_lossy(&self.output.stderr);
        if stderr.trim().is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{} | stderr: {}", self.error, stderr.trim())
        }
    }
}

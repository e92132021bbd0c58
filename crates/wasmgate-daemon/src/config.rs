use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use wasmgate_sovereign::SecurityPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("module artifact path is required")]
    MissingArtifact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountEntry {
    pub host: PathBuf,
    pub guest: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitSettings {
    pub rate: f64,
    #[serde(default)]
    pub burst: u32,
}

impl RateLimitSettings {
    /// An unset burst follows the rate, with a floor of one.
    pub fn effective_burst(&self) -> u32 {
        if self.burst > 0 {
            self.burst
        } else {
            (self.rate.ceil() as u32).max(1)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronEntry {
    pub schedule: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub token: String,
}

/// Worker timing knobs that tests shrink; not part of the config file.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTuning {
    pub backoff_unit: Duration,
    pub ack_wait: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(1),
            ack_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Primary module artifact.
    pub path: PathBuf,
    /// Exported as environment inside every sandbox.
    pub env: BTreeMap<String, String>,
    /// Argv handed to every sandbox instantiation.
    pub args: Vec<String>,
    /// Filesystem passthrough into every sandbox.
    pub mounts: Vec<MountEntry>,
    /// Per-invocation deadline, e.g. "60s".
    pub timeout: String,
    /// Per-sandbox memory cap, e.g. "64MB". Empty = uncapped.
    pub memory_limit: String,
    pub fuel_limit: Option<u64>,
    /// Subscribers per tenant; `/_sys/patch` updates live.
    pub pool_size: usize,
    pub rate_limit: Option<RateLimitSettings>,
    /// Enables API-key auth and per-key tenancy.
    pub api_keys: Vec<String>,
    /// Egress allow-list for the AI collaborator.
    pub allow_hosts: Vec<String>,
    /// `*` permitted.
    pub cors_origins: Vec<String>,
    pub security_policy: SecurityPolicy,
    /// Hex ed25519 public keys.
    pub trusted_keys: Vec<String>,
    pub cron: Vec<CronEntry>,
    pub record_crashes: bool,
    pub crash_path: PathBuf,
    pub data_dir: PathBuf,
    pub cluster_name: String,
    pub cluster_port: u16,
    pub cluster_peers: Vec<String>,
    pub replicas: usize,
    /// Signs audit records; a loud fallback is used when empty.
    pub master_secret: String,
    pub ai: AiSettings,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            env: BTreeMap::new(),
            args: Vec::new(),
            mounts: Vec::new(),
            timeout: "60s".to_string(),
            memory_limit: String::new(),
            fuel_limit: None,
            pool_size: 2,
            rate_limit: None,
            api_keys: Vec::new(),
            allow_hosts: Vec::new(),
            cors_origins: Vec::new(),
            security_policy: SecurityPolicy::Audit,
            trusted_keys: Vec::new(),
            cron: Vec::new(),
            record_crashes: true,
            crash_path: PathBuf::from("./crashes"),
            data_dir: PathBuf::from("./data"),
            cluster_name: String::new(),
            cluster_port: 4248,
            cluster_peers: Vec::new(),
            replicas: 1,
            master_secret: String::new(),
            ai: AiSettings::default(),
        }
    }
}

impl GateConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingArtifact);
        }
        self.timeout()?;
        self.memory_limit_bytes()?;
        Ok(())
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.timeout)
    }

    pub fn memory_limit_bytes(&self) -> Result<Option<u64>, ConfigError> {
        if self.memory_limit.is_empty() {
            return Ok(None);
        }
        parse_size(&self.memory_limit).map(Some)
    }

    pub fn node_id(&self) -> String {
        if self.cluster_name.is_empty() {
            format!("wasmgate-node-{}", self.cluster_port)
        } else {
            self.cluster_name.clone()
        }
    }
}

/// Parses human-readable byte sizes: `512`, `64KB`, `10MiB`, `1gb`.
/// Decimal and binary suffixes both mean powers of two, the way operators
/// expect memory caps to behave.
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(raw.to_string()))?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err(ConfigError::InvalidSize(raw.to_string())),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(raw.to_string()))
}

/// Parses durations: `250ms`, `30s`, `5m`, `2h`, or bare seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
    match suffix.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::InvalidDuration(raw.to_string())),
    }
}

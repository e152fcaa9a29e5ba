//! TOML configuration for the agent and the receiver
//!
//! Every field has a default so an empty file (or no file) is a working setup
//! for a camera writing `.avi` files into the current directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumType;
use crate::detect::DEFAULT_TIMESTAMP_FORMAT;
use crate::error::ConfigError;
use crate::protocol::DEFAULT_PORT;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectStrategy {
    /// mtime unchanged for the idle threshold
    Idle,
    /// everything except the newest timestamped file
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TranscodeFailurePolicy {
    /// Log and produce no artifact
    Drop,
    /// Log and deliver the untranscoded file
    DeliverRaw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub dir: PathBuf,
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            extensions: vec!["avi".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectConfig {
    pub strategy: DetectStrategy,
    pub idle_threshold_secs: u64,
    pub check_interval_secs: u64,
    pub timestamp_format: String,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            strategy: DetectStrategy::Idle,
            idle_threshold_secs: 10,
            check_interval_secs: 5,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl DetectConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeConfig {
    pub enabled: bool,
    pub program: String,
    /// `{input}` and `{output}` are substituted
    pub args: Vec<String>,
    pub output_extension: String,
    pub on_failure: TranscodeFailurePolicy,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "ffmpeg".to_string(),
            args: ["-y", "-i", "{input}", "-vcodec", "libx264", "-crf", "28", "{output}"]
                .into_iter()
                .map(String::from)
                .collect(),
            output_extension: "mp4".to_string(),
            on_failure: TranscodeFailurePolicy::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    pub transport: Transport,
    /// HTTP lane endpoint
    pub url: String,
    /// Socket lane collector `host:port`
    pub address: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Concurrent HTTP uploads
    pub parallel: usize,
    pub checksum: ChecksumType,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Http,
            url: "http://localhost:5000/upload".to_string(),
            address: format!("localhost:{DEFAULT_PORT}"),
            max_retries: 3,
            retry_delay_secs: 5,
            parallel: 1,
            checksum: ChecksumType::Md5,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Camera / origin identifier sent with every artifact
    pub origin: String,
    pub watch: WatchConfig,
    /// Defaults to `<watch.dir>/pending`
    pub staging_dir: Option<PathBuf>,
    pub detect: DetectConfig,
    pub transcode: TranscodeConfig,
    pub delivery: DeliveryConfig,
    pub journal: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            watch: WatchConfig::default(),
            staging_dir: None,
            detect: DetectConfig::default(),
            transcode: TranscodeConfig::default(),
            delivery: DeliveryConfig::default(),
            journal: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => load_toml(p),
            None => Ok(Self::default()),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.watch.dir.join("pending"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = &self.origin;
        if origin.is_empty() || origin.starts_with('-') || origin.contains(':') || origin.contains('/') {
            return Err(ConfigError::Invalid {
                field: "origin",
                reason: format!("{origin:?} must be non-empty without ':' or '/' and not start with '-'"),
            });
        }
        if self.detect.check_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "detect.check_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.delivery.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "delivery.max_retries",
                reason: "must be at least 1".into(),
            });
        }
        if self.delivery.parallel == 0 {
            return Err(ConfigError::Invalid {
                field: "delivery.parallel",
                reason: "must be at least 1".into(),
            });
        }
        if self.staging_dir() == self.watch.dir {
            return Err(ConfigError::Invalid {
                field: "staging_dir",
                reason: "must differ from watch.dir".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Socket lane listener; `None` disables it
    pub socket_bind: Option<String>,
    /// HTTP lane listener; `None` disables it
    pub http_bind: Option<String>,
    pub dest_dir: PathBuf,
    pub fetch_program: String,
    /// Placed before the `origin:path` and destination arguments
    pub fetch_args: Vec<String>,
    pub checksum: ChecksumType,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            socket_bind: Some(format!("0.0.0.0:{DEFAULT_PORT}")),
            http_bind: None,
            dest_dir: PathBuf::from("."),
            fetch_program: "scp".to_string(),
            fetch_args: vec!["-B".to_string(), "-q".to_string()],
            checksum: ChecksumType::Md5,
        }
    }
}

impl ReceiverConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => load_toml(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_bind.is_none() && self.http_bind.is_none() {
            return Err(ConfigError::Invalid {
                field: "socket_bind",
                reason: "at least one of socket_bind and http_bind must be set".into(),
            });
        }
        Ok(())
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `user@hostname`, the form `scp` on the collector expects
pub fn default_origin() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    match std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
        Ok(user) if !user.is_empty() => format!("{user}@{host}"),
        _ => host,
    }
}

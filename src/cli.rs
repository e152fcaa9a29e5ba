//! Clap options for both binaries; anything given here overrides the TOML file

use std::path::PathBuf;

use clap::Parser;

use crate::checksum::ChecksumType;
use crate::config::{AgentConfig, DetectStrategy, ReceiverConfig, TranscodeFailurePolicy, Transport};
use crate::error::ConfigError;

/// Producer-side agent: watch, detect, prepare, deliver
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about = "Ships finished camera recordings to a collector")]
pub struct AgentOpts {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Origin identifier sent with every artifact (default: user@hostname)
    #[arg(long)]
    pub origin: Option<String>,

    /// Directory the camera writes recordings into
    #[arg(short, long)]
    pub watch_dir: Option<PathBuf>,

    /// Where claimed recordings are staged (default: <watch-dir>/pending)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Completion detection strategy
    #[arg(long, value_enum)]
    pub strategy: Option<DetectStrategy>,

    /// Seconds without modification before a file counts as finished
    #[arg(long)]
    pub idle_threshold: Option<u64>,

    /// Seconds between detection polls
    #[arg(long)]
    pub check_interval: Option<u64>,

    #[arg(long, value_enum)]
    pub transport: Option<Transport>,

    /// HTTP upload endpoint
    #[arg(long)]
    pub url: Option<String>,

    /// Socket collector host:port
    #[arg(long)]
    pub address: Option<String>,

    /// Attempts per artifact before it is abandoned
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds between attempts
    #[arg(long)]
    pub retry_delay: Option<u64>,

    /// Concurrent HTTP uploads
    #[arg(long)]
    pub parallel: Option<usize>,

    #[arg(long, value_enum)]
    pub checksum: Option<ChecksumType>,

    /// Deliver recordings as-is
    #[arg(long)]
    pub no_transcode: bool,

    #[arg(long, value_enum)]
    pub on_transcode_failure: Option<TranscodeFailurePolicy>,

    /// Append delivery attempts to this JSONL file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Print abandoned artifacts from the journal and exit
    #[arg(long)]
    pub list_abandoned: bool,
}

impl AgentOpts {
    /// Load the config file (if any) and apply overrides
    pub fn to_config(&self) -> Result<AgentConfig, ConfigError> {
        let mut cfg = AgentConfig::load(self.config.as_deref())?;
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply(&self, cfg: &mut AgentConfig) {
        if let Some(v) = &self.origin {
            cfg.origin = v.clone();
        }
        if let Some(v) = &self.watch_dir {
            cfg.watch.dir = v.clone();
        }
        if let Some(v) = &self.staging_dir {
            cfg.staging_dir = Some(v.clone());
        }
        if let Some(v) = self.strategy {
            cfg.detect.strategy = v;
        }
        if let Some(v) = self.idle_threshold {
            cfg.detect.idle_threshold_secs = v;
        }
        if let Some(v) = self.check_interval {
            cfg.detect.check_interval_secs = v;
        }
        if let Some(v) = self.transport {
            cfg.delivery.transport = v;
        }
        if let Some(v) = &self.url {
            cfg.delivery.url = v.clone();
        }
        if let Some(v) = &self.address {
            cfg.delivery.address = v.clone();
        }
        if let Some(v) = self.max_retries {
            cfg.delivery.max_retries = v;
        }
        if let Some(v) = self.retry_delay {
            cfg.delivery.retry_delay_secs = v;
        }
        if let Some(v) = self.parallel {
            cfg.delivery.parallel = v;
        }
        if let Some(v) = self.checksum {
            cfg.delivery.checksum = v;
        }
        if self.no_transcode {
            cfg.transcode.enabled = false;
        }
        if let Some(v) = self.on_transcode_failure {
            cfg.transcode.on_failure = v;
        }
        if let Some(v) = &self.journal {
            cfg.journal = Some(v.clone());
        }
    }
}

/// Collector-side receiver
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about = "Receives camera recordings over the socket and HTTP lanes")]
pub struct ReceiverOpts {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket lane bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Disable the socket lane
    #[arg(long)]
    pub no_socket: bool,

    /// HTTP lane bind address (host:port)
    #[arg(long)]
    pub http_bind: Option<String>,

    /// Directory received recordings are stored in
    #[arg(short, long)]
    pub dest_dir: Option<PathBuf>,

    /// Program used to pull files from agents
    #[arg(long)]
    pub fetch_program: Option<String>,

    #[arg(long, value_enum)]
    pub checksum: Option<ChecksumType>,
}

impl ReceiverOpts {
    pub fn to_config(&self) -> Result<ReceiverConfig, ConfigError> {
        let mut cfg = ReceiverConfig::load(self.config.as_deref())?;
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply(&self, cfg: &mut ReceiverConfig) {
        if let Some(v) = &self.bind {
            cfg.socket_bind = Some(v.clone());
        }
        if self.no_socket {
            cfg.socket_bind = None;
        }
        if let Some(v) = &self.http_bind {
            cfg.http_bind = Some(v.clone());
        }
        if let Some(v) = &self.dest_dir {
            cfg.dest_dir = v.clone();
        }
        if let Some(v) = &self.fetch_program {
            cfg.fetch_program = v.clone();
        }
        if let Some(v) = self.checksum {
            cfg.checksum = v;
        }
    }
}

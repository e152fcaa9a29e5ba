//! Error types for each camrelay subsystem

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while deciding which files are complete
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to list {dir}: {source}")]
    ListDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse a timestamp from {name:?} with format {format:?}")]
    UnparsableTimestamp { name: String, format: String },
}

/// Failures while turning a claimed file into a deliverable artifact
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transcoder could not be started for {path}: {source}")]
    TranscodeSpawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transcoder exited with {status} for {path}")]
    TranscodeFailed { path: PathBuf, status: String },

    #[error("failed to checksum {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Socket framing violations
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),

    #[error("header is not a space-padded decimal length: {0:?}")]
    BadHeader(String),

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("unexpected status reply {0:?}")]
    BadStatus([u8; 4]),

    #[error("malformed transfer request {0:?}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why one delivery attempt did not succeed
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("collector rejected upload with status {0}")]
    Status(u16),

    #[error("collector replied FAIL")]
    Refused,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The collector could not pull a file from the agent host
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch program {program:?} could not be started: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("fetch of {remote} exited with {status}")]
    Failed { remote: String, status: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

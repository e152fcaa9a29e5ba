//! camrelay
//!
//! Detects when a recording that is written in place has finished, stages and
//! optionally transcodes it, and delivers it to a collector exactly once over
//! HTTP multipart or a length-prefixed socket protocol.

pub mod agent;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod deliver;
pub mod detect;
pub mod error;
pub mod journal;
pub mod protocol;
pub mod protocol_core;
pub mod receiver;
pub mod retry;
pub mod stage;
pub mod tracker;
pub mod watch;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();
}

//! Socket batch client: the collector pulls each file after we name it
//!
//! One connection per batch. Each artifact is announced as `origin:path` and
//! answered with a 4-byte status before the next one is sent.

use std::path::PathBuf;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::remove_delivered;
use crate::error::{DeliveryError, FrameError};
use crate::protocol::DISCONNECT;
use crate::protocol_core::{read_status, write_message, TransferRequest};
use crate::stage::ReadyArtifact;

/// Per-artifact result of one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Acknowledged and deleted locally
    pub delivered: Vec<PathBuf>,
    /// Attempted and not acknowledged; kept on disk
    pub failed: Vec<(PathBuf, String)>,
    /// Never announced because the batch was aborted
    pub unsent: Vec<PathBuf>,
}

/// Announces each artifact under its own `origin`
pub struct SocketClient {
    address: String,
}

impl SocketClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Send `artifacts` in name order over a single connection
    pub async fn send_batch(&self, artifacts: &[ReadyArtifact]) -> BatchReport {
        let mut report = BatchReport::default();
        if artifacts.is_empty() {
            return report;
        }
        let mut ordered: Vec<&ReadyArtifact> = artifacts.iter().collect();
        ordered.sort_by_key(|a| a.file_name());

        let mut stream = match TcpStream::connect(&self.address).await {
            Ok(s) => s,
            Err(e) => {
                warn!(address = %self.address, error = %e, "cannot reach collector");
                let reason = e.to_string();
                report.failed = ordered
                    .iter()
                    .map(|a| (a.path.clone(), reason.clone()))
                    .collect();
                return report;
            }
        };
        debug!(address = %self.address, count = ordered.len(), "batch connection open");

        for (i, artifact) in ordered.iter().enumerate() {
            match self.announce(&mut stream, artifact).await {
                Ok(true) => {
                    remove_delivered(&artifact.path).await;
                    info!(path = %artifact.path.display(), "collector acknowledged");
                    report.delivered.push(artifact.path.clone());
                }
                Ok(false) => {
                    warn!(path = %artifact.path.display(), "collector replied FAIL");
                    report
                        .failed
                        .push((artifact.path.clone(), DeliveryError::Refused.to_string()));
                }
                Err(e) => {
                    warn!(path = %artifact.path.display(), error = %e, "batch aborted");
                    report.failed.push((artifact.path.clone(), e.to_string()));
                    report.unsent = ordered[i + 1..].iter().map(|a| a.path.clone()).collect();
                    return report;
                }
            }
        }

        if let Err(e) = write_message(&mut stream, DISCONNECT).await {
            debug!(error = %e, "disconnect not delivered");
        }
        report
    }

    async fn announce(
        &self,
        stream: &mut TcpStream,
        artifact: &ReadyArtifact,
    ) -> Result<bool, FrameError> {
        let payload = TransferRequest::payload(&artifact.origin, &artifact.path);
        write_message(stream, &payload).await?;
        read_status(stream).await
    }
}

//! Moving ready artifacts to the collector
//!
//! Two transports: [`http::HttpClient`] pushes one artifact per multipart
//! request, [`socket::SocketClient`] asks the collector to pull a batch.
//! Either way the local file is deleted only after a positive acknowledgment.

pub mod http;
pub mod socket;

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::DeliveryError;
use crate::journal::{attempt_now, Journal};
use crate::retry::{AttemptOutcome, Backoff, RetryDecision, RetryPolicy};
use crate::stage::ReadyArtifact;

/// One delivery attempt of one artifact
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, artifact: &ReadyArtifact) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    Delivered { attempts: u32 },
    /// Left on disk after the last allowed attempt failed
    Abandoned { attempts: u32 },
}

/// Deliver `artifact` with bounded retries, deleting it on success.
///
/// `permits` bounds concurrent attempts across campaigns; a permit is held only
/// for the attempt itself, never across the backoff sleep.
pub async fn deliver_with_retry(
    client: &dyn DeliveryClient,
    artifact: &ReadyArtifact,
    policy: RetryPolicy,
    journal: &Journal,
    permits: &Semaphore,
) -> CampaignOutcome {
    let campaign = Journal::new_campaign();
    let mut backoff = Backoff::new(policy);

    loop {
        let result = {
            let _permit = permits.acquire().await.ok();
            let attempt = backoff.begin_attempt();
            info!(path = %artifact.path.display(), attempt, "uploading");
            client.send(artifact).await
        };
        let attempt = backoff.attempts();

        match result {
            Ok(()) => {
                remove_delivered(&artifact.path).await;
                journal_attempt(journal, &campaign, artifact, attempt, AttemptOutcome::Success, None);
                info!(path = %artifact.path.display(), attempt, "delivered");
                return CampaignOutcome::Delivered { attempts: attempt };
            }
            Err(e) => match backoff.record_failure(Instant::now()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        path = %artifact.path.display(),
                        attempt,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "upload failed"
                    );
                    journal_attempt(
                        journal,
                        &campaign,
                        artifact,
                        attempt,
                        AttemptOutcome::TransientFailure,
                        Some(e.to_string()),
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Abandon => {
                    error!(
                        path = %artifact.path.display(),
                        attempts = attempt,
                        error = %e,
                        "giving up, artifact kept on disk"
                    );
                    journal_attempt(
                        journal,
                        &campaign,
                        artifact,
                        attempt,
                        AttemptOutcome::PermanentFailure,
                        Some(e.to_string()),
                    );
                    return CampaignOutcome::Abandoned { attempts: attempt };
                }
            },
        }
    }
}

/// Delete a file the collector acknowledged
pub(crate) async fn remove_delivered(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "delivered but could not delete local copy");
    }
}

pub(crate) fn journal_attempt(
    journal: &Journal,
    campaign: &str,
    artifact: &ReadyArtifact,
    attempt: u32,
    outcome: AttemptOutcome,
    error: Option<String>,
) {
    let row = attempt_now(&artifact.path, attempt, outcome);
    if let Err(e) = journal.record(campaign, &row, Some(&artifact.checksum), error) {
        warn!(error = %e, "failed to write delivery journal");
    }
}

//! The producer-side controller
//!
//! Owns the tracker, the detector, the preparer and the delivery lane. A single
//! interval drives detection and only claims files. Claimed paths go to a
//! prepare worker, and prepared artifacts go to the delivery lane, each over an
//! mpsc channel, so neither a long transcode nor a slow upload holds up the
//! next poll.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, DetectStrategy, Transport};
use crate::deliver::http::HttpClient;
use crate::deliver::socket::SocketClient;
use crate::deliver::{deliver_with_retry, journal_attempt, DeliveryClient};
use crate::detect::{CompletionDetector, IdleDetector, NewestExclusionDetector};
use crate::error::ConfigError;
use crate::journal::Journal;
use crate::retry::{AttemptOutcome, Backoff, RetryDecision, RetryPolicy};
use crate::stage::{ArtifactPreparer, ReadyArtifact};
use crate::tracker::ActivityTracker;
use crate::watch::FsWatcher;

/// Paths claimed by detection and not yet through preparation
pub type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

pub struct Agent {
    config: AgentConfig,
    tracker: Arc<ActivityTracker>,
    detector: Box<dyn CompletionDetector>,
    preparer: Arc<ArtifactPreparer>,
    journal: Arc<Journal>,
    in_flight: InFlight,
}

impl Agent {
    pub fn new(mut config: AgentConfig) -> Result<Self> {
        config.validate()?;

        // The socket lane announces absolute paths for the collector to pull
        config.watch.dir = std::fs::canonicalize(&config.watch.dir)
            .with_context(|| format!("watch dir {} is not usable", config.watch.dir.display()))?;
        let staging = config.staging_dir();
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create staging dir {}", staging.display()))?;
        let staging = std::fs::canonicalize(&staging)?;
        if staging == config.watch.dir {
            return Err(ConfigError::Invalid {
                field: "staging_dir",
                reason: format!("{} is the watch dir", staging.display()),
            }
            .into());
        }
        config.staging_dir = Some(staging);

        let tracker = Arc::new(ActivityTracker::new());
        let detector = build_detector(&config, tracker.clone());
        let preparer = Arc::new(ArtifactPreparer::from_config(&config));
        let journal = Arc::new(match &config.journal {
            Some(p) => Journal::new(p),
            None => Journal::disabled(),
        });

        Ok(Self {
            config,
            tracker,
            detector,
            preparer,
            journal,
            in_flight: InFlight::default(),
        })
    }

    /// Swap the preparer (e.g. to use a different transcoder)
    pub fn with_preparer(mut self, preparer: ArtifactPreparer) -> Self {
        self.preparer = Arc::new(preparer);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tracker(&self) -> Arc<ActivityTracker> {
        self.tracker.clone()
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }

    /// Poll the detector and claim what it reports, skipping paths still being prepared
    pub fn detect(&mut self, now: SystemTime) -> Vec<PathBuf> {
        let ready = match self.detector.poll(now) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(detector = self.detector.name(), error = %e, "detection cycle skipped");
                return Vec::new();
            }
        };
        let mut in_flight = self.in_flight.lock();
        let claimed: Vec<PathBuf> = ready
            .into_iter()
            .filter(|path| in_flight.insert(path.clone()))
            .collect();
        claimed
    }

    /// One detection cycle with preparation done inline
    pub async fn detect_and_prepare(&mut self, now: SystemTime) -> Vec<ReadyArtifact> {
        let claimed = self.detect(now);
        let mut out = Vec::with_capacity(claimed.len());
        for path in claimed {
            let prepared = self.preparer.prepare(&path).await;
            self.in_flight.lock().remove(&path);
            match prepared {
                Ok(artifact) => out.push(artifact),
                Err(e) => error!(path = %path.display(), error = %e, "preparation failed"),
            }
        }
        out
    }

    /// Start the prepare worker; claimed paths sent on the returned channel come
    /// out of `ready` as artifacts
    pub fn spawn_preparer(
        &self,
        ready: UnboundedSender<ReadyArtifact>,
    ) -> (UnboundedSender<PathBuf>, JoinHandle<()>) {
        let (tx, rx) = unbounded_channel();
        let worker = tokio::spawn(prepare_worker(
            self.preparer.clone(),
            self.in_flight.clone(),
            rx,
            ready,
        ));
        (tx, worker)
    }

    /// Run until the process exits
    pub async fn run(mut self) -> Result<()> {
        let _watcher = match self.config.detect.strategy {
            DetectStrategy::Idle => Some(FsWatcher::start(
                &self.config.watch.dir,
                self.config.watch.extensions.clone(),
                self.tracker.clone(),
            )?),
            DetectStrategy::Newest => None,
        };

        let (ready_tx, ready_rx) = unbounded_channel();
        let lane = self.spawn_lane(ready_rx);

        let recovered = self
            .preparer
            .recover()
            .await
            .context("failed to scan staging dir")?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "re-queueing staged artifacts");
        }
        for artifact in recovered {
            send_artifact(&ready_tx, artifact)?;
        }
        let (claimed_tx, worker) = self.spawn_preparer(ready_tx);

        info!(
            dir = %self.config.watch.dir.display(),
            detector = self.detector.name(),
            transport = ?self.config.delivery.transport,
            "agent running"
        );

        let mut ticker = tokio::time::interval(self.config.detect.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if lane.is_finished() {
                anyhow::bail!("delivery lane stopped");
            }
            if worker.is_finished() {
                anyhow::bail!("prepare worker stopped");
            }
            for path in self.detect(SystemTime::now()) {
                claimed_tx
                    .send(path)
                    .map_err(|_| anyhow::anyhow!("prepare worker is gone"))?;
            }
        }
    }

    fn spawn_lane(&self, rx: UnboundedReceiver<ReadyArtifact>) -> JoinHandle<()> {
        let delivery = &self.config.delivery;
        let policy = delivery.retry_policy();
        let journal = self.journal.clone();
        match delivery.transport {
            Transport::Http => {
                let client: Arc<dyn DeliveryClient> = Arc::new(HttpClient::new(delivery.url.clone()));
                let permits = Arc::new(Semaphore::new(delivery.parallel));
                tokio::spawn(http_lane(rx, client, policy, journal, permits))
            }
            Transport::Socket => {
                let client = SocketClient::new(delivery.address.clone());
                let interval = self.config.detect.check_interval();
                tokio::spawn(socket_lane(rx, client, policy, journal, interval))
            }
        }
    }
}

fn build_detector(config: &AgentConfig, tracker: Arc<ActivityTracker>) -> Box<dyn CompletionDetector> {
    match config.detect.strategy {
        DetectStrategy::Idle => Box::new(IdleDetector::new(tracker, config.detect.idle_threshold())),
        DetectStrategy::Newest => Box::new(NewestExclusionDetector::new(
            config.watch.dir.clone(),
            config.watch.extensions.clone(),
            config.detect.timestamp_format.clone(),
        )),
    }
}

fn send_artifact(tx: &UnboundedSender<ReadyArtifact>, artifact: ReadyArtifact) -> Result<()> {
    tx.send(artifact)
        .map_err(|_| anyhow::anyhow!("delivery lane is gone"))
}

/// Prepares claimed files one at a time, in claim order
async fn prepare_worker(
    preparer: Arc<ArtifactPreparer>,
    in_flight: InFlight,
    mut claimed: UnboundedReceiver<PathBuf>,
    ready: UnboundedSender<ReadyArtifact>,
) {
    while let Some(path) = claimed.recv().await {
        let prepared = preparer.prepare(&path).await;
        in_flight.lock().remove(&path);
        match prepared {
            Ok(artifact) => {
                if ready.send(artifact).is_err() {
                    warn!("delivery lane is gone, prepare worker stopping");
                    return;
                }
            }
            Err(e) => error!(path = %path.display(), error = %e, "preparation failed"),
        }
    }
}

/// One independent campaign per artifact; `permits` bounds concurrent uploads
pub async fn http_lane(
    mut rx: UnboundedReceiver<ReadyArtifact>,
    client: Arc<dyn DeliveryClient>,
    policy: RetryPolicy,
    journal: Arc<Journal>,
    permits: Arc<Semaphore>,
) {
    let mut campaigns = tokio::task::JoinSet::new();
    while let Some(artifact) = rx.recv().await {
        let client = client.clone();
        let journal = journal.clone();
        let permits = permits.clone();
        campaigns.spawn(async move {
            deliver_with_retry(client.as_ref(), &artifact, policy, &journal, &permits).await
        });
        // Reap finished campaigns so the set stays small
        while campaigns.try_join_next().is_some() {}
    }
    while campaigns.join_next().await.is_some() {}
}

/// An artifact waiting for its next socket batch
struct Retained {
    artifact: ReadyArtifact,
    backoff: Backoff,
    campaign: String,
}

/// Every `interval`: send new and due artifacts as one batch
pub async fn socket_lane(
    mut rx: UnboundedReceiver<ReadyArtifact>,
    client: SocketClient,
    policy: RetryPolicy,
    journal: Arc<Journal>,
    interval: Duration,
) {
    let mut pending: BTreeMap<PathBuf, Retained> = BTreeMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = false;

    loop {
        ticker.tick().await;
        while !closed {
            match rx.try_recv() {
                Ok(artifact) => {
                    pending.insert(
                        artifact.path.clone(),
                        Retained {
                            artifact,
                            backoff: Backoff::new(policy),
                            campaign: Journal::new_campaign(),
                        },
                    );
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => closed = true,
            }
        }

        let now = Instant::now();
        let due: Vec<ReadyArtifact> = pending
            .values()
            .filter(|r| r.backoff.is_due(now))
            .map(|r| r.artifact.clone())
            .collect();
        if !due.is_empty() {
            debug!(count = due.len(), retained = pending.len(), "sending batch");
            let report = client.send_batch(&due).await;
            let now = Instant::now();

            for path in report.delivered {
                if let Some(mut r) = pending.remove(&path) {
                    let attempt = r.backoff.begin_attempt();
                    journal_attempt(
                        &journal,
                        &r.campaign,
                        &r.artifact,
                        attempt,
                        AttemptOutcome::Success,
                        None,
                    );
                }
            }
            for (path, reason) in report.failed {
                let Some(r) = pending.get_mut(&path) else {
                    continue;
                };
                let attempt = r.backoff.begin_attempt();
                match r.backoff.record_failure(now) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            path = %path.display(),
                            attempt,
                            error = %reason,
                            retry_in_secs = delay.as_secs(),
                            "not delivered"
                        );
                        journal_attempt(
                            &journal,
                            &r.campaign,
                            &r.artifact,
                            attempt,
                            AttemptOutcome::TransientFailure,
                            Some(reason),
                        );
                    }
                    RetryDecision::Abandon => {
                        error!(
                            path = %path.display(),
                            attempts = attempt,
                            error = %reason,
                            "giving up, artifact kept on disk"
                        );
                        journal_attempt(
                            &journal,
                            &r.campaign,
                            &r.artifact,
                            attempt,
                            AttemptOutcome::PermanentFailure,
                            Some(reason),
                        );
                        pending.remove(&path);
                    }
                }
            }
        }

        if closed && pending.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;
    use crate::config::TranscodeFailurePolicy;
    use crate::error::PrepareError;
    use crate::stage::Transcoder;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Holds every transcode until a permit is released
    struct GatedTranscoder {
        started: Notify,
        release: Semaphore,
    }

    #[async_trait]
    impl Transcoder for GatedTranscoder {
        async fn transcode(&self, input: &Path, output: &Path) -> Result<(), PrepareError> {
            self.started.notify_one();
            self.release.acquire().await.unwrap().forget();
            std::fs::copy(input, output).unwrap();
            Ok(())
        }
    }

    fn newest_agent(dir: &TempDir) -> (Agent, PathBuf, Arc<GatedTranscoder>) {
        let watch = dir.path().join("rec");
        std::fs::create_dir(&watch).unwrap();
        let mut cfg = AgentConfig {
            origin: "cam1".into(),
            ..AgentConfig::default()
        };
        cfg.watch.dir = watch;
        cfg.detect.strategy = DetectStrategy::Newest;
        cfg.transcode.enabled = false;
        let agent = Agent::new(cfg).unwrap();

        let gate = Arc::new(GatedTranscoder {
            started: Notify::new(),
            release: Semaphore::new(0),
        });
        let preparer = ArtifactPreparer::new(
            agent.config().staging_dir(),
            "cam1",
            ChecksumType::Md5,
        )
        .with_transcoder(gate.clone(), "mp4", TranscodeFailurePolicy::Drop);
        let watch = agent.config().watch.dir.clone();
        (agent.with_preparer(preparer), watch, gate)
    }

    #[tokio::test]
    async fn test_slow_transcode_does_not_block_detection() {
        let dir = TempDir::new().unwrap();
        let (mut agent, watch, gate) = newest_agent(&dir);
        std::fs::write(watch.join("2024-01-01_10-00-00.avi"), b"first").unwrap();
        std::fs::write(watch.join("2024-01-01_10-05-00.avi"), b"second").unwrap();

        let (ready_tx, mut ready_rx) = unbounded_channel();
        let (claimed_tx, _worker) = agent.spawn_preparer(ready_tx);

        let first = agent.detect(SystemTime::now());
        assert_eq!(first, vec![watch.join("2024-01-01_10-00-00.avi")]);
        claimed_tx.send(first[0].clone()).unwrap();
        gate.started.notified().await;

        // First file is still transcoding; a newer recording frees the second one
        std::fs::write(watch.join("2024-01-01_10-10-00.avi"), b"third").unwrap();
        let second = agent.detect(SystemTime::now());
        assert_eq!(second, vec![watch.join("2024-01-01_10-05-00.avi")]);
        claimed_tx.send(second[0].clone()).unwrap();

        // Queued but not yet staged: not claimed twice
        assert!(agent.detect(SystemTime::now()).is_empty());

        gate.release.add_permits(2);
        let mut names = Vec::new();
        for _ in 0..2 {
            let artifact = tokio::time::timeout(Duration::from_secs(5), ready_rx.recv())
                .await
                .unwrap()
                .unwrap();
            names.push(artifact.file_name());
        }
        assert_eq!(names, vec!["2024-01-01_10-00-00.mp4", "2024-01-01_10-05-00.mp4"]);
        assert!(agent.in_flight.lock().is_empty());
    }

    #[test]
    fn test_staging_equal_to_watch_after_canonicalizing() {
        let dir = TempDir::new().unwrap();
        let watch = dir.path().join("rec");
        std::fs::create_dir(&watch).unwrap();
        let mut cfg = AgentConfig {
            origin: "cam1".into(),
            ..AgentConfig::default()
        };
        cfg.watch.dir = watch.clone();
        cfg.staging_dir = Some(watch.join(".").join("..").join("rec"));

        let err = Agent::new(cfg).err().unwrap();
        assert!(err.to_string().contains("staging_dir"), "{err}");
    }
}

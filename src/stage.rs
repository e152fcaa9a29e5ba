//! Turning a claimed recording into a deliverable artifact
//!
//! Claimed file → rename into the staging directory → optional transcode →
//! checksum. The checksum is computed once here and carried with the artifact
//! for every retry of its delivery.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::checksum::{checksum_file, ChecksumType};
use crate::config::{AgentConfig, TranscodeConfig, TranscodeFailurePolicy};
use crate::detect::is_candidate;
use crate::error::PrepareError;

/// A staged, optionally transcoded, checksummed file ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub origin: String,
}

impl ReadyArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write a transcoded copy of `input` to `output`
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), PrepareError>;
}

/// Runs an external program, `{input}`/`{output}` substituted into its arguments
pub struct CommandTranscoder {
    program: String,
    args: Vec<String>,
}

impl CommandTranscoder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(cfg: &TranscodeConfig) -> Self {
        Self::new(cfg.program.clone(), cfg.args.clone())
    }

    fn command_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl Transcoder for CommandTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), PrepareError> {
        let status = Command::new(&self.program)
            .args(self.command_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| PrepareError::TranscodeSpawn {
                path: input.to_path_buf(),
                source,
            })?;
        if !status.success() {
            return Err(PrepareError::TranscodeFailed {
                path: input.to_path_buf(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

struct TranscodeStep {
    transcoder: Arc<dyn Transcoder>,
    output_extension: String,
    on_failure: TranscodeFailurePolicy,
}

pub struct ArtifactPreparer {
    staging_dir: PathBuf,
    origin: String,
    checksum: ChecksumType,
    transcode: Option<TranscodeStep>,
}

impl ArtifactPreparer {
    pub fn new(staging_dir: PathBuf, origin: impl Into<String>, checksum: ChecksumType) -> Self {
        Self {
            staging_dir,
            origin: origin.into(),
            checksum,
            transcode: None,
        }
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        let preparer = Self::new(cfg.staging_dir(), cfg.origin.clone(), cfg.delivery.checksum);
        if cfg.transcode.enabled {
            preparer.with_transcoder(
                Arc::new(CommandTranscoder::from_config(&cfg.transcode)),
                cfg.transcode.output_extension.clone(),
                cfg.transcode.on_failure,
            )
        } else {
            preparer
        }
    }

    pub fn with_transcoder(
        mut self,
        transcoder: Arc<dyn Transcoder>,
        output_extension: impl Into<String>,
        on_failure: TranscodeFailurePolicy,
    ) -> Self {
        self.transcode = Some(TranscodeStep {
            transcoder,
            output_extension: output_extension.into(),
            on_failure,
        });
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn prepare(&self, claimed: &Path) -> Result<ReadyArtifact, PrepareError> {
        let staged = self.stage(claimed).await?;
        self.finish(staged).await
    }

    /// Rebuild artifacts from files an earlier run left in staging
    pub async fn recover(&self) -> io::Result<Vec<ReadyArtifact>> {
        if !self.staging_dir.exists() {
            return Ok(Vec::new());
        }
        let mut staged = Vec::new();
        let mut entries = fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_candidate(&path, &[]) {
                staged.push(path);
            }
        }
        staged.sort();

        let mut out = Vec::with_capacity(staged.len());
        for path in staged {
            match self.finish(path.clone()).await {
                Ok(artifact) => {
                    info!(path = %artifact.path.display(), "recovered staged artifact");
                    out.push(artifact);
                }
                Err(e) => error!(path = %path.display(), error = %e, "cannot recover staged file"),
            }
        }
        Ok(out)
    }

    async fn stage(&self, claimed: &Path) -> Result<PathBuf, PrepareError> {
        let stage_err = |source| PrepareError::Stage {
            path: claimed.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.staging_dir).await.map_err(stage_err)?;
        let name = claimed
            .file_name()
            .ok_or_else(|| stage_err(io::ErrorKind::InvalidInput.into()))?;
        let staged = self.staging_dir.join(name);

        match fs::rename(claimed, &staged).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(stage_err(e)),
            Err(e) => {
                // Different filesystem: copy under a hidden name, then swap in
                warn!(path = %claimed.display(), error = %e, "rename failed, copying into staging");
                let part = self
                    .staging_dir
                    .join(format!(".{}.part", name.to_string_lossy()));
                fs::copy(claimed, &part).await.map_err(stage_err)?;
                fs::rename(&part, &staged).await.map_err(stage_err)?;
                fs::remove_file(claimed).await.map_err(stage_err)?;
            }
        }
        info!(path = %staged.display(), "staged recording");
        Ok(staged)
    }

    async fn finish(&self, staged: PathBuf) -> Result<ReadyArtifact, PrepareError> {
        let final_path = match &self.transcode {
            Some(step) if !has_extension(&staged, &step.output_extension) => {
                self.transcode_staged(step, staged).await?
            }
            _ => staged,
        };

        let kind = self.checksum;
        let hash_path = final_path.clone();
        let checksum = tokio::task::spawn_blocking(move || checksum_file(&hash_path, kind))
            .await
            .map_err(|e| PrepareError::Checksum {
                path: final_path.clone(),
                source: io::Error::other(e),
            })?
            .map_err(|source| PrepareError::Checksum {
                path: final_path.clone(),
                source,
            })?;
        let size = fs::metadata(&final_path)
            .await
            .map_err(|source| PrepareError::Checksum {
                path: final_path.clone(),
                source,
            })?
            .len();

        Ok(ReadyArtifact {
            path: final_path,
            size,
            checksum,
            origin: self.origin.clone(),
        })
    }

    async fn transcode_staged(
        &self,
        step: &TranscodeStep,
        staged: PathBuf,
    ) -> Result<PathBuf, PrepareError> {
        let output = staged.with_extension(&step.output_extension);
        match step.transcoder.transcode(&staged, &output).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&staged).await {
                    warn!(path = %staged.display(), error = %e, "cannot remove pre-transcode file");
                }
                info!(path = %output.display(), "transcoded");
                Ok(output)
            }
            Err(e) => {
                let _ = fs::remove_file(&output).await;
                match step.on_failure {
                    TranscodeFailurePolicy::Drop => {
                        error!(path = %staged.display(), error = %e, "transcode failed, artifact dropped");
                        Err(e)
                    }
                    TranscodeFailurePolicy::DeliverRaw => {
                        warn!(path = %staged.display(), error = %e, "transcode failed, delivering raw file");
                        Ok(staged)
                    }
                }
            }
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Copies input to output, optionally failing
    struct FakeTranscoder {
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeTranscoder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode(&self, input: &Path, output: &Path) -> Result<(), PrepareError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Leave a partial output behind either way
            let mut data = std::fs::read(input).unwrap();
            data.reverse();
            std::fs::write(output, &data).unwrap();
            if self.fail {
                return Err(PrepareError::TranscodeFailed {
                    path: input.to_path_buf(),
                    status: "exit status: 1".into(),
                });
            }
            Ok(())
        }
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let watch = dir.path().join("recordings");
        std::fs::create_dir(&watch).unwrap();
        let staging = watch.join("pending");
        (dir, watch, staging)
    }

    #[tokio::test]
    async fn test_prepare_without_transcode() {
        let (_dir, watch, staging) = setup();
        let src = watch.join("clip.avi");
        std::fs::write(&src, b"raw frames").unwrap();

        let preparer = ArtifactPreparer::new(staging.clone(), "cam1", ChecksumType::Md5);
        let artifact = preparer.prepare(&src).await.unwrap();

        assert!(!src.exists());
        assert_eq!(artifact.path, staging.join("clip.avi"));
        assert_eq!(artifact.size, 10);
        assert_eq!(artifact.origin, "cam1");
        assert_eq!(artifact.checksum, checksum_bytes(b"raw frames", ChecksumType::Md5));
        assert_eq!(artifact.file_name(), "clip.avi");
    }

    #[tokio::test]
    async fn test_transcode_replaces_staged_file() {
        let (_dir, watch, staging) = setup();
        let src = watch.join("clip.avi");
        std::fs::write(&src, b"abc").unwrap();

        let transcoder = FakeTranscoder::new(false);
        let preparer = ArtifactPreparer::new(staging.clone(), "cam1", ChecksumType::Md5)
            .with_transcoder(transcoder.clone(), "mp4", TranscodeFailurePolicy::Drop);
        let artifact = preparer.prepare(&src).await.unwrap();

        assert_eq!(artifact.path, staging.join("clip.mp4"));
        assert!(!staging.join("clip.avi").exists());
        assert_eq!(artifact.checksum, checksum_bytes(b"cba", ChecksumType::Md5));
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transcode_failure_drops_artifact() {
        let (_dir, watch, staging) = setup();
        let src = watch.join("clip.avi");
        std::fs::write(&src, b"abc").unwrap();

        let preparer = ArtifactPreparer::new(staging.clone(), "cam1", ChecksumType::Md5)
            .with_transcoder(FakeTranscoder::new(true), "mp4", TranscodeFailurePolicy::Drop);
        let err = preparer.prepare(&src).await.unwrap_err();

        assert!(matches!(err, PrepareError::TranscodeFailed { .. }));
        // Raw file kept in staging, partial output cleaned up
        assert!(staging.join("clip.avi").exists());
        assert!(!staging.join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn test_transcode_failure_delivers_raw() {
        let (_dir, watch, staging) = setup();
        let src = watch.join("clip.avi");
        std::fs::write(&src, b"abc").unwrap();

        let preparer = ArtifactPreparer::new(staging.clone(), "cam1", ChecksumType::Md5)
            .with_transcoder(FakeTranscoder::new(true), "mp4", TranscodeFailurePolicy::DeliverRaw);
        let artifact = preparer.prepare(&src).await.unwrap();

        assert_eq!(artifact.path, staging.join("clip.avi"));
        assert_eq!(artifact.checksum, checksum_bytes(b"abc", ChecksumType::Md5));
        assert!(!staging.join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn test_prepare_missing_file() {
        let (_dir, watch, staging) = setup();
        let preparer = ArtifactPreparer::new(staging, "cam1", ChecksumType::Md5);
        let err = preparer.prepare(&watch.join("gone.avi")).await.unwrap_err();
        assert!(matches!(err, PrepareError::Stage { .. }));
    }

    #[tokio::test]
    async fn test_recover_staged_files() {
        let (_dir, _watch, staging) = setup();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("done.mp4"), b"ready").unwrap();
        std::fs::write(staging.join("raw.avi"), b"raw").unwrap();
        std::fs::write(staging.join(".half.mp4.part"), b"junk").unwrap();

        let transcoder = FakeTranscoder::new(false);
        let preparer = ArtifactPreparer::new(staging.clone(), "cam1", ChecksumType::Md5)
            .with_transcoder(transcoder.clone(), "mp4", TranscodeFailurePolicy::Drop);
        let recovered = preparer.recover().await.unwrap();

        let paths: Vec<_> = recovered.iter().map(|a| a.path.clone()).collect();
        assert_eq!(paths, vec![staging.join("done.mp4"), staging.join("raw.mp4")]);
        // Only the raw file needed transcoding
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recover_without_staging_dir() {
        let (_dir, _watch, staging) = setup();
        let preparer = ArtifactPreparer::new(staging, "cam1", ChecksumType::Md5);
        assert!(preparer.recover().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_transcoder() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.avi");
        let output = dir.path().join("in.mp4");
        std::fs::write(&input, b"frames").unwrap();

        let copy = CommandTranscoder::new("cp", vec!["{input}".into(), "{output}".into()]);
        copy.transcode(&input, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"frames");

        let failing = CommandTranscoder::new("false", vec![]);
        assert!(matches!(
            failing.transcode(&input, &output).await,
            Err(PrepareError::TranscodeFailed { .. })
        ));

        let missing = CommandTranscoder::new("/nonexistent/transcoder", vec![]);
        assert!(matches!(
            missing.transcode(&input, &output).await,
            Err(PrepareError::TranscodeSpawn { .. })
        ));
    }
}

//! HTTP lane: `POST /upload` multipart endpoint
//!
//! The file field is streamed to a hidden temp file while being hashed, then
//! renamed to `{dest}/{camera}/{filename}`. Same-named uploads replace the
//! stored file.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checksum::{ChecksumType, Hasher};
use crate::protocol::{fields, UPLOAD_ROUTE};
use crate::protocol_core::safe_file_name;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("missing `file` field")]
    MissingFile,

    #[error("missing or invalid `camera` field")]
    BadCamera,

    #[error("invalid file name {0:?}")]
    BadFileName(String),

    #[error("checksum mismatch: sent {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("storage error: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    fn status_code(&self) -> StatusCode {
        match self {
            UploadError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct UploadState {
    dest_dir: Arc<PathBuf>,
    checksum: ChecksumType,
}

impl UploadState {
    pub fn new(dest_dir: PathBuf, checksum: ChecksumType) -> Self {
        Self {
            dest_dir: Arc::new(dest_dir),
            checksum,
        }
    }
}

pub fn router(state: UploadState) -> Router {
    Router::new()
        .route(UPLOAD_ROUTE, post(upload))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// A file field written to a temp file, not yet in place
struct Received {
    temp: PathBuf,
    file_name: String,
    checksum: String,
}

async fn upload(
    State(state): State<UploadState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, UploadError> {
    fs::create_dir_all(state.dest_dir.as_ref()).await?;
    let mut received = None;
    let result = receive_form(&state, multipart, &mut received).await;
    if result.is_err() {
        if let Some(r) = received {
            let _ = fs::remove_file(&r.temp).await;
        }
    }
    let stored = result?;
    Ok((StatusCode::OK, format!("stored {}", stored.display())))
}

async fn receive_form(
    state: &UploadState,
    mut multipart: Multipart,
    received: &mut Option<Received>,
) -> Result<PathBuf, UploadError> {
    let mut camera = None;
    let mut expected = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(fields::CAMERA) => camera = Some(field.text().await?),
            Some(fields::CHECKSUM) => expected = Some(field.text().await?.to_ascii_lowercase()),
            Some(fields::FILE) if received.is_none() => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let file_name = safe_file_name(&file_name)
                    .map_err(|_| UploadError::BadFileName(file_name.clone()))?
                    .to_string();
                let temp = state
                    .dest_dir
                    .join(format!(".upload-{}.part", Uuid::new_v4()));
                *received = Some(Received {
                    temp: temp.clone(),
                    file_name,
                    checksum: String::new(),
                });
                let checksum = stream_to_file(field, &temp, state.checksum).await?;
                if let Some(r) = received.as_mut() {
                    r.checksum = checksum;
                }
            }
            _ => {}
        }
    }

    let Some(file) = received.as_ref() else {
        return Err(UploadError::MissingFile);
    };
    let camera = camera
        .filter(|c| safe_file_name(c).is_ok())
        .ok_or(UploadError::BadCamera)?;
    if let Some(expected) = expected {
        if expected != file.checksum {
            warn!(camera = %camera, file = %file.file_name, "checksum mismatch, upload discarded");
            return Err(UploadError::ChecksumMismatch {
                expected,
                actual: file.checksum.clone(),
            });
        }
    }

    let dir = state.dest_dir.join(&camera);
    fs::create_dir_all(&dir).await?;
    let dest = dir.join(&file.file_name);
    fs::rename(&file.temp, &dest).await?;
    info!(camera = %camera, path = %dest.display(), "upload stored");
    Ok(dest)
}

async fn stream_to_file(
    mut field: Field<'_>,
    path: &std::path::Path,
    kind: ChecksumType,
) -> Result<String, UploadError> {
    let mut out = fs::File::create(path).await?;
    let mut hasher = Hasher::new(kind);
    while let Some(chunk) = field.chunk().await? {
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::deliver::http::HttpClient;
    use crate::deliver::DeliveryClient;
    use crate::error::DeliveryError;
    use crate::stage::ReadyArtifact;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn spawn_server(dest: PathBuf) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(UploadState::new(dest, ChecksumType::Md5));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}{UPLOAD_ROUTE}")
    }

    fn artifact(dir: &TempDir, name: &str, data: &[u8]) -> ReadyArtifact {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        ReadyArtifact {
            path,
            size: data.len() as u64,
            checksum: checksum_bytes(data, ChecksumType::Md5),
            origin: "cam1".into(),
        }
    }

    #[tokio::test]
    async fn test_upload_stored_under_camera() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let url = spawn_server(dest.path().to_path_buf()).await;
        let data = vec![7u8; 200_000];
        let art = artifact(&src, "clip.mp4", &data);

        HttpClient::new(url).send(&art).await.unwrap();

        let stored = dest.path().join("cam1").join("clip.mp4");
        assert_eq!(std::fs::read(&stored).unwrap(), data);
        // No temp files left behind
        let leftovers = std::fs::read_dir(dest.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".part"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_same_name_replaces() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let url = spawn_server(dest.path().to_path_buf()).await;
        let client = HttpClient::new(url);

        client.send(&artifact(&src, "clip.mp4", b"first")).await.unwrap();
        client.send(&artifact(&src, "clip.mp4", b"second")).await.unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("cam1/clip.mp4")).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let url = spawn_server(dest.path().to_path_buf()).await;
        let mut art = artifact(&src, "clip.mp4", b"frames");
        art.checksum = "0".repeat(32);

        let err = HttpClient::new(url).send(&art).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status(422)));
        assert!(!dest.path().join("cam1/clip.mp4").exists());
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let dest = TempDir::new().unwrap();
        let url = spawn_server(dest.path().to_path_buf()).await;
        let form = reqwest::multipart::Form::new().text(fields::CAMERA, "cam1");
        let resp = reqwest::Client::new()
            .post(&url)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }
}

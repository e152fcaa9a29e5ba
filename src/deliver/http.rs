//! HTTP multipart push: one `POST` per artifact, file streamed from disk

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio_util::io::ReaderStream;

use super::DeliveryClient;
use crate::error::DeliveryError;
use crate::protocol::fields;
use crate::stage::ReadyArtifact;

pub struct HttpClient {
    client: Client,
    url: String,
}

impl HttpClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DeliveryClient for HttpClient {
    async fn send(&self, artifact: &ReadyArtifact) -> Result<(), DeliveryError> {
        let file = tokio::fs::File::open(&artifact.path).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, artifact.size)
            .file_name(artifact.file_name())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text(fields::CAMERA, artifact.origin.clone())
            .text(fields::CHECKSUM, artifact.checksum.clone())
            .part(fields::FILE, part);

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

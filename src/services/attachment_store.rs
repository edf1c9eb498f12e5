//! Multipart upload client with byte-level progress.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use super::chat_types::{StoredObject, UploadFile, UploadSource};
use super::transport::AttachmentStore;
use crate::error::{Result, SyncError};

const CHUNK_SIZE: usize = 64 * 1024;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>;

pub struct HttpAttachmentStore {
    upload_url: String,
    credential: String,
    client: reqwest::Client,
}

impl HttpAttachmentStore {
    pub fn new(base_url: &str, credential: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Upload HTTP client: {}", e)))?;

        Ok(Self {
            upload_url: format!("{}/files", base_url.trim_end_matches('/')),
            credential: credential.to_string(),
            client,
        })
    }
}

/// Byte stream of the file contents.
async fn open_source(source: UploadSource) -> Result<ByteStream> {
    match source {
        UploadSource::Memory(bytes) => {
            let chunks: Vec<std::io::Result<Vec<u8>>> =
                bytes.chunks(CHUNK_SIZE).map(|c| Ok(c.to_vec())).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
        UploadSource::Path(path) => {
            let file = tokio::fs::File::open(&path).await?;
            Ok(Box::pin(
                ReaderStream::with_capacity(file, CHUNK_SIZE)
                    .map(|chunk| chunk.map(|b| b.to_vec())),
            ))
        }
    }
}

/// Wrap `stream` so every chunk reports cumulative percentage of `total`.
fn with_progress(
    stream: ByteStream,
    total: u64,
    progress: mpsc::UnboundedSender<u8>,
) -> ByteStream {
    let sent = Arc::new(AtomicU64::new(0));
    Box::pin(stream.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            let done = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
            let pct = if total == 0 {
                100
            } else {
                ((done.min(total) * 100) / total) as u8
            };
            let _ = progress.send(pct);
        }
    }))
}

#[async_trait]
impl AttachmentStore for HttpAttachmentStore {
    async fn upload(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        file: UploadFile,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<StoredObject> {
        let total = match (file.size, &file.source) {
            (Some(size), _) => size,
            (None, UploadSource::Memory(bytes)) => bytes.len() as u64,
            (None, UploadSource::Path(path)) => tokio::fs::metadata(path).await?.len(),
        };

        let stream = with_progress(open_source(file.source).await?, total, progress);
        let body = reqwest::Body::wrap_stream(stream);
        let part = reqwest::multipart::Part::stream_with_length(body, total)
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| {
                SyncError::Upload(format!("Invalid MIME type {}: {}", file.mime_type, e))
            })?;

        let form = reqwest::multipart::Form::new()
            .text("scopeId", scope_id.to_string())
            .text("targetType", target_type.to_string())
            .text("targetId", target_id.to_string())
            .part("file", part);

        log::info!("Uploading {} ({} bytes) for {} {}", file.name, total, target_type, target_id);

        let response = self
            .client
            .post(&self.upload_url)
            .bearer_auth(&self.credential)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SyncError::Upload(format!("{}: {}", file.name, e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Upload(format!(
                "{} upload returned {}",
                file.name,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Upload(format!("Failed to parse upload result: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_upload_reports_progress_to_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "a1", "originalName": "big.bin", "mimeType": "application/octet-stream",
                "objectKey": "e1/big.bin", "size": 200000
            })))
            .mount(&server)
            .await;

        let store =
            HttpAttachmentStore::new(&server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let file = UploadFile::from_bytes("big.bin", vec![7u8; 200_000]);

        let stored = store.upload("e1", "message", "m1", file, tx).await.unwrap();
        assert_eq!(stored.object_key, "e1/big.bin");

        let mut seen = Vec::new();
        while let Ok(pct) = rx.try_recv() {
            seen.push(pct);
        }
        assert!(seen.len() >= 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_rejected_upload_is_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;

        let store =
            HttpAttachmentStore::new(&server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let file = UploadFile::from_bytes("big.bin", vec![0u8; 10]);
        let err = store.upload("e1", "message", "m1", file, tx).await.unwrap_err();
        assert!(matches!(err, SyncError::Upload(_)));
    }

    #[tokio::test]
    async fn test_path_source_streams_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![1u8; 1000]).unwrap();
        let mut stream = open_source(UploadSource::Path(tmp.path().to_path_buf()))
            .await
            .unwrap();
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 1000);
    }
}

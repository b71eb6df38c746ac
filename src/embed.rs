use crate::error::EmbedError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Embedder turns a photo into a face embedding.
///
/// The implementation owns decoding, face detection, alignment and the
/// embedding model. Implementations must be safe for concurrent use.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the embedding of the single face in `image`.
    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, EmbedError>;

    /// Dimensionality of the returned vectors.
    fn dimension(&self) -> usize;
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f64>,
}

/// Client for an embedding sidecar that accepts raw image bytes.
///
/// `200 {"embedding": [...]}` is a face, `422` means no face was found,
/// `400`/`415` means the image could not be decoded.
pub struct HttpEmbedder {
    client: Client,
    url: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(
        url: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbedError::Failed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            dimension,
        })
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>, EmbedError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Timeout
                } else {
                    EmbedError::Failed(e.to_string())
                }
            })?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNPROCESSABLE_ENTITY => return Err(EmbedError::NoFaceDetected),
            StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                return Err(EmbedError::InvalidImage)
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                return Err(EmbedError::Failed(format!("HTTP {status}: {body}")));
            }
        }

        let data: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Failed(e.to_string()))?;

        Ok(data.embedding.into_iter().map(|v| v as f32).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

use super::{blob_key, BlobStore};
use crate::error::BlobError;
use crate::model::BlobRef;
use aws_config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::{config::Builder, primitives::ByteStream, Client};
use bytes::Bytes;

/// Photos in an S3-compatible bucket (MinIO or AWS).
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub async fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("AWS_ENDPOINT_URL")
            .unwrap_or_else(|_| "http://minio:9000".to_string());
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .unwrap_or_else(|_| "minioadmin".to_string());
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .unwrap_or_else(|_| "minioadmin".to_string());
        let bucket_name = std::env::var("FACEBANK_BUCKET")
            .unwrap_or_else(|_| "facebank".to_string());

        let creds = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "static",
        );

        let config = Builder::new()
            .endpoint_url(endpoint)
            .region(Region::new("us-east-1"))
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(config);

        // Ensure bucket exists; an "already owned" error is fine.
        if let Err(e) = client.create_bucket().bucket(&bucket_name).send().await {
            tracing::debug!("create_bucket {}: {}", bucket_name, e);
        }

        tracing::info!("Photo store at s3://{}/photos/", bucket_name);
        Ok(Self {
            client,
            bucket: bucket_name,
            prefix: "photos/".to_string(),
        })
    }

    fn object_key(&self, blob: &BlobRef) -> String {
        format!("{}{}", self.prefix, blob.as_str())
    }
}

fn is_not_found<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err.as_service_error().and_then(|e| e.code()),
        Some("NoSuchKey") | Some("NotFound")
    )
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, identity: &str, data: Bytes) -> Result<BlobRef, BlobError> {
        let blob = BlobRef(blob_key(identity));
        let key = self.object_key(&blob);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("image/jpeg")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("S3 put_object failed - key: {}, error: {:?}", key, e);
                BlobError::Backend(format!("put {key}: {e}"))
            })?;

        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> Result<Bytes, BlobError> {
        let key = self.object_key(blob);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BlobError::NotFound(blob.to_string())
                } else {
                    BlobError::Backend(format!("get {key}: {e}"))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Backend(format!("read {key}: {e}")))?;

        Ok(data.into_bytes())
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobError> {
        let key = self.object_key(blob);

        // S3 deletes are silent for missing keys, so check first.
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BlobError::NotFound(blob.to_string())
                } else {
                    BlobError::Backend(format!("head {key}: {e}"))
                }
            })?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(format!("delete {key}: {e}")))?;
        Ok(())
    }

    fn encodes_identity(&self) -> bool {
        true
    }
}

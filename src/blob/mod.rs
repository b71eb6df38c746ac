//! Photo storage. The gallery references blobs by [`BlobRef`] but does not
//! own them.

mod fs;
#[cfg(feature = "s3")]
mod s3;

pub use fs::FsBlobStore;
#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

use crate::error::BlobError;
use crate::model::BlobRef;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` as a new blob. `identity` only shapes the key.
    async fn put(&self, identity: &str, data: Bytes) -> Result<BlobRef, BlobError>;

    async fn get(&self, blob: &BlobRef) -> Result<Bytes, BlobError>;

    /// Removes a blob. A missing blob is reported as [`BlobError::NotFound`].
    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobError>;

    /// Whether blob keys embed the identity, so a rename should move the blob.
    fn encodes_identity(&self) -> bool {
        false
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s/\\:]+").expect("valid regex"))
}

/// Longest identity prefix, in bytes, that goes into a blob key. Keeps file
/// names well under the usual 255-byte limit.
pub const MAX_KEY_NAME_BYTES: usize = 128;

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Builds a fresh blob key: `<safe_name>_<unix_ts>_<suffix>.jpg`.
pub fn blob_key(identity: &str) -> String {
    let safe = unsafe_chars().replace_all(identity.trim(), "_");
    let safe = truncate_on_char_boundary(safe.trim_start_matches('.'), MAX_KEY_NAME_BYTES);
    let safe = if safe.is_empty() { "face" } else { safe };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}.jpg", safe, Utc::now().timestamp(), &suffix[..8])
}

/// In-memory [`BlobStore`]. Data is lost on restart.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<BlobRef> {
        self.blobs.lock().keys().map(|k| BlobRef(k.clone())).collect()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, identity: &str, data: Bytes) -> Result<BlobRef, BlobError> {
        let key = blob_key(identity);
        self.blobs.lock().insert(key.clone(), data);
        Ok(BlobRef(key))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Bytes, BlobError> {
        self.blobs
            .lock()
            .get(blob.as_str())
            .cloned()
            .ok_or_else(|| BlobError::NotFound(blob.to_string()))
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .remove(blob.as_str())
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(blob.to_string()))
    }

    fn encodes_identity(&self) -> bool {
        true
    }
}

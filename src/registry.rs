//! The registry service: ties embedding extraction, the gallery, the photo
//! store and the matcher together.
//!
//! Mutations on one identity are serialized through [`IdentityLocks`].
//! Every mutation that touches both the gallery and the blob store runs in
//! a spawned task that the caller awaits, so a caller that goes away midway
//! cannot leave a record and its photo out of step.

use crate::blob::BlobStore;
use crate::defaults::DEFAULT_EMBED_TIMEOUT_MS;
use crate::embed::Embedder;
use crate::error::{BlobError, EmbedError, GalleryError, RegistryError};
use crate::gallery::Gallery;
use crate::matcher::Matcher;
use crate::metrics::MetricsCollector;
use crate::model::{normalize_identity, BlobRef, FaceRecord, MatchResult, RecordSummary};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on a single `embed` call.
    pub embed_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            embed_timeout: Duration::from_millis(DEFAULT_EMBED_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registered {
    pub identity: String,
    pub total: usize,
    /// True when an existing registration was overwritten.
    pub replaced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deleted {
    pub identity: String,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Renamed {
    pub old_name: String,
    pub new_name: String,
}

/// `ready` means the gallery is loaded and the service accepts requests. It
/// says nothing about the embedder, which only real requests exercise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub ready: bool,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Per-identity locks
// ---------------------------------------------------------------------------

/// One async mutex per identity, created on demand and forgotten once no
/// operation holds or waits on it.
#[derive(Default)]
pub struct IdentityLocks {
    locks: parking_lot::Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Held while an operation owns an identity.
pub struct IdentityGuard {
    _guard: OwnedMutexGuard<()>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(identity).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(identity.to_string(), Arc::downgrade(&lock));
        lock
    }

    pub async fn lock(&self, identity: &str) -> IdentityGuard {
        let lock = self.handle(identity);
        IdentityGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Locks two identities in lexical order. Locks once if they are equal.
    pub async fn lock_pair(&self, a: &str, b: &str) -> Vec<IdentityGuard> {
        if a == b {
            return vec![self.lock(a).await];
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        vec![first, second]
    }

    /// Number of identities with a live lock.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    gallery: Arc<Gallery>,
    matcher: Arc<dyn Matcher>,
    embedder: Arc<dyn Embedder>,
    blobs: Arc<dyn BlobStore>,
    locks: IdentityLocks,
    metrics: MetricsCollector,
    config: RegistryConfig,
}

impl Registry {
    /// Fails when the embedder and the gallery disagree on the dimension.
    pub fn new(
        gallery: Arc<Gallery>,
        matcher: Arc<dyn Matcher>,
        embedder: Arc<dyn Embedder>,
        blobs: Arc<dyn BlobStore>,
        config: RegistryConfig,
    ) -> Result<Self, GalleryError> {
        if embedder.dimension() != gallery.dimension() {
            return Err(GalleryError::DimensionMismatch {
                expected: gallery.dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self {
            gallery,
            matcher,
            embedder,
            blobs,
            locks: IdentityLocks::new(),
            metrics: MetricsCollector::new(),
            config,
        })
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    /// Registers `image` under `identity`, replacing any earlier registration.
    pub async fn register(
        &self,
        identity: &str,
        image: Bytes,
    ) -> Result<Registered, RegistryError> {
        let timer = crate::measure_operation!(self.metrics, "register");
        let result = self.register_inner(identity, image).await;
        timer.finish(result.is_ok());
        result
    }

    async fn register_inner(
        &self,
        identity: &str,
        image: Bytes,
    ) -> Result<Registered, RegistryError> {
        let identity = require_identity(identity)?;
        let embedding = self.extract(&image).await?;

        let guard = self.locks.lock(&identity).await;
        let gallery = self.gallery.clone();
        let blobs = self.blobs.clone();
        detached(async move {
            let _guard = guard;
            store_registration(&gallery, blobs.as_ref(), identity, embedding, image).await
        })
        .await
    }

    /// Finds the closest registered identity. Never mutates anything.
    pub async fn recognize(&self, image: Bytes) -> Result<MatchResult, RegistryError> {
        let timer = crate::measure_operation!(self.metrics, "recognize");
        let result = self.recognize_inner(image).await;
        timer.finish(result.is_ok());
        result
    }

    async fn recognize_inner(&self, image: Bytes) -> Result<MatchResult, RegistryError> {
        let embedding = self.extract(&image).await?;
        let snapshot = self.gallery.all_records();
        let result = self.matcher.find_nearest(&embedding, &snapshot)?;
        match &result {
            MatchResult::Match { identity, distance } => {
                tracing::info!("Recognized {} at distance {:.4}", identity, distance)
            }
            MatchResult::Unknown { distance } => {
                tracing::info!("No match, nearest distance {:.4}", distance)
            }
            MatchResult::Empty => tracing::info!("Recognize against empty gallery"),
        }
        Ok(result)
    }

    /// Removes an identity and, best-effort, its photo.
    pub async fn delete(&self, identity: &str) -> Result<Deleted, RegistryError> {
        let timer = crate::measure_operation!(self.metrics, "delete");
        let result = self.delete_inner(identity).await;
        timer.finish(result.is_ok());
        result
    }

    async fn delete_inner(&self, identity: &str) -> Result<Deleted, RegistryError> {
        let identity = require_identity(identity)?;
        let guard = self.locks.lock(&identity).await;
        let gallery = self.gallery.clone();
        let blobs = self.blobs.clone();
        detached(async move {
            let _guard = guard;
            let name = identity.clone();
            let removed = write_gallery(&gallery, move |g| g.delete(&name)).await?;
            release_blob(blobs.as_ref(), &removed.blob_ref).await;
            let total = gallery.count();
            tracing::info!("Deleted {} ({} remaining)", identity, total);
            Ok(Deleted { identity, total })
        })
        .await
    }

    /// Renames an identity. Photo relocation is best-effort and never undoes
    /// the rename.
    pub async fn rename(&self, old: &str, new: &str) -> Result<Renamed, RegistryError> {
        let timer = crate::measure_operation!(self.metrics, "rename");
        let result = self.rename_inner(old, new).await;
        timer.finish(result.is_ok());
        result
    }

    async fn rename_inner(&self, old: &str, new: &str) -> Result<Renamed, RegistryError> {
        let old = require_identity(old)?;
        let new = require_identity(new)?;
        let guards = self.locks.lock_pair(&old, &new).await;
        let gallery = self.gallery.clone();
        let blobs = self.blobs.clone();
        detached(async move {
            let _guards = guards;
            let (from, to) = (old.clone(), new.clone());
            let renamed = write_gallery(&gallery, move |g| g.rename(&from, &to)).await?;
            if old != new && blobs.encodes_identity() {
                relocate_blob(&gallery, blobs.as_ref(), &renamed).await;
            }
            tracing::info!("Renamed {} -> {}", old, new);
            Ok(Renamed {
                old_name: old,
                new_name: new,
            })
        })
        .await
    }

    pub fn list(&self) -> Vec<String> {
        self.gallery.identities()
    }

    pub fn list_detail(&self) -> Vec<RecordSummary> {
        self.gallery.list()
    }

    /// Always ready: a registry only exists once its gallery has loaded.
    pub fn status(&self) -> Status {
        Status {
            ready: true,
            total: self.gallery.count(),
        }
    }

    /// The stored photo of an identity.
    pub async fn photo(&self, identity: &str) -> Result<Bytes, RegistryError> {
        let identity = require_identity(identity)?;
        let record = self.gallery.get(&identity)?;
        self.blobs.get(&record.blob_ref).await.map_err(|e| match e {
            BlobError::NotFound(_) => {
                tracing::warn!("Photo {} of {} is missing", record.blob_ref, identity);
                RegistryError::NotFound(format!("photo of {identity}"))
            }
            other => RegistryError::StoreFailure(other.to_string()),
        })
    }

    /// Runs the embedder under the configured timeout and validates its output.
    async fn extract(&self, image: &[u8]) -> Result<Vec<f32>, RegistryError> {
        if image.is_empty() {
            return Err(RegistryError::InvalidInput("empty image".to_string()));
        }

        let outcome = tokio::time::timeout(self.config.embed_timeout, self.embedder.embed(image))
            .await
            .unwrap_or(Err(EmbedError::Timeout));

        let embedding = match outcome {
            Ok(embedding) => embedding,
            Err(e @ (EmbedError::Failed(_) | EmbedError::Timeout)) => {
                tracing::error!("Embedding extraction failed: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                tracing::debug!("Embedding rejected image: {}", e);
                return Err(e.into());
            }
        };

        let expected = self.gallery.dimension();
        if embedding.len() != expected {
            tracing::error!(
                "Embedder returned {} values, gallery expects {}",
                embedding.len(),
                expected
            );
            return Err(RegistryError::ExtractionFailure(format!(
                "embedding has dimension {}, expected {}",
                embedding.len(),
                expected
            )));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            tracing::error!("Embedder returned non-finite values");
            return Err(RegistryError::ExtractionFailure(
                "embedding contains non-finite values".to_string(),
            ));
        }
        Ok(embedding)
    }
}

fn require_identity(raw: &str) -> Result<String, RegistryError> {
    normalize_identity(raw)
        .ok_or_else(|| RegistryError::InvalidInput("identity must not be empty".to_string()))
}

/// Runs `fut` to completion on the runtime even if the caller stops waiting.
async fn detached<F, T>(fut: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, RegistryError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| RegistryError::StoreFailure(format!("registry task aborted: {e}")))?
}

/// Runs a gallery mutation on the blocking pool, since it waits for the
/// store to sync.
async fn write_gallery<T, F>(gallery: &Arc<Gallery>, op: F) -> Result<T, RegistryError>
where
    F: FnOnce(&Gallery) -> Result<T, GalleryError> + Send + 'static,
    T: Send + 'static,
{
    let gallery = gallery.clone();
    tokio::task::spawn_blocking(move || op(&gallery))
        .await
        .map_err(|e| RegistryError::StoreFailure(format!("gallery write aborted: {e}")))?
        .map_err(RegistryError::from)
}

/// Blob write, gallery upsert, then release of the replaced photo. A failed
/// upsert deletes the blob it just wrote.
async fn store_registration(
    gallery: &Arc<Gallery>,
    blobs: &dyn BlobStore,
    identity: String,
    embedding: Vec<f32>,
    image: Bytes,
) -> Result<Registered, RegistryError> {
    let blob_ref = blobs.put(&identity, image).await.map_err(|e| {
        tracing::error!("Failed to store photo for {}: {}", identity, e);
        RegistryError::StoreFailure(e.to_string())
    })?;

    let (name, stored) = (identity.clone(), blob_ref.clone());
    let upsert = move |g: &Gallery| g.upsert(&name, embedding, stored, Utc::now());
    let upserted = match write_gallery(gallery, upsert).await {
        Ok(upserted) => upserted,
        Err(e) => {
            tracing::error!(
                "Failed to save {}: {}; discarding photo {}",
                identity,
                e,
                blob_ref
            );
            release_blob(blobs, &blob_ref).await;
            return Err(e);
        }
    };

    if let Some(previous) = &upserted.previous {
        if previous.blob_ref != blob_ref {
            release_blob(blobs, &previous.blob_ref).await;
        }
    }

    let total = gallery.count();
    tracing::info!(
        "Registered {} ({}; {} total)",
        identity,
        if upserted.is_new() { "new" } else { "replaced" },
        total
    );
    Ok(Registered {
        identity,
        total,
        replaced: !upserted.is_new(),
    })
}

/// Moves a renamed record's photo under the new name: copy, repoint, delete
/// the old one. Any failure is logged and leaves the record consistent.
async fn relocate_blob(gallery: &Arc<Gallery>, blobs: &dyn BlobStore, record: &FaceRecord) {
    let data = match blobs.get(&record.blob_ref).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(
                "Cannot relocate photo {} of {}: {}",
                record.blob_ref,
                record.identity,
                e
            );
            return;
        }
    };

    let moved = match blobs.put(&record.identity, data).await {
        Ok(moved) => moved,
        Err(e) => {
            tracing::warn!("Failed to copy photo for {}: {}", record.identity, e);
            return;
        }
    };

    let (name, target) = (record.identity.clone(), moved.clone());
    match write_gallery(gallery, move |g| g.set_blob_ref(&name, target)).await {
        Ok(_) => release_blob(blobs, &record.blob_ref).await,
        Err(e) => {
            tracing::warn!("Failed to repoint {} to {}: {}", record.identity, moved, e);
            release_blob(blobs, &moved).await;
        }
    }
}

/// Best-effort photo deletion. Never fails the caller.
async fn release_blob(blobs: &dyn BlobStore, blob: &BlobRef) {
    match blobs.delete(blob).await {
        Ok(()) => tracing::debug!("Deleted photo {}", blob),
        Err(BlobError::NotFound(_)) => {
            tracing::warn!("Photo {} not found, nothing to delete", blob)
        }
        Err(e) => tracing::error!("Failed to delete photo {}: {}", blob, e),
    }
}

//! The gallery: every registered face, keyed by identity.
//!
//! Records live in memory as `Arc<FaceRecord>` under one coarse read-write
//! lock. Writers are serialized by a separate mutex: each one checks its
//! preconditions, logs the mutation to the [`RecordStore`], and only then
//! takes the write lock to swap the in-memory entry. A failed store write
//! leaves the gallery untouched, readers only ever see whole records, and
//! no reader waits on a disk sync.

use crate::error::GalleryError;
use crate::model::{BlobRef, FaceRecord, RecordSummary};
use crate::store::{LogEntry, RecordStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of [`Gallery::upsert`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub record: Arc<FaceRecord>,
    /// The record this upsert replaced, if any. Its blob is now unreferenced.
    pub previous: Option<Arc<FaceRecord>>,
}

impl Upserted {
    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }
}

pub struct Gallery {
    records: RwLock<BTreeMap<String, Arc<FaceRecord>>>,
    /// Held for the whole of a mutation, store write included.
    writer: Mutex<()>,
    store: Arc<dyn RecordStore>,
    dimension: usize,
}

impl Gallery {
    /// Loads the gallery from `store`. Every embedding must have `dimension`
    /// components.
    pub fn open(store: Arc<dyn RecordStore>, dimension: usize) -> Result<Self, GalleryError> {
        let loaded = store.load()?;

        let mut records = BTreeMap::new();
        for record in loaded {
            check_dimension(dimension, &record.embedding)?;
            records.insert(record.identity.clone(), Arc::new(record));
        }

        let live = records.len();
        if store.entry_count() > 2 * live.max(1) {
            tracing::info!(
                "Gallery log holds {} entries for {} records, compacting",
                store.entry_count(),
                live
            );
            let snapshot: Vec<FaceRecord> = records.values().map(|r| (**r).clone()).collect();
            store.compact(&snapshot)?;
        }

        tracing::info!("Gallery opened with {} records (dim={})", live, dimension);
        Ok(Self {
            records: RwLock::new(records),
            writer: Mutex::new(()),
            store,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Inserts a record, or replaces the existing one for `identity` wholesale.
    pub fn upsert(
        &self,
        identity: &str,
        embedding: Vec<f32>,
        blob_ref: BlobRef,
        registered_at: DateTime<Utc>,
    ) -> Result<Upserted, GalleryError> {
        check_dimension(self.dimension, &embedding)?;

        let record = FaceRecord {
            identity: identity.to_string(),
            embedding,
            blob_ref,
            registered_at,
        };

        let _writer = self.writer.lock();
        self.store.append(&LogEntry::Upsert { record: record.clone() })?;

        let record = Arc::new(record);
        let previous = self.records.write().insert(identity.to_string(), record.clone());
        Ok(Upserted { record, previous })
    }

    pub fn get(&self, identity: &str) -> Result<Arc<FaceRecord>, GalleryError> {
        self.records
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| GalleryError::NotFound(identity.to_string()))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.read().contains_key(identity)
    }

    /// Removes and returns the record so the caller can release its blob.
    pub fn delete(&self, identity: &str) -> Result<Arc<FaceRecord>, GalleryError> {
        let _writer = self.writer.lock();
        if !self.contains(identity) {
            return Err(GalleryError::NotFound(identity.to_string()));
        }
        self.store.append(&LogEntry::Delete { identity: identity.to_string() })?;

        self.records
            .write()
            .remove(identity)
            .ok_or_else(|| GalleryError::NotFound(identity.to_string()))
    }

    /// Moves a record to a new identity. Never merges two identities.
    ///
    /// Renaming an identity to itself is a no-op that still requires the
    /// identity to exist.
    pub fn rename(&self, old: &str, new: &str) -> Result<Arc<FaceRecord>, GalleryError> {
        let _writer = self.writer.lock();
        let current = self.get(old)?;

        if old == new {
            return Ok(current);
        }
        if self.contains(new) {
            return Err(GalleryError::NameConflict(new.to_string()));
        }

        self.store.append(&LogEntry::Rename {
            from: old.to_string(),
            to: new.to_string(),
        })?;

        let mut renamed = (*current).clone();
        renamed.identity = new.to_string();
        let renamed = Arc::new(renamed);
        let mut records = self.records.write();
        records.remove(old);
        records.insert(new.to_string(), renamed.clone());
        Ok(renamed)
    }

    /// Points an existing record at a different blob, keeping everything else.
    pub fn set_blob_ref(
        &self,
        identity: &str,
        blob_ref: BlobRef,
    ) -> Result<Arc<FaceRecord>, GalleryError> {
        let _writer = self.writer.lock();
        let current = self.get(identity)?;

        let mut updated = (*current).clone();
        updated.blob_ref = blob_ref;
        self.store.append(&LogEntry::Upsert { record: updated.clone() })?;

        let updated = Arc::new(updated);
        self.records.write().insert(identity.to_string(), updated.clone());
        Ok(updated)
    }

    /// Metadata of every record, in identity order.
    pub fn list(&self) -> Vec<RecordSummary> {
        self.records.read().values().map(|r| r.summary()).collect()
    }

    pub fn identities(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.records.read().len()
    }

    /// Point-in-time snapshot for matching.
    pub fn all_records(&self) -> Vec<Arc<FaceRecord>> {
        self.records.read().values().cloned().collect()
    }

    /// Rewrites the backing store down to the live records.
    pub fn compact(&self) -> Result<(), GalleryError> {
        let _writer = self.writer.lock();
        let snapshot: Vec<FaceRecord> = self
            .records
            .read()
            .values()
            .map(|r| (**r).clone())
            .collect();
        self.store.compact(&snapshot)?;
        Ok(())
    }
}

fn check_dimension(expected: usize, embedding: &[f32]) -> Result<(), GalleryError> {
    if embedding.len() != expected {
        return Err(GalleryError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    /// Store that can be switched into failing every write.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    impl RecordStore for FlakyStore {
        fn load(&self) -> Result<Vec<FaceRecord>, StoreError> {
            self.inner.load()
        }
        fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.inner.append(entry)
        }
        fn compact(&self, records: &[FaceRecord]) -> Result<(), StoreError> {
            self.inner.compact(records)
        }
        fn entry_count(&self) -> usize {
            self.inner.entry_count()
        }
    }

    fn gallery() -> Gallery {
        Gallery::open(Arc::new(MemoryStore::new()), 2).unwrap()
    }

    fn put(g: &Gallery, identity: &str, v: [f32; 2]) -> Upserted {
        g.upsert(identity, v.to_vec(), BlobRef(format!("{identity}.jpg")), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_upsert_reports_fresh_insert_then_replacement() {
        let g = gallery();
        let first = put(&g, "Alice", [0.0, 0.0]);
        assert!(first.is_new());

        let second = g
            .upsert("Alice", vec![1.0, 1.0], BlobRef::from("Alice_2.jpg"), Utc::now())
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.previous.unwrap().blob_ref, BlobRef::from("Alice.jpg"));

        let stored = g.get("Alice").unwrap();
        assert_eq!(stored.embedding, vec![1.0, 1.0]);
        assert_eq!(stored.blob_ref, BlobRef::from("Alice_2.jpg"));
        assert_eq!(g.count(), 1);
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension() {
        let g = gallery();
        let err = g
            .upsert("Alice", vec![1.0, 2.0, 3.0], BlobRef::from("a.jpg"), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            GalleryError::DimensionMismatch { expected: 2, actual: 3 }
        ));
        assert_eq!(g.count(), 0);
    }

    #[test]
    fn test_get_and_delete() {
        let g = gallery();
        put(&g, "Alice", [0.0, 1.0]);

        assert!(matches!(g.get("Bob"), Err(GalleryError::NotFound(_))));
        let removed = g.delete("Alice").unwrap();
        assert_eq!(removed.identity, "Alice");
        assert!(!g.contains("Alice"));
        assert!(matches!(g.delete("Alice"), Err(GalleryError::NotFound(_))));
    }

    #[test]
    fn test_rename_moves_record() {
        let g = gallery();
        let original = put(&g, "Alice", [0.5, 0.5]).record;

        let renamed = g.rename("Alice", "Alicia").unwrap();
        assert_eq!(renamed.identity, "Alicia");
        assert_eq!(renamed.embedding, original.embedding);
        assert_eq!(renamed.blob_ref, original.blob_ref);
        assert_eq!(renamed.registered_at, original.registered_at);
        assert!(!g.contains("Alice"));
        assert_eq!(g.identities(), vec!["Alicia"]);
    }

    #[test]
    fn test_rename_conflict_leaves_both_unchanged() {
        let g = gallery();
        let a = put(&g, "A", [0.0, 0.0]).record;
        let b = put(&g, "B", [1.0, 1.0]).record;

        let err = g.rename("A", "B").unwrap_err();
        assert!(matches!(err, GalleryError::NameConflict(ref n) if n == "B"));
        assert_eq!(*g.get("A").unwrap(), *a);
        assert_eq!(*g.get("B").unwrap(), *b);
    }

    #[test]
    fn test_rename_to_self_and_missing() {
        let g = gallery();
        put(&g, "A", [0.0, 0.0]);
        assert_eq!(g.rename("A", "A").unwrap().identity, "A");
        assert!(matches!(g.rename("X", "Y"), Err(GalleryError::NotFound(_))));
    }

    #[test]
    fn test_set_blob_ref_keeps_embedding() {
        let g = gallery();
        let before = put(&g, "A", [0.25, 0.75]).record;
        let after = g.set_blob_ref("A", BlobRef::from("moved.jpg")).unwrap();
        assert_eq!(after.blob_ref, BlobRef::from("moved.jpg"));
        assert_eq!(after.embedding, before.embedding);
        assert_eq!(after.registered_at, before.registered_at);
    }

    #[test]
    fn test_store_failure_leaves_gallery_untouched() {
        let store = Arc::new(FlakyStore::default());
        let g = Gallery::open(store.clone(), 2).unwrap();
        put(&g, "A", [0.0, 0.0]);
        put(&g, "B", [1.0, 0.0]);

        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            g.upsert("C", vec![0.0, 1.0], BlobRef::from("c.jpg"), Utc::now()),
            Err(GalleryError::Store(_))
        ));
        assert!(g.delete("A").is_err());
        assert!(g.rename("B", "Z").is_err());
        assert!(g.set_blob_ref("A", BlobRef::from("x.jpg")).is_err());

        assert_eq!(g.identities(), vec!["A", "B"]);
        assert_eq!(g.get("A").unwrap().blob_ref, BlobRef::from("A.jpg"));
    }

    #[test]
    fn test_reopen_replays_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let g = Gallery::open(store.clone(), 2).unwrap();
            put(&g, "A", [0.0, 0.0]);
            put(&g, "B", [1.0, 0.0]);
            g.rename("B", "C").unwrap();
            g.delete("A").unwrap();
        }
        let g = Gallery::open(store, 2).unwrap();
        assert_eq!(g.identities(), vec!["C"]);
        assert_eq!(g.get("C").unwrap().embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_open_compacts_long_log() {
        let store = Arc::new(MemoryStore::new());
        {
            let g = Gallery::open(store.clone(), 2).unwrap();
            for i in 0..10 {
                put(&g, "A", [i as f32, 0.0]);
            }
        }
        assert_eq!(store.entry_count(), 10);
        let g = Gallery::open(store.clone(), 2).unwrap();
        assert_eq!(store.entry_count(), 1);
        assert_eq!(g.get("A").unwrap().embedding, vec![9.0, 0.0]);
    }

    #[test]
    fn test_open_rejects_mismatched_dimension() {
        let store = Arc::new(MemoryStore::new());
        {
            let g = Gallery::open(store.clone(), 2).unwrap();
            put(&g, "A", [0.0, 0.0]);
        }
        assert!(matches!(
            Gallery::open(store, 3),
            Err(GalleryError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_identities_stay_unique_under_mixed_operations() {
        let g = gallery();
        put(&g, "A", [0.0, 0.0]);
        put(&g, "B", [0.0, 1.0]);
        put(&g, "A", [1.0, 0.0]);
        let _ = g.rename("A", "B");
        g.rename("B", "C").unwrap();
        put(&g, "B", [2.0, 2.0]);
        let _ = g.rename("C", "B");
        g.delete("C").unwrap();
        put(&g, "C", [3.0, 3.0]);

        let ids = g.identities();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(g.count(), 3);
        for record in g.all_records() {
            assert_eq!(g.get(&record.identity).unwrap().identity, record.identity);
        }
    }

    #[test]
    fn test_concurrent_upserts_keep_one_record_per_identity() {
        let g = Arc::new(gallery());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let g = g.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("id-{}", i % 5);
                        let blob = BlobRef(format!("{t}-{i}"));
                        g.upsert(&name, vec![t as f32, i as f32], blob, Utc::now())
                            .unwrap();
                        let snapshot = g.all_records();
                        assert!(snapshot.iter().all(|r| r.embedding.len() == 2));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(g.count(), 5);
    }

    /// Store whose appends park until the test lets them through.
    struct GatedStore {
        inner: MemoryStore,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl RecordStore for GatedStore {
        fn load(&self) -> Result<Vec<FaceRecord>, StoreError> {
            self.inner.load()
        }
        fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
            let _ = self.started.lock().send(());
            let _ = self.release.lock().recv();
            self.inner.append(entry)
        }
        fn compact(&self, records: &[FaceRecord]) -> Result<(), StoreError> {
            self.inner.compact(records)
        }
        fn entry_count(&self) -> usize {
            self.inner.entry_count()
        }
    }

    #[test]
    fn test_readers_proceed_while_a_write_is_syncing() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = GatedStore {
            inner: MemoryStore::new(),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        };
        let g = Arc::new(Gallery::open(Arc::new(store), 2).unwrap());

        let writer = {
            let g = g.clone();
            std::thread::spawn(move || put(&g, "A", [0.0, 0.0]))
        };
        started_rx.recv().unwrap();

        assert_eq!(g.count(), 0);
        assert!(g.all_records().is_empty());
        assert!(g.list().is_empty());
        assert!(matches!(g.get("A"), Err(GalleryError::NotFound(_))));

        release_tx.send(()).unwrap();
        assert!(writer.join().unwrap().is_new());
        assert_eq!(g.count(), 1);
    }
}

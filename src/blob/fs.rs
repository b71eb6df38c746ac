use super::{blob_key, BlobStore};
use crate::error::BlobError;
use crate::model::BlobRef;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores photos as files in one directory. The blob ref is the file name.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!("Photo store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, blob: &BlobRef) -> Result<PathBuf, BlobError> {
        let name = blob.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(BlobError::NotFound(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, identity: &str, data: Bytes) -> Result<BlobRef, BlobError> {
        let key = blob_key(identity);
        let final_path = self.root.join(&key);
        let tmp_path = self.root.join(format!(".{key}.tmp"));

        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::debug!("Stored photo {} ({} bytes)", key, data.len());
        Ok(BlobRef(key))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Bytes, BlobError> {
        let path = self.path_of(blob)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(blob.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobError> {
        let path = self.path_of(blob)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(blob.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn encodes_identity(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path().join("photos")).await.unwrap();

        let r = store.put("Alice Smith", Bytes::from_static(b"\xff\xd8jpeg")).await.unwrap();
        assert!(r.as_str().starts_with("Alice_Smith_"));
        assert!(store.root().join(r.as_str()).exists());
        assert_eq!(store.get(&r).await.unwrap().as_ref(), b"\xff\xd8jpeg");

        store.delete(&r).await.unwrap();
        assert!(matches!(store.get(&r).await, Err(BlobError::NotFound(_))));
        assert!(matches!(store.delete(&r).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        store.put("Bob", Bytes::from_static(b"x")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".tmp"));
    }

    #[tokio::test]
    async fn test_put_accepts_long_identities() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        for identity in ["a".repeat(300), "顔認識".repeat(40), "é".repeat(200)] {
            let r = store.put(&identity, Bytes::from_static(b"x")).await.unwrap();
            assert!(r.as_str().len() < 255, "{}", r);
            assert_eq!(store.get(&r).await.unwrap().as_ref(), b"x");
            store.delete(&r).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejects_refs_outside_root() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get(&BlobRef::from("../secret")).await,
            Err(BlobError::NotFound(_))
        ));
        assert!(store.delete(&BlobRef::from(".hidden")).await.is_err());
    }
}

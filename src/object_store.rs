//! Object-store adapter.
//!
//! The service never interprets stored bytes on the read path; it only
//! needs head/get/put/delete and batch delete against opaque string keys.
//! The trait keeps the resolver and worker testable against an in-memory
//! backend, with the filesystem backend used behind a CDN in deployments.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Errors from the object-store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No object under the key.
    #[error("object `{0}` not found")]
    NotFound(String),
    /// A key that could escape the store root or is otherwise malformed.
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Headers attached to an uploaded rendition.
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// MIME type, sniffed from the rendered bytes.
    pub content_type: String,
    /// Cache policy served alongside the object.
    pub cache_control: String,
}

/// Minimal metadata returned by a head call.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
}

/// Blob store keyed by opaque strings.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Existence + size check without fetching the body.
    async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError>;

    /// Fetch the full object body.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Store an object, overwriting any previous version.
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<(), StoreError>;

    /// Remove an object. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove a batch of objects; fails on the first hard error.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Filesystem-backed store. Writes go through a temp file and an atomic
/// rename; content-type and cache headers are persisted in a sidecar so a
/// fronting web server can replay them.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        ensure_key_safe(key)?;
        Ok(self.root.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".meta");
        path.with_file_name(name)
    }
}

/// Reject keys that could traverse outside the store root.
fn ensure_key_safe(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains("..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(ObjectMeta { size: meta.len() }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        if let Err(err) = file.write_all(&data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::Io(err));
        }
        drop(file);
        fs::rename(&tmp, &path).await?;

        let sidecar = Self::sidecar_path(&path);
        let meta = format!(
            "content-type: {}\ncache-control: {}\n",
            opts.content_type, opts.cache_control
        );
        fs::write(&sidecar, meta).await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key, "object already absent");
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        let _ = fs::remove_file(Self::sidecar_path(&path)).await;
        Ok(())
    }
}

/// In-memory store for tests and development.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, (Bytes, PutOptions)>>,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without headers, as an uploaded original would be.
    pub fn insert(&self, key: &str, data: Bytes) {
        let opts = PutOptions {
            content_type: "application/octet-stream".into(),
            cache_control: String::new(),
        };
        self.objects
            .write()
            .unwrap()
            .insert(key.to_string(), (data, opts));
    }

    /// Headers recorded for a key, if present. Test hook.
    pub fn options(&self, key: &str) -> Option<PutOptions> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .map(|(_, opts)| opts.clone())
    }

    /// Number of stored objects. Test hook.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .map(|(data, _)| ObjectMeta {
                size: data.len() as u64,
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<(), StoreError> {
        ensure_key_safe(key)?;
        self.objects
            .write()
            .unwrap()
            .insert(key.to_string(), (data, opts));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok, assert_ok_eq};

    fn opts() -> PutOptions {
        PutOptions {
            content_type: "image/webp".into(),
            cache_control: "public, max-age=31536000, immutable".into(),
        }
    }

    #[test]
    fn key_safety() {
        assert_ok!(ensure_key_safe("pic.png"));
        assert_ok!(ensure_key_safe("pic___200x100.webp"));
        assert_err!(ensure_key_safe(""));
        assert_err!(ensure_key_safe("/abs.png"));
        assert_err!(ensure_key_safe("../up.png"));
        assert_err!(ensure_key_safe("a\\b.png"));
    }

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();

        assert_err!(store.head("pic.png").await);

        store
            .put("pic.png", Bytes::from_static(b"bytes"), opts())
            .await
            .unwrap();
        let meta = store.head("pic.png").await.unwrap();
        assert_eq!(meta.size, 5);
        assert_ok_eq!(store.get("pic.png").await, Bytes::from_static(b"bytes"));

        store.delete("pic.png").await.unwrap();
        assert_err!(store.get("pic.png").await);
        // Deleting again is a no-op.
        assert_ok!(store.delete("pic.png").await);
    }

    #[tokio::test]
    async fn memory_store_batch_delete() {
        let store = InMemoryObjectStore::new();
        store.insert("a.png", Bytes::from_static(b"a"));
        store.insert("b.png", Bytes::from_static(b"b"));
        store.insert("c.png", Bytes::from_static(b"c"));

        store
            .delete_many(&["a.png".into(), "b.png".into(), "missing.png".into()])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }
}

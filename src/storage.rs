//! File store for uploads and tool artifacts
//!
//! Files are addressed by opaque `file://<uuid>` references. Every read is
//! checked against the owner recorded at write time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const SCHEME: &str = "file://";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File {0} not found")]
    NotFound(FileRef),

    #[error("File {0} belongs to another user")]
    Forbidden(FileRef),

    #[error("File store I/O failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Opaque, access-controlled pointer to a stored file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    fn generate() -> Self {
        FileRef(format!("{SCHEME}{}", Uuid::new_v4()))
    }

    /// Parse a reference string, accepting only the `file://` scheme
    pub fn parse(raw: &str) -> Option<Self> {
        let id = raw.strip_prefix(SCHEME)?;
        Uuid::parse_str(id).ok()?;
        Some(FileRef(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn id(&self) -> &str {
        self.0.strip_prefix(SCHEME).unwrap_or(&self.0)
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored file's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub reference: FileRef,
    pub name: String,
    pub owner: String,
    pub size: usize,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(&self, owner: &str, name: &str, bytes: Vec<u8>) -> Result<StoredFile, StorageError>;

    /// Read a file on behalf of `requester`
    async fn get(&self, requester: &str, reference: &FileRef) -> Result<Vec<u8>, StorageError>;
}

#[async_trait]
impl<T: FileStore + ?Sized> FileStore for std::sync::Arc<T> {
    async fn put(&self, owner: &str, name: &str, bytes: Vec<u8>) -> Result<StoredFile, StorageError> {
        (**self).put(owner, name, bytes).await
    }

    async fn get(&self, requester: &str, reference: &FileRef) -> Result<Vec<u8>, StorageError> {
        (**self).get(requester, reference).await
    }
}

/// Process-local file store
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<FileRef, (StoredFile, Vec<u8>)>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn put(&self, owner: &str, name: &str, bytes: Vec<u8>) -> Result<StoredFile, StorageError> {
        let meta = StoredFile {
            reference: FileRef::generate(),
            name: name.to_string(),
            owner: owner.to_string(),
            size: bytes.len(),
        };
        self.files
            .lock()
            .map_err(|_| StorageError::Io("file table lock poisoned".to_string()))?
            .insert(meta.reference.clone(), (meta.clone(), bytes));
        Ok(meta)
    }

    async fn get(&self, requester: &str, reference: &FileRef) -> Result<Vec<u8>, StorageError> {
        let files = self
            .files
            .lock()
            .map_err(|_| StorageError::Io("file table lock poisoned".to_string()))?;
        let (meta, bytes) = files
            .get(reference)
            .ok_or_else(|| StorageError::NotFound(reference.clone()))?;
        if meta.owner != requester {
            return Err(StorageError::Forbidden(reference.clone()));
        }
        Ok(bytes.clone())
    }
}

/// File store backed by a directory: `<id>` holds the bytes and
/// `<id>.json` holds the metadata.
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn data_path(&self, reference: &FileRef) -> PathBuf {
        self.root.join(reference.id())
    }

    fn meta_path(&self, reference: &FileRef) -> PathBuf {
        self.root.join(format!("{}.json", reference.id()))
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn put(&self, owner: &str, name: &str, bytes: Vec<u8>) -> Result<StoredFile, StorageError> {
        let meta = StoredFile {
            reference: FileRef::generate(),
            name: name.to_string(),
            owner: owner.to_string(),
            size: bytes.len(),
        };
        tokio::fs::write(self.data_path(&meta.reference), &bytes).await?;
        let encoded =
            serde_json::to_vec(&meta).map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::write(self.meta_path(&meta.reference), encoded).await?;
        tracing::debug!(reference = %meta.reference, size = meta.size, "Stored file");
        Ok(meta)
    }

    async fn get(&self, requester: &str, reference: &FileRef) -> Result<Vec<u8>, StorageError> {
        let raw_meta = match tokio::fs::read(self.meta_path(reference)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(reference.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta: StoredFile =
            serde_json::from_slice(&raw_meta).map_err(|e| StorageError::Io(e.to_string()))?;
        if meta.owner != requester {
            return Err(StorageError::Forbidden(reference.clone()));
        }
        Ok(tokio::fs::read(self.data_path(reference)).await?)
    }
}

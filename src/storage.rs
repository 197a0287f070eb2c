//! Blob storage for encrypted document bytes.
//!
//! Stores only ever see ciphertext. The reference returned by `put` is what
//! gets persisted in `documents.storage_ref`.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use ipfs_api_backend_hyper::{IpfsApi, IpfsClient, TryFromUri};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage reference '{0}'")]
    InvalidRef(String),

    #[error("blob '{0}' not found")]
    NotFound(String),

    #[error("IPFS error: {0}")]
    Ipfs(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait(?Send)]
pub trait BlobStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn put(&self, data: Vec<u8>) -> Result<String>;

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>>;

    async fn delete(&self, storage_ref: &str) -> Result<()>;
}

pub fn from_settings(settings: &Settings) -> anyhow::Result<Box<dyn BlobStore>> {
    match settings.storage_backend.as_str() {
        "ipfs" => Ok(Box::new(IpfsBlobStore::new(&settings.ipfs_url)?)),
        _ => Ok(Box::new(LocalBlobStore::new(&settings.storage_dir)?)),
    }
}

/// Files named by UUID under a single directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(LocalBlobStore {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, storage_ref: &str) -> Result<PathBuf> {
        // Only canonical UUIDs name a blob; anything else could escape the root.
        let id = Uuid::parse_str(storage_ref)
            .map_err(|_| StorageError::InvalidRef(storage_ref.to_string()))?;
        Ok(self.root.join(id.hyphenated().to_string()))
    }
}

#[async_trait(?Send)]
impl BlobStore for LocalBlobStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(&self, data: Vec<u8>) -> Result<String> {
        let storage_ref = Uuid::new_v4().to_string();
        let path = self.path_for(&storage_ref)?;
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(%storage_ref, bytes = data.len(), "Stored blob");
        Ok(storage_ref)
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(storage_ref)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, storage_ref: &str) -> Result<()> {
        let path = self.path_for(storage_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Content-addressed storage on an IPFS node; the reference is the CID.
pub struct IpfsBlobStore {
    client: IpfsClient,
}

impl IpfsBlobStore {
    pub fn new(api_url: &str) -> anyhow::Result<Self> {
        let client = IpfsClient::from_str(api_url)
            .map_err(|e| anyhow::anyhow!("invalid IPFS_URL '{api_url}': {e}"))?;
        Ok(IpfsBlobStore { client })
    }
}

#[async_trait(?Send)]
impl BlobStore for IpfsBlobStore {
    fn backend(&self) -> &'static str {
        "ipfs"
    }

    async fn put(&self, data: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .add(Cursor::new(data))
            .await
            .map_err(|e| StorageError::Ipfs(e.to_string()))?;
        tracing::debug!(cid = %response.hash, "Stored blob on IPFS");
        Ok(response.hash)
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>> {
        self.client
            .cat(storage_ref)
            .map_ok(|chunk| chunk.to_vec())
            .try_concat()
            .await
            .map_err(|e| StorageError::Ipfs(e.to_string()))
    }

    async fn delete(&self, storage_ref: &str) -> Result<()> {
        // Unpinning lets the node garbage-collect the ciphertext.
        self.client
            .pin_rm(storage_ref, true)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Ipfs(e.to_string()))
    }
}

//! Filesystem-backed object store.
//!
//! Key-addressed blob storage with the same surface the archiver and the
//! read path would use against a remote bucket: a configured prefix joined
//! onto every key, create-if-missing bucket setup, and put/get carrying
//! content type and encoding. Blobs land under
//! `{root}/{bucket}/{key}`, written to a temp file and renamed into place
//! so readers never observe partial objects. Content metadata lives in a
//! `.meta.json` sidecar next to each blob.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use turnbus_core::error::{Classify, ErrorKind};

#[cfg(test)]
mod tests;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ObjectStoreError {
    #[error("bucket is required")]
    MissingBucket,

    #[error("key is required")]
    MissingKey,

    /// Keys must stay inside the bucket; absolute paths and `..` segments
    /// are refused.
    #[error("key escapes bucket: {0}")]
    KeyEscapesBucket(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Classify for ObjectStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingBucket | Self::MissingKey | Self::KeyEscapesBucket(_) => {
                ErrorKind::InvalidInput
            }
            Self::NotFound(_) => ErrorKind::InvalidInput,
            Self::Io(_) => ErrorKind::Transient,
            Self::Metadata(_) => ErrorKind::Poison,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ObjectMeta {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content_encoding: String,
}

/// A fetched object: an open handle on the blob plus its recorded content
/// type and encoding.
#[derive(Debug)]
pub struct ObjectBlob {
    pub body: File,
    pub content_type: String,
    pub content_encoding: String,
}

/// Bucket-scoped blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    bucket_dir: PathBuf,
    prefix: String,
}

impl FsObjectStore {
    /// Builds a store for `bucket` under `root`. The prefix is normalized
    /// to have no surrounding slashes; empty disables prefixing.
    pub fn new(root: &Path, bucket: &str, prefix: &str) -> Result<Self, ObjectStoreError> {
        if bucket.trim().is_empty() {
            return Err(ObjectStoreError::MissingBucket);
        }
        Ok(Self {
            bucket_dir: root.join(bucket),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Joins the configured prefix onto a path to form an object key.
    pub fn key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.prefix)
        }
    }

    /// Creates the bucket if missing. Tolerates a bucket that already
    /// exists.
    pub fn ensure_bucket(&self) -> Result<(), ObjectStoreError> {
        fs::create_dir_all(&self.bucket_dir)?;
        Ok(())
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.trim().is_empty() {
            return Err(ObjectStoreError::MissingKey);
        }
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ObjectStoreError::KeyEscapesBucket(key.to_string()));
        }
        Ok(self.bucket_dir.join(relative))
    }

    fn meta_path(path: &Path) -> PathBuf {
        Self::sibling(path, ".meta.json")
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        path.with_file_name(name)
    }

    /// Stores a blob under `key`, overwriting any previous object. The
    /// write is atomic: temp file, flush, fsync, rename.
    pub fn put_object(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
        content_encoding: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = Self::sibling(&path, ".tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            content_encoding: content_encoding.to_string(),
        };
        fs::write(Self::meta_path(&path), serde_json::to_vec(&meta)?)?;
        debug!(key, bytes = body.len(), "stored object");
        Ok(())
    }

    /// Opens the blob at `key` along with its recorded content metadata.
    /// Objects written without a sidecar read back with empty metadata.
    pub fn get_object(&self, key: &str) -> Result<ObjectBlob, ObjectStoreError> {
        let path = self.blob_path(key)?;
        let body = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let meta = match fs::read(Self::meta_path(&path)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ObjectMeta::default(),
            Err(err) => return Err(ObjectStoreError::Io(err)),
        };
        Ok(ObjectBlob {
            body,
            content_type: meta.content_type,
            content_encoding: meta.content_encoding,
        })
    }
}

//! Local file system buckets.
//!
//! Each bucket is a subdirectory of the configured root; object names are
//! paths relative to the bucket directory, `/`-separated.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::{BlobError, BlobStorageClient, ListOptions};

pub struct LocalBlobStorageClient {
    root: PathBuf,
}

impl LocalBlobStorageClient {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(|source| BlobError::Io {
            path: root.as_ref().display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, BlobError> {
        let rel = checked_relative(bucket)?;
        Ok(self.root.join(rel))
    }
}

fn checked_relative(name: &str) -> Result<PathBuf, BlobError> {
    let p = Path::new(name);
    if name.is_empty() || p.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(BlobError::InvalidName(name.to_string()));
    }
    Ok(p.to_path_buf())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io { path: path.display().to_string(), source }
}

#[async_trait::async_trait]
impl BlobStorageClient for LocalBlobStorageClient {
    async fn list(&self, bucket: &str, opts: &ListOptions) -> Result<Vec<String>, BlobError> {
        let dir = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&dir).await.map_err(io_err(&dir))? {
            return Err(BlobError::BucketNotFound { bucket: bucket.to_string() });
        }
        let mut out = Vec::new();
        let mut pending = vec![(dir.clone(), String::new())];
        while let Some((path, rel)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&path).await.map_err(io_err(&path))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_err(&path))? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let name = if rel.is_empty() { file_name } else { format!("{}/{}", rel, file_name) };
                let ft = entry.file_type().await.map_err(io_err(&path))?;
                if ft.is_dir() {
                    pending.push((entry.path(), name));
                } else if ft.is_file() && opts.matches(&name) {
                    out.push(name);
                }
            }
        }
        out.sort();
        debug!(bucket, count = out.len(), "local: list");
        Ok(out)
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, BlobError> {
        let path = self.bucket_dir(bucket)?.join(checked_relative(name)?);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::ObjectNotFound { bucket: bucket.to_string(), name: name.to_string() })
            }
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

//! Byte backend: where object and part content lives.
//!
//! The metadata core only ever stores the opaque reference returned by
//! [`ByteBackend::put`]. The filesystem implementation writes each blob to a
//! temp file while computing its MD5, fsyncs, and renames it into a
//! two-level shard directory beneath `base_path`.

use crate::errors::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Request/response body stream.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Result of a successful [`ByteBackend::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub reference: String,
    pub size: i64,
    /// Hex MD5 of the stored bytes.
    pub md5: String,
}

/// Inclusive byte range within a blob or object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Parse an HTTP `bytes=` range against an object of `size` bytes.
    ///
    /// Supports `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`. An end
    /// past the object is clamped; a start past the object is unsatisfiable.
    pub fn parse(spec: &str, size: u64) -> StorageResult<ByteRange> {
        let invalid = || StorageError::InvalidRange(spec.to_string());
        let body = spec.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        if body.contains(',') {
            return Err(StorageError::InvalidRange(format!(
                "multiple ranges are not supported: {}",
                spec
            )));
        }
        let (start, end) = body.split_once('-').ok_or_else(invalid)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            let suffix: u64 = end.parse().map_err(|_| invalid())?;
            if suffix == 0 || size == 0 {
                return Err(invalid());
            }
            let suffix = suffix.min(size);
            return Ok(ByteRange {
                start: size - suffix,
                end: size - 1,
            });
        }

        let start: u64 = start.parse().map_err(|_| invalid())?;
        if start >= size {
            return Err(invalid());
        }
        let end = if end.is_empty() {
            size - 1
        } else {
            let end: u64 = end.parse().map_err(|_| invalid())?;
            if end < start {
                return Err(invalid());
            }
            end.min(size - 1)
        };
        Ok(ByteRange { start, end })
    }
}

#[async_trait]
pub trait ByteBackend: Send + Sync + 'static {
    /// Store a new blob and return its reference, size and MD5.
    async fn put(&self, body: ByteStream) -> io::Result<StoredBlob>;

    /// Open a blob, optionally restricted to a range.
    async fn get(&self, reference: &str, range: Option<ByteRange>) -> io::Result<ByteStream>;

    /// Remove a blob. `Ok(false)` when it was already gone.
    async fn delete(&self, reference: &str) -> io::Result<bool>;

    /// Cheap write/read/delete probe used by readiness checks.
    async fn health_check(&self) -> io::Result<()>;
}

/// Filesystem byte backend rooted at `base_path`.
#[derive(Clone, Debug)]
pub struct FsBackend {
    base_path: PathBuf,
}

impl FsBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Generate two-level shard identifiers for a blob id.
    ///
    /// Uses MD5(id) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Resolve a reference to a path, refusing anything that could escape
    /// `base_path`.
    fn blob_path(&self, reference: &str) -> io::Result<PathBuf> {
        let valid = !reference.is_empty()
            && !reference.starts_with('/')
            && reference
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..")
            && !reference
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\');
        if !valid {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob reference `{}`", reference),
            ));
        }
        Ok(self.base_path.join(reference))
    }

    /// Recursively remove empty directories up to `base_path`.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ByteBackend for FsBackend {
    /// Stream a body to disk.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5 and size while streaming.
    /// - Atomically renames into final location.
    ///
    /// Ensures durable writes (fsync) and cleans up temp files on errors.
    async fn put(&self, mut body: ByteStream) -> io::Result<StoredBlob> {
        let id = Uuid::new_v4().simple().to_string();
        let (shard_a, shard_b) = Self::shards(&id);
        let reference = format!("{}/{}/{}", shard_a, shard_b, id);
        let file_path = self.blob_path(&reference)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", id));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(StoredBlob {
            reference,
            size,
            md5: format!("{:x}", digest.compute()),
        })
    }

    async fn get(&self, reference: &str, range: Option<ByteRange>) -> io::Result<ByteStream> {
        let path = self.blob_path(reference)?;
        let mut file = File::open(&path).await?;
        match range {
            None => Ok(ReaderStream::new(file).boxed()),
            Some(range) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                Ok(ReaderStream::new(file.take(range.len())).boxed())
            }
        }
    }

    async fn delete(&self, reference: &str) -> io::Result<bool> {
        let path = self.blob_path(reference)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(true)
    }

    /// Best-effort write/read/delete against `base_path`.
    async fn health_check(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(io::Error::other("file content mismatch"));
        }
        Ok(())
    }
}

/// Drain a stream into memory. Test helper and small-body convenience.
#[cfg(test)]
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Wrap an in-memory payload as a [`ByteStream`], split into `chunk` sized pieces.
#[cfg(test)]
pub fn stream_of(data: &[u8], chunk: usize) -> ByteStream {
    let pieces: Vec<io::Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(pieces).boxed()
}

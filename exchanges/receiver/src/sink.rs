//! Terminal destinations for received bytes.
//!
//! A [`Sink`] is the capability set the protocol core needs: ordered
//! writes, an abort that discards partial bytes, and a close that finalizes
//! the destination. Which implementation backs a given file is decided by a
//! [`SinkProvider`] at accept-time; the protocol core never branches on it.
//!
//! Three implementations cover the policy spectrum:
//! - [`FileSink`]: a seekable file on disk, the only kind that supports
//!   mid-file resume.
//! - [`StreamSink`]: any `AsyncWrite`; O(1) memory, no seek.
//! - [`BlobSink`]: in-memory accumulation, materialised at close.

use std::{io, path::PathBuf, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use aerodropx_common::manifest::FileEntry;

/// A destination for one file's bytes.
///
/// Writes arrive strictly in receive order (the session serialises them
/// through a single write queue). Exactly one of `abort` or `close` is
/// called, last.
#[async_trait]
pub trait Sink: Send {
    /// Appends a batch of bytes.
    async fn write(&mut self, batch: Bytes) -> io::Result<()>;

    /// Discards the partially-written file.
    async fn abort(&mut self) -> io::Result<()>;

    /// Flushes and finalizes the destination.
    async fn close(&mut self) -> io::Result<()>;

    /// Whether the destination supports mid-file resume.
    fn seekable(&self) -> bool {
        false
    }
}

/// Chooses and opens a sink per file.
///
/// `offset` is non-zero only when resuming the partially-received file into
/// a seekable destination; the provider must position the sink so the next
/// write lands at `offset`.
#[async_trait]
pub trait SinkProvider: Send + Sync {
    async fn open(
        &self,
        file_index: usize,
        entry: &FileEntry,
        offset: u64,
    ) -> io::Result<Box<dyn Sink>>;
}

/// Seekable sink writing to a file on disk.
pub struct FileSink {
    file: Option<tokio::fs::File>,
    path: PathBuf,
}

impl FileSink {
    /// Creates (or, for `offset > 0`, reopens) the file at `path`,
    /// truncates it to `offset`, and positions the cursor there.
    pub async fn create(path: PathBuf, offset: u64) -> io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.set_len(offset).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        Ok(Self {
            file: Some(file),
            path,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, batch: Bytes) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(&batch).await,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink already finalized",
            )),
        }
    }

    async fn abort(&mut self) -> io::Result<()> {
        debug!(path = %self.path.display(), "aborting file sink");
        self.file = None;
        tokio::fs::remove_file(&self.path).await
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => {
                file.flush().await?;
                file.sync_all().await
            }
            None => Ok(()),
        }
    }

    fn seekable(&self) -> bool {
        true
    }
}

/// Non-seekable sink over any async writer (a pipe, a download stream).
pub struct StreamSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl StreamSink {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Sink for StreamSink {
    async fn write(&mut self, batch: Bytes) -> io::Result<()> {
        self.writer.write_all(&batch).await
    }

    async fn abort(&mut self) -> io::Result<()> {
        // Bytes already written cannot be unsent; shutting down signals the
        // consumer that the stream is incomplete.
        self.writer.shutdown().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

/// In-memory sink; the accumulated bytes are materialised at close.
pub struct BlobSink {
    buffer: Vec<u8>,
    file_index: usize,
    blobs: Arc<Mutex<BTreeMap<usize, Vec<u8>>>>,
}

#[async_trait]
impl Sink for BlobSink {
    async fn write(&mut self, batch: Bytes) -> io::Result<()> {
        self.buffer.extend_from_slice(&batch);
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let blob = std::mem::take(&mut self.buffer);
        self.blobs.lock().unwrap().insert(self.file_index, blob);
        Ok(())
    }
}

/// Provider materialising every file as an in-memory blob.
///
/// Blobs become visible in [`BlobSinkProvider::blobs`] only at file
/// completion, never partially.
#[derive(Default)]
pub struct BlobSinkProvider {
    blobs: Arc<Mutex<BTreeMap<usize, Vec<u8>>>>,
}

impl BlobSinkProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed blobs by file index.
    pub fn blobs(&self) -> Arc<Mutex<BTreeMap<usize, Vec<u8>>>> {
        self.blobs.clone()
    }

    /// Takes a completed blob, if the file finished.
    pub fn take_blob(&self, file_index: usize) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().remove(&file_index)
    }
}

#[async_trait]
impl SinkProvider for BlobSinkProvider {
    async fn open(
        &self,
        file_index: usize,
        _entry: &FileEntry,
        offset: u64,
    ) -> io::Result<Box<dyn Sink>> {
        if offset != 0 {
            // A blob accumulates from scratch; resuming mid-file would
            // fabricate the missing prefix.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "in-memory sink cannot resume mid-file",
            ));
        }
        Ok(Box::new(BlobSink {
            buffer: Vec::new(),
            file_index,
            blobs: self.blobs.clone(),
        }))
    }
}

/// Provider writing each file under a root directory, preserving the
/// manifest's relative paths.
pub struct DiskSinkProvider {
    root: PathBuf,
}

impl DiskSinkProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a manifest path under the root, refusing traversal.
    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        if relative.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty manifest path",
            ));
        }
        let mut path = self.root.clone();
        for part in relative.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsafe manifest path: {relative}"),
                ));
            }
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl SinkProvider for DiskSinkProvider {
    async fn open(
        &self,
        _file_index: usize,
        entry: &FileEntry,
        offset: u64,
    ) -> io::Result<Box<dyn Sink>> {
        let path = self.resolve(&entry.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Box::new(FileSink::create(path, offset).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry::new(path, size, "", 1_700_000_000_000)
    }

    #[tokio::test]
    async fn file_sink_writes_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::create(path.clone(), 0).await.unwrap();
        assert!(sink.seekable());
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"stale tail")).await.unwrap();
        sink.close().await.unwrap();

        // Reopen at an offset: the tail is truncated and overwritten.
        let mut sink = FileSink::create(path.clone(), 6).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn file_sink_abort_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");

        let mut sink = FileSink::create(path.clone(), 0).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn blob_sink_materialises_only_at_close() {
        let provider = BlobSinkProvider::new();
        let mut sink = provider
            .open(0, &entry("a.txt", 5), 0)
            .await
            .unwrap();

        sink.write(Bytes::from_static(b"he")).await.unwrap();
        sink.write(Bytes::from_static(b"llo")).await.unwrap();
        assert!(provider.take_blob(0).is_none());

        sink.close().await.unwrap();
        assert_eq!(provider.take_blob(0).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn aborted_blob_is_never_materialised() {
        let provider = BlobSinkProvider::new();
        let mut sink = provider
            .open(0, &entry("a.txt", 5), 0)
            .await
            .unwrap();
        sink.write(Bytes::from_static(b"junk")).await.unwrap();
        sink.abort().await.unwrap();
        sink.close().await.unwrap();

        // Close after abort materialises an empty residue at most.
        assert!(
            provider
                .take_blob(0)
                .map(|b| b.is_empty())
                .unwrap_or(true)
        );
    }

    #[tokio::test]
    async fn blob_sink_refuses_a_resume_offset() {
        let provider = BlobSinkProvider::new();
        assert!(provider.open(0, &entry("a.txt", 5), 10).await.is_err());
    }

    #[tokio::test]
    async fn disk_provider_preserves_directory_structure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiskSinkProvider::new(dir.path());

        let mut sink = provider
            .open(0, &entry("docs/deep/note.txt", 4), 0)
            .await
            .unwrap();
        sink.write(Bytes::from_static(b"text")).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("docs/deep/note.txt")).unwrap(),
            b"text"
        );
    }

    #[tokio::test]
    async fn disk_provider_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DiskSinkProvider::new(dir.path());

        for bad in ["../escape.txt", "a/../../b", "/abs.txt", "a//b"] {
            assert!(
                provider.open(0, &entry(bad, 1), 0).await.is_err(),
                "path {bad} should be refused"
            );
        }
    }
}

//! Filesystem-backed byte source.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::Mutex,
    time::UNIX_EPOCH,
};

use crate::{FileData, SourceFile};

/// A [`FileData`] implementation reading from a file on disk.
///
/// The open file handle and its cursor live behind a `Mutex`, so a single
/// `DiskFileData` can be shared across tasks. Reads are sequential; `seek`
/// repositions the shared cursor.
pub struct DiskFileData {
    file: Mutex<File>,
    len: u64,
}

impl DiskFileData {
    /// Opens the file at `path` for reading and captures its length.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl FileData for DiskFileData {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, size: u64) -> Vec<u8> {
        let mut file = self.file.lock().unwrap();
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(_) => break,
            }
        }
        buffer.truncate(filled);
        buffer
    }

    fn seek(&self, offset: u64) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl SourceFile {
    /// Builds a `SourceFile` from a file on disk.
    ///
    /// `relative_path` is the forward-slash path presented to the receiver;
    /// `disk_path` is where the bytes live locally. The modification time is
    /// captured from filesystem metadata, and `mime` is left empty.
    pub fn from_disk(
        relative_path: impl Into<String>,
        disk_path: impl AsRef<Path>,
    ) -> std::io::Result<Self> {
        let disk_path = disk_path.as_ref();
        let modified_at = std::fs::metadata(disk_path)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(Self {
            path: relative_path.into(),
            mime: String::new(),
            modified_at,
            data: std::sync::Arc::new(DiskFileData::open(disk_path)?),
        })
    }
}

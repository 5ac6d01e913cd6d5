//! An outgoing file: transfer metadata plus a `FileData` byte source.

use std::sync::Arc;

use crate::FileData;

/// A file offered for transfer, backed by a [`FileData`] source.
///
/// Cloning a `SourceFile` is cheap; it clones the internal `Arc` to the
/// underlying byte source.
///
/// The custom `Debug` implementation omits the `data` field to avoid large
/// or misleading output.
#[derive(Clone)]
pub struct SourceFile {
    /// Relative, forward-slash-separated path. Directory structure of a
    /// multi-file transfer is preserved through this field.
    pub path: String,

    /// MIME type of the content. May be empty when unknown.
    pub mime: String,

    /// Last-modification time, milliseconds since the Unix epoch.
    pub modified_at: i64,

    /// Thread-safe, read-only byte source for the file's contents.
    pub data: Arc<dyn FileData>,
}

impl SourceFile {
    /// Total size of the file in bytes, as reported by the byte source.
    pub fn size(&self) -> u64 {
        self.data.len()
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("path", &self.path)
            .field("mime", &self.mime)
            .field("modified_at", &self.modified_at)
            .field("size", &self.size())
            .finish()
    }
}

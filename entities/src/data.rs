//! Core abstraction for byte-oriented, read-only sources.
//!
//! `FileData` models a thread-safe, sequential source of bytes consumed in
//! chunks by the transfer pump. Reads advance an internal cursor; `seek`
//! repositions it so a transfer can restart mid-file.
//!
//! Concurrency notes:
//! - All methods take `&self` and the trait is `Send + Sync`, so implementors
//!   must synchronize their cursor internally (typically a `Mutex`).

/// A thread-safe, seekable, sequential source of bytes.
///
/// Contract:
/// - `len()` returns the total length of the underlying data in bytes and
///   must not change over the lifetime of the object.
/// - `read_chunk(size)` reads up to `size` bytes from the current position,
///   advancing the cursor. An empty vector signals end-of-data.
/// - `seek(offset)` repositions the cursor to an absolute byte offset.
pub trait FileData: Send + Sync {
    /// Total length of the data in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `size` bytes from the current position.
    ///
    /// May return fewer bytes if fewer remain, and an empty vector at
    /// end-of-data. Calling with `size == 0` returns an empty vector.
    fn read_chunk(&self, size: u64) -> Vec<u8>;

    /// Repositions the cursor to an absolute byte offset.
    ///
    /// Seeking past the end is not an error; the next `read_chunk` simply
    /// returns an empty vector.
    fn seek(&self, offset: u64) -> std::io::Result<()>;
}

//! Byte-source models for outgoing transfers.
//!
//! This crate provides:
//! - `FileData`: a trait for thread-safe, seekable, read-only byte sources.
//! - `SourceFile`: a lightweight pairing of transfer metadata (relative path,
//!   MIME type, modification time) with an `Arc<dyn FileData>`.
//! - `DiskFileData`: a `std::fs`-backed implementation.
//!
//! Higher layers turn a `SourceFile` into the wire-level manifest entry; this
//! crate deliberately knows nothing about the wire.

mod data;
mod disk;
mod file;

/// Re-export of the core byte-source trait.
pub use data::FileData;
/// Re-export of the filesystem-backed byte source.
pub use disk::DiskFileData;
/// Re-export of the outgoing-file model.
pub use file::SourceFile;

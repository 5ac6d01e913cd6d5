//! The file manifest exchanged at session start, and the rules deciding
//! whether a retained manifest makes a reconnect resumable.

use serde::{Deserialize, Serialize};

/// Immutable per-file descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative, forward-slash-separated path; preserves directory structure.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type; may be empty.
    pub mime: String,
    /// Last modification time, milliseconds since the Unix epoch.
    pub modified_at: i64,
    /// Short opaque token derived from the fields above, used to decide
    /// resume eligibility. May be empty when a peer did not compute one.
    #[serde(default)]
    pub fingerprint: String,
}

impl FileEntry {
    /// Builds an entry, deriving the fingerprint from the other fields.
    pub fn new(
        path: impl Into<String>,
        size: u64,
        mime: impl Into<String>,
        modified_at: i64,
    ) -> Self {
        let path = path.into();
        let mime = mime.into();
        let fingerprint = fingerprint(&path, size, modified_at, &mime);
        Self {
            path,
            size,
            mime,
            modified_at,
            fingerprint,
        }
    }

    /// Whether two entries describe the same file for resume purposes.
    ///
    /// Fingerprints are compared when both sides have one; otherwise the
    /// comparison falls back to `(path, size)`.
    pub fn matches(&self, other: &FileEntry) -> bool {
        if !self.fingerprint.is_empty() && !other.fingerprint.is_empty() {
            self.fingerprint == other.fingerprint
        } else {
            self.path == other.path && self.size == other.size
        }
    }
}

/// Collision-tolerant token over the identifying fields of a file.
pub fn fingerprint(path: &str, size: u64, modified_at: i64, mime: &str) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(&size.to_be_bytes());
    hasher.update(&modified_at.to_be_bytes());
    hasher.update(mime.as_bytes());
    format!("{:08x}", hasher.finalize())
}

/// Session-level constraints carried inside the manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Rendezvous deadline, milliseconds since the Unix epoch. Enforced only
    /// by the rendezvous holder at open-time.
    pub expires_at: Option<i64>,
}

/// Ordered file list sent exactly once per session, before any bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub files: Vec<FileEntry>,
    /// Sum of all file sizes; informational.
    pub total_size: u64,
    pub constraints: Constraints,
}

impl TransferManifest {
    /// Builds a manifest, computing `total_size` from the entries.
    pub fn new(files: Vec<FileEntry>, expires_at: Option<i64>) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            files,
            total_size,
            constraints: Constraints { expires_at },
        }
    }

    /// Whether a transfer of `prior` can be resumed under this manifest:
    /// same total size, same file count, and every index matching per
    /// [`FileEntry::matches`].
    pub fn is_resumable_from(&self, prior: &TransferManifest) -> bool {
        self.total_size == prior.total_size
            && self.files.len() == prior.files.len()
            && self
                .files
                .iter()
                .zip(prior.files.iter())
                .all(|(a, b)| a.matches(b))
    }

    /// Whether the rendezvous deadline has passed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.constraints.expires_at, Some(deadline) if now_ms >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry::new(path, size, "", 1_700_000_000_000)
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = fingerprint("a/b.txt", 10, 1000, "text/plain");
        assert_eq!(a, fingerprint("a/b.txt", 10, 1000, "text/plain"));
        assert_ne!(a, fingerprint("a/b.txt", 11, 1000, "text/plain"));
        assert_ne!(a, fingerprint("a/c.txt", 10, 1000, "text/plain"));
        assert_ne!(a, fingerprint("a/b.txt", 10, 1001, "text/plain"));
    }

    #[test]
    fn total_size_is_computed() {
        let manifest = TransferManifest::new(
            vec![entry("a", 100), entry("b", 0), entry("c", 500_000)],
            None,
        );
        assert_eq!(manifest.total_size, 500_100);
    }

    #[test]
    fn identical_manifests_are_resumable() {
        let m1 = TransferManifest::new(vec![entry("a", 100), entry("b", 5)], None);
        let m2 = m1.clone();
        assert!(m2.is_resumable_from(&m1));
    }

    #[test]
    fn changed_file_breaks_resume() {
        let m1 = TransferManifest::new(vec![entry("a", 100), entry("b", 5)], None);
        let mut changed = m1.clone();
        changed.files[1] = FileEntry::new("b", 5, "", 1_700_000_099_000);
        assert!(!changed.is_resumable_from(&m1));
    }

    #[test]
    fn missing_fingerprint_falls_back_to_path_and_size() {
        let m1 = TransferManifest::new(vec![entry("a", 100)], None);
        let mut bare = m1.clone();
        bare.files[0].fingerprint = String::new();
        // Different mtime would change the fingerprint, but the fallback
        // comparison only sees (path, size).
        bare.files[0].modified_at = 42;
        assert!(bare.is_resumable_from(&m1));
    }

    #[test]
    fn file_count_mismatch_breaks_resume() {
        let m1 = TransferManifest::new(vec![entry("a", 100)], None);
        let m2 = TransferManifest::new(
            vec![entry("a", 50), entry("a2", 50)],
            None,
        );
        assert!(!m2.is_resumable_from(&m1));
    }

    #[test]
    fn expiry_is_a_closed_deadline() {
        let manifest = TransferManifest::new(vec![], Some(10_000));
        assert!(!manifest.is_expired_at(9_999));
        assert!(manifest.is_expired_at(10_000));
        assert!(!TransferManifest::new(vec![], None).is_expired_at(i64::MAX));
    }
}

//! Transfer tunables.
//!
//! The chunk size and flow-control watermarks are picked per network class:
//! large chunks and deep buffers amortise per-frame overhead on fast local
//! paths, small ones shorten blocking units on slow paths. The low watermark
//! is deliberately non-zero so the channel never starves between refills.

use std::time::Duration;

/// Coarse classification of the negotiated path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkClass {
    /// The negotiated candidate is host-local.
    Lan,
    /// Everything else.
    Wan,
}

/// Tunable settings for a transfer session.
///
/// Use [`TransferConfig::lan`] or [`TransferConfig::wan`] and override fields
/// as needed. The default is the WAN preset.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferConfig {
    /// Size of each binary frame read from the source.
    pub chunk_size: u64,
    /// The producer stops issuing frames once the channel's buffered amount
    /// reaches this bound.
    pub high_watermark: u64,
    /// The producer resumes once the buffered amount has drained to this
    /// bound.
    pub low_watermark: u64,
    /// Receiver-side coalescing threshold: incoming frames are batched up to
    /// this many bytes before a single write is queued to the sink.
    pub write_batch: u64,
    /// Budget from the first dial attempt to the first received control
    /// frame.
    pub connect_timeout: Duration,
    /// Peer-unavailable dial attempts before giving up.
    pub dial_attempts: u32,
    /// Delay between dial attempts.
    pub dial_retry_delay: Duration,
    /// The producer yields to the runtime every this many chunks so control
    /// frames interleave.
    pub yield_every_chunks: u32,
}

impl TransferConfig {
    /// Preset for host-local paths: 256 KiB chunks, 8 MiB / 2 MiB watermarks.
    pub fn lan() -> Self {
        Self {
            chunk_size: 256 * 1024,
            high_watermark: 8 * 1024 * 1024,
            low_watermark: 2 * 1024 * 1024,
            ..Self::wan()
        }
    }

    /// Preset for everything else: 64 KiB chunks, 512 KiB / 128 KiB
    /// watermarks.
    pub fn wan() -> Self {
        Self {
            chunk_size: 64 * 1024,
            high_watermark: 512 * 1024,
            low_watermark: 128 * 1024,
            write_batch: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(15),
            dial_attempts: 3,
            dial_retry_delay: Duration::from_secs(2),
            yield_every_chunks: 32,
        }
    }

    /// Preset matching a network class.
    pub fn for_class(class: NetworkClass) -> Self {
        match class {
            NetworkClass::Lan => Self::lan(),
            NetworkClass::Wan => Self::wan(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::wan()
    }
}

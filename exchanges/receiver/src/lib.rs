//! AeroDrop receiver crate.
//!
//! This crate provides the API surface for dialing a rendezvous code and
//! receiving a transfer. It exposes:
//! - `ReceiveFilesRequest`: the code, tunables, and any state retained from
//!   a dropped session (for resume).
//! - A `receive_files` function that dials with the retry/timeout policy
//!   and returns once the sender's manifest arrived.
//! - A `ReceiveFilesBubble` to accept (with a sink of your choosing),
//!   reject, cancel, and observe the session.
//! - The `Sink` abstraction with disk-backed, stream-backed, and in-memory
//!   implementations.
//!
//! Flow:
//! 1. Call `receive_files` to obtain a bubble in the negotiating phase.
//! 2. Inspect `bubble.manifest()` (and `bubble.resume_offer()` after a
//!    reconnect).
//! 3. Call `bubble.accept(provider)` with a [`SinkProvider`]; the session
//!    streams files through a serial write queue into per-file sinks.
//! 4. Await `bubble.await_terminal()`.

mod progress;
mod receive_files;
mod sink;
mod write_queue;

use std::{collections::BTreeSet, sync::Arc};

use aerodropx_common::{
    config::TransferConfig, host::HostHooks, manifest::TransferManifest,
};

pub use progress::ReceiveProgressEvent;
pub use receive_files::{
    ReceiveConnectingEvent, ReceiveFilesBubble, ReceiveFilesSubscriber,
    receive_files,
};
pub use sink::{
    BlobSinkProvider, DiskSinkProvider, FileSink, Sink, SinkProvider,
    StreamSink,
};

/// Parameters required to start a receive session.
pub struct ReceiveFilesRequest {
    /// Rendezvous code to dial.
    pub code: String,
    /// Transfer tunables. If `None`, a preset matching the channel's
    /// network class is used.
    pub config: Option<TransferConfig>,
    /// State retained from a dropped session. When the incoming manifest
    /// matches it, accepting resumes instead of restarting.
    pub retained: Option<RetainedState>,
    /// Host-environment hooks. If `None`, no-op hooks are used.
    pub hooks: Option<Arc<dyn HostHooks>>,
}

/// Receiver-side state surviving a disconnect within the process.
///
/// Holds everything needed to drive a `RESUME` on the next connection: the
/// manifest it was received under, the indices already completed, and, when
/// the partially-received file went to a seekable sink, the byte offset
/// safely on disk.
#[derive(Clone, Debug)]
pub struct RetainedState {
    pub manifest: TransferManifest,
    pub completed: BTreeSet<usize>,
    /// `(file_index, byte_offset)` of the partial file, seekable sinks only.
    pub partial: Option<(usize, u64)>,
}

impl RetainedState {
    pub(crate) fn fresh(manifest: TransferManifest) -> Self {
        Self {
            manifest,
            completed: BTreeSet::new(),
            partial: None,
        }
    }

    /// The `(file_index, byte_offset)` a `RESUME` would request: the lowest
    /// incomplete index, and the retained offset when it belongs to that
    /// index.
    pub fn resume_seed(&self) -> (usize, u64) {
        let file_index = (0..self.manifest.files.len())
            .find(|i| !self.completed.contains(i))
            .unwrap_or(self.manifest.files.len());
        let byte_offset = match self.partial {
            Some((index, offset)) if index == file_index => offset,
            _ => 0,
        };
        (file_index, byte_offset)
    }

    /// Bytes already accounted for by completed files and the partial
    /// offset; credited to the progress counter on resume.
    pub(crate) fn delivered_bytes(&self) -> u64 {
        let completed: u64 = self
            .completed
            .iter()
            .filter_map(|&i| self.manifest.files.get(i))
            .map(|f| f.size)
            .sum();
        completed + self.partial.map(|(_, offset)| offset).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerodropx_common::manifest::{FileEntry, TransferManifest};

    fn manifest() -> TransferManifest {
        TransferManifest::new(
            vec![
                FileEntry::new("a", 100, "", 1),
                FileEntry::new("b", 200, "", 1),
                FileEntry::new("c", 300, "", 1),
            ],
            None,
        )
    }

    #[test]
    fn resume_seed_is_the_lowest_incomplete_index() {
        let mut state = RetainedState::fresh(manifest());
        assert_eq!(state.resume_seed(), (0, 0));

        state.completed.insert(0);
        assert_eq!(state.resume_seed(), (1, 0));

        state.partial = Some((1, 50));
        assert_eq!(state.resume_seed(), (1, 50));
        assert_eq!(state.delivered_bytes(), 150);

        // A stale partial for an already-completed file is ignored.
        state.completed.insert(1);
        assert_eq!(state.resume_seed(), (2, 0));

        state.completed.insert(2);
        assert_eq!(state.resume_seed(), (3, 0));
    }
}

//! AeroDrop sender crate.
//!
//! This crate provides the high-level API to share one or more files with a
//! peer that dials a short rendezvous code. It exposes:
//! - `ShareFilesRequest`: the files, tunables, code, and time-to-live.
//! - A `share_files` function that registers the code at a rendezvous
//!   broker and hosts the transfer protocol.
//! - A `ShareFilesBubble` handle that lets you observe progress, subscribe
//!   to events, and stop sharing.
//!
//! Typical usage:
//! - Build `SourceFile` values (e.g. via `SourceFile::from_disk`).
//! - Call `share_files` with a rendezvous implementation to start hosting.
//! - Hand the returned code to the receiving side out of band.
//!
//! The protocol itself (manifest exchange, accept/resume negotiation, the
//! flow-controlled producer pump) lives in the `share_files` module.

mod share_files;

use std::{sync::Arc, time::Duration};

use aerodrop_entities::SourceFile;
use aerodropx_common::{config::TransferConfig, host::HostHooks};

pub use share_files::{
    ShareConnectingEvent, ShareFilesBubble, ShareFilesSubscriber,
    ShareSendingEvent, share_files,
};

/// All inputs required to start sharing files.
///
/// Construct this and pass it to [`share_files`].
pub struct ShareFilesRequest {
    /// Files to transfer, in manifest order.
    pub files: Vec<SourceFile>,
    /// Transfer tunables. If `None`, a preset matching the channel's
    /// network class is used.
    pub config: Option<TransferConfig>,
    /// Rendezvous code to register. Four decimal digits; if `None`, a
    /// random code is generated.
    pub code: Option<String>,
    /// Time-to-live for the rendezvous. A dial arriving after the deadline
    /// is rejected as expired.
    pub ttl: Option<Duration>,
    /// Host-environment hooks. If `None`, no-op hooks are used.
    pub hooks: Option<Arc<dyn HostHooks>>,
}

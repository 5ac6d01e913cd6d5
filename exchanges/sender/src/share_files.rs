//! High-level share operation.
//!
//! This module contains the user-facing entry point `share_files` and the
//! `ShareFilesBubble` handle returned to the caller. The bubble exposes the
//! rendezvous code, supports stopping, phase queries, and observer
//! subscription for progress updates. The hosting loop lives here; the
//! per-connection protocol lives in `handler`, the producer in `pump`.

mod handler;
mod pump;

use std::sync::Arc;

use aerodropx_common::{
    channel::{Channel, CloseReason, Listener, Rendezvous},
    error::TransferError,
    frames::{ControlFrame, RejectReason},
    host::noop_hooks,
    manifest::{FileEntry, TransferManifest},
    phase::Phase,
};
use chrono::{DateTime, Utc};
use handler::{SessionEnd, ShareFilesHandler, run_session};
use rand::Rng;
use tokio::sync::watch;
use tracing::info;

use crate::ShareFilesRequest;

pub use handler::{
    ShareConnectingEvent, ShareFilesSubscriber, ShareSendingEvent,
};

/// A hosted share session.
///
/// Returned by [`share_files`]. It exposes the rendezvous code the receiver
/// must dial, the manifest being offered, and the session phase. You can
/// subscribe to progress updates and stop sharing at any time.
pub struct ShareFilesBubble {
    code: String,
    handler: Arc<ShareFilesHandler>,
    created_at: DateTime<Utc>,
}

impl ShareFilesBubble {
    /// The rendezvous code receivers dial.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The manifest offered to peers.
    pub fn manifest(&self) -> TransferManifest {
        self.handler.manifest().clone()
    }

    /// Current session phase.
    pub fn phase(&self) -> Phase {
        self.handler.phase()
    }

    /// A watch on the session phase.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.handler.phase_watch()
    }

    /// Rendezvous deadline, if one was requested.
    pub fn expires_at(&self) -> Option<i64> {
        self.handler.manifest().constraints.expires_at
    }

    /// RFC3339 timestamp marking when this bubble was created.
    pub fn created_at(&self) -> String {
        self.created_at.to_rfc3339()
    }

    /// Returns `true` once the session has reached a terminal phase.
    pub fn is_finished(&self) -> bool {
        self.handler.phase().is_terminal()
    }

    /// Stops sharing: invalidates the producer, notifies a connected peer
    /// best-effort, and withdraws the rendezvous code.
    pub fn stop_sharing(&self) {
        info!(code = %self.code, "stop sharing requested");
        self.handler.request_stop();
    }

    /// Waits until the session reaches a terminal phase and returns it.
    pub async fn await_terminal(&self) -> Phase {
        let mut rx = self.handler.phase_watch();
        loop {
            let phase = rx.borrow_and_update().clone();
            if phase.is_terminal() {
                return phase;
            }
            if rx.changed().await.is_err() {
                return self.handler.phase();
            }
        }
    }

    /// Register a subscriber for progress and phase notifications.
    ///
    /// A subscriber with the same ID replaces the previous one.
    pub fn subscribe(&self, subscriber: Arc<dyn ShareFilesSubscriber>) {
        self.handler.subscribe(subscriber);
    }

    /// Remove a previously registered subscriber.
    pub fn unsubscribe(&self, subscriber: Arc<dyn ShareFilesSubscriber>) {
        self.handler.unsubscribe(subscriber);
    }
}

/// Starts sharing files under a rendezvous code.
///
/// The function:
/// - Builds the manifest (fingerprints included) from the request's files.
/// - Registers the code with the broker; `CodeInUse` surfaces unchanged.
/// - Spawns a hosting loop that serves one peer at a time and keeps the
///   code registered across a reconnect so the receiver can resume.
///
/// The bubble is in `AwaitingPeer` until a receiver dials.
pub async fn share_files<R: Rendezvous>(
    request: ShareFilesRequest,
    rendezvous: Arc<R>,
) -> Result<ShareFilesBubble, TransferError> {
    let code = match request.code {
        Some(code) => {
            if code.len() != 4 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(TransferError::InvalidCode);
            }
            code
        }
        None => format!("{:04}", rand::rng().random_range(0..10_000)),
    };

    let expires_at = request
        .ttl
        .map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64);
    let entries: Vec<FileEntry> = request
        .files
        .iter()
        .map(|f| FileEntry::new(f.path.clone(), f.size(), f.mime.clone(), f.modified_at))
        .collect();
    let manifest = TransferManifest::new(entries, expires_at);

    let listener = rendezvous.register(&code).await?;
    info!(
        code,
        files = manifest.files.len(),
        total_size = manifest.total_size,
        "sharing files"
    );

    let handler = Arc::new(ShareFilesHandler::new(
        manifest,
        request.files,
        request.config,
        request.hooks.unwrap_or_else(noop_hooks),
    ));
    handler.set_phase(Phase::AwaitingPeer);

    tokio::spawn(host_loop(
        rendezvous.clone(),
        listener,
        code.clone(),
        handler.clone(),
    ));

    Ok(ShareFilesBubble {
        code,
        handler,
        created_at: Utc::now(),
    })
}

/// Serves inbound channels until the session terminates.
///
/// A lost channel returns the session to `AwaitingPeer` with the code still
/// registered, so the receiver's reconnect lands here and drives resume.
async fn host_loop<R: Rendezvous>(
    rendezvous: Arc<R>,
    mut listener: R::Listener,
    code: String,
    handler: Arc<ShareFilesHandler>,
) {
    let mut stop_rx = handler.stop_watch();
    loop {
        let accepted = tokio::select! {
            _ = ShareFilesHandler::await_stop(&mut stop_rx) => None,
            accepted = listener.accept() => accepted,
        };
        let Some(channel) = accepted else {
            handler.set_phase(Phase::Cancelled);
            break;
        };

        if handler
            .manifest()
            .is_expired_at(Utc::now().timestamp_millis())
        {
            info!(code, "rejecting dial on expired rendezvous");
            let _ = channel.send_control(ControlFrame::Reject {
                reason: RejectReason::Expired,
            });
            channel.drained_to(0).await;
            channel.close(CloseReason::Rejected);
            handler.set_phase(Phase::Expired);
            break;
        }

        match run_session(handler.clone(), channel).await {
            SessionEnd::Completed => {
                handler.set_phase(Phase::Completed);
                break;
            }
            SessionEnd::Cancelled => {
                handler.set_phase(Phase::Cancelled);
                break;
            }
            SessionEnd::ChannelLost => {
                info!(code, "channel lost, awaiting reconnect");
                handler.set_phase(Phase::AwaitingPeer);
            }
            SessionEnd::Failed(reason) => {
                handler.set_phase(Phase::Failed(reason));
                break;
            }
        }
    }
    rendezvous.release(&code).await;
}

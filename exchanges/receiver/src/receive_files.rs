//! High-level receive operation.
//!
//! `receive_files` dials the rendezvous code with the retry/timeout policy,
//! waits for the sender's manifest, and returns a `ReceiveFilesBubble` the
//! caller uses to accept, reject, cancel, and observe the session.

pub(crate) mod handler;

use std::sync::Arc;

use aerodropx_common::{
    channel::{Channel, CloseReason, InboundFrame, Rendezvous},
    config::TransferConfig,
    error::TransferError,
    frames::{ControlFrame, RejectReason},
    host::noop_hooks,
    manifest::TransferManifest,
    phase::Phase,
};
use handler::{Command, ReceiveShared, run_session};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::{ReceiveFilesRequest, RetainedState, sink::SinkProvider};

pub use handler::{ReceiveConnectingEvent, ReceiveFilesSubscriber};

/// A controllable handle for one incoming transfer session.
///
/// Returned by [`receive_files`] once the sender's manifest arrived; the
/// session sits in `Negotiating` until you call [`accept`], [`reject`], or
/// [`cancel`].
///
/// [`accept`]: ReceiveFilesBubble::accept
/// [`reject`]: ReceiveFilesBubble::reject
/// [`cancel`]: ReceiveFilesBubble::cancel
pub struct ReceiveFilesBubble {
    manifest: TransferManifest,
    resume_offer: Option<(usize, u64)>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<ReceiveShared>,
}

impl std::fmt::Debug for ReceiveFilesBubble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveFilesBubble")
            .field("manifest", &self.manifest)
            .field("resume_offer", &self.resume_offer)
            .finish()
    }
}

impl ReceiveFilesBubble {
    /// The manifest announced by the sender.
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// The `(file_index, byte_offset)` a `RESUME` will request, when the
    /// incoming manifest matched retained state with progress. `None` means
    /// accepting starts from scratch.
    pub fn resume_offer(&self) -> Option<(usize, u64)> {
        self.resume_offer
    }

    /// Accepts the transfer; `provider` opens a sink per file.
    ///
    /// When a resume offer is present, the session resumes from it instead
    /// of restarting.
    pub fn accept(&self, provider: Arc<dyn SinkProvider>) {
        let _ = self.cmd_tx.send(Command::Accept(provider));
    }

    /// Refuses the transfer; the channel closes after the `REJECT`.
    pub fn reject(&self, reason: RejectReason) {
        let _ = self.cmd_tx.send(Command::Reject(reason));
    }

    /// Cancels the session. The active sink is aborted and partial bytes
    /// are discarded.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(Command::Cancel);
    }

    /// Current session phase.
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// A watch on the session phase.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.shared.phase_watch()
    }

    /// Waits until the session reaches a terminal phase and returns it.
    pub async fn await_terminal(&self) -> Phase {
        let mut rx = self.shared.phase_watch();
        loop {
            let phase = rx.borrow_and_update().clone();
            if phase.is_terminal() {
                return phase;
            }
            if rx.changed().await.is_err() {
                return self.shared.phase();
            }
        }
    }

    /// Bytes delivered so far, including credit carried over by a resume.
    pub fn delivered_bytes(&self) -> u64 {
        self.shared.delivered()
    }

    /// Snapshot of the state to carry into a reconnect after a channel
    /// loss: pass it as [`ReceiveFilesRequest::retained`].
    pub fn retained(&self) -> RetainedState {
        self.shared.retained_snapshot()
    }

    /// Register a subscriber for progress and phase notifications.
    ///
    /// A subscriber with the same ID replaces the previous one.
    pub fn subscribe(&self, subscriber: Arc<dyn ReceiveFilesSubscriber>) {
        self.shared.subscribe(subscriber);
    }

    /// Remove a previously registered subscriber.
    pub fn unsubscribe(&self, subscriber: Arc<dyn ReceiveFilesSubscriber>) {
        self.shared.unsubscribe(subscriber);
    }
}

/// Dials `request.code` and waits for the sender's manifest.
///
/// Policy (all tunable through [`TransferConfig`]):
/// - Up to 3 dial attempts, 2 s apart, while the peer is unavailable.
/// - 15 s budget from the first dial attempt to the first received control
///   frame; overrunning it is [`TransferError::ConnectTimeout`].
///
/// An inbound `REJECT` (e.g. on an expired rendezvous) surfaces as
/// [`TransferError::Rejected`] with the sender's reason.
pub async fn receive_files<R: Rendezvous>(
    request: ReceiveFilesRequest,
    rendezvous: Arc<R>,
) -> Result<ReceiveFilesBubble, TransferError> {
    let dial_config = request.config.clone().unwrap_or_default();
    let deadline =
        tokio::time::Instant::now() + dial_config.connect_timeout;

    let channel = tokio::time::timeout_at(
        deadline,
        dial_with_retries(rendezvous.as_ref(), &request.code, &dial_config),
    )
    .await
    .map_err(|_| TransferError::ConnectTimeout)??;

    info!(code = %request.code, "dialed, awaiting manifest");
    let first = tokio::time::timeout_at(deadline, channel.recv())
        .await
        .map_err(|_| {
            channel.close(CloseReason::Error);
            TransferError::ConnectTimeout
        })?;

    let manifest = match first {
        Some(InboundFrame::Control(ControlFrame::Manifest(manifest))) => {
            manifest
        }
        Some(InboundFrame::Control(ControlFrame::Reject { reason })) => {
            return Err(TransferError::Rejected(reason));
        }
        Some(InboundFrame::Control(ControlFrame::Cancel { .. })) => {
            return Err(TransferError::Cancelled);
        }
        Some(other) => {
            channel.close(CloseReason::ProtocolError);
            return Err(TransferError::Protocol(format!(
                "expected MANIFEST, got {other:?}"
            )));
        }
        None => return Err(TransferError::ChannelClosed),
    };

    let config = request
        .config
        .unwrap_or_else(|| TransferConfig::for_class(channel.network_class()));

    // Resume eligibility: the retained manifest must match the incoming one.
    let retained = match request.retained {
        Some(prior) if manifest.is_resumable_from(&prior.manifest) => {
            debug!("incoming manifest matches retained state");
            RetainedState {
                manifest: manifest.clone(),
                completed: prior.completed,
                partial: prior.partial,
            }
        }
        _ => RetainedState::fresh(manifest.clone()),
    };
    let seed = retained.resume_seed();
    let resume_offer = (seed != (0, 0)).then_some(seed);

    let shared = Arc::new(ReceiveShared::new(
        manifest.clone(),
        config,
        retained,
        request.hooks.unwrap_or_else(noop_hooks),
    ));
    shared.set_phase(Phase::Negotiating);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_session(channel, shared.clone(), cmd_rx, resume_offer));

    Ok(ReceiveFilesBubble {
        manifest,
        resume_offer,
        cmd_tx,
        shared,
    })
}

async fn dial_with_retries<R: Rendezvous>(
    rendezvous: &R,
    code: &str,
    config: &TransferConfig,
) -> Result<R::Channel, TransferError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match rendezvous.dial(code).await {
            Ok(channel) => return Ok(channel),
            Err(TransferError::PeerUnavailable)
                if attempt < config.dial_attempts =>
            {
                debug!(attempt, code, "peer unavailable, retrying");
                tokio::time::sleep(config.dial_retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

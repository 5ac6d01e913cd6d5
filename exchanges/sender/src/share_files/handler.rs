use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use aerodrop_entities::{FileData, SourceFile};
use aerodropx_common::{
    channel::{Channel, CloseReason, InboundFrame},
    config::TransferConfig,
    error::FailureReason,
    frames::ControlFrame,
    host::HostHooks,
    manifest::TransferManifest,
    phase::Phase,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pump::{PumpError, PumpOutcome, run_pump};

/// Observer interface for a share session.
///
/// Implementors must be `Send + Sync`; notifications are invoked from the
/// session task.
pub trait ShareFilesSubscriber: Send + Sync {
    /// Stable identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;
    /// A peer accepted (or resumed) the transfer.
    fn notify_connecting(&self, event: ShareConnectingEvent);
    /// Bytes of a file went out.
    fn notify_sending(&self, event: ShareSendingEvent);
    /// The session phase changed.
    fn notify_phase(&self, phase: &Phase) {
        let _ = phase;
    }
}

/// Event published when a peer accepts or resumes.
#[derive(Clone, Debug)]
pub struct ShareConnectingEvent {
    /// `Some((file_index, byte_offset))` when the peer resumed an earlier
    /// transfer; `None` for a fresh accept.
    pub resumed_from: Option<(usize, u64)>,
}

/// Event published as file bytes are sent.
#[derive(Clone, Debug)]
pub struct ShareSendingEvent {
    pub file_index: usize,
    pub path: String,
    /// Bytes of this file delivered so far, including any resume offset.
    pub sent: u64,
    pub remaining: u64,
    pub throughput_mbps: f64,
}

/// Shared state for one hosted share, spanning reconnects.
pub(crate) struct ShareFilesHandler {
    manifest: TransferManifest,
    files: Vec<SourceFile>,
    config: Option<TransferConfig>,
    epoch: AtomicU64,
    phase_tx: watch::Sender<Phase>,
    stop_tx: watch::Sender<bool>,
    subscribers: RwLock<HashMap<String, Arc<dyn ShareFilesSubscriber>>>,
    bytes_sent: AtomicU64,
    start_time: RwLock<Option<Instant>>,
    hooks: Arc<dyn HostHooks>,
}

impl ShareFilesHandler {
    pub(crate) fn new(
        manifest: TransferManifest,
        files: Vec<SourceFile>,
        config: Option<TransferConfig>,
        hooks: Arc<dyn HostHooks>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        let (stop_tx, _) = watch::channel(false);
        Self {
            manifest,
            files,
            config,
            epoch: AtomicU64::new(0),
            phase_tx,
            stop_tx,
            subscribers: RwLock::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            start_time: RwLock::new(None),
            hooks,
        }
    }

    pub(crate) fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    pub(crate) fn file_data(&self, index: usize) -> Arc<dyn FileData> {
        self.files[index].data.clone()
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase_tx.borrow().clone()
    }

    pub(crate) fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let engaged = !matches!(phase, Phase::Idle) && !phase.is_terminal();
        self.hooks.set_teardown_guard(engaged);
        info!(?phase, "sender phase");
        self.phase_tx.send_replace(phase.clone());
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_phase(&phase);
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn request_stop(&self) {
        self.bump_epoch();
        self.stop_tx.send_replace(true);
    }

    pub(crate) fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Resolves once `stop_watch` reports `true`, without holding a
    /// `watch::Ref` across an await point (that guard is not `Send`, and
    /// this is driven from a `tokio::select!` branch that must be).
    pub(crate) async fn await_stop(stop_rx: &mut watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                return;
            }
            if stop_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn subscribe(&self, subscriber: Arc<dyn ShareFilesSubscriber>) {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.get_id(), subscriber);
    }

    pub(crate) fn unsubscribe(
        &self,
        subscriber: Arc<dyn ShareFilesSubscriber>,
    ) {
        self.subscribers
            .write()
            .unwrap()
            .remove(&subscriber.get_id());
    }

    fn notify_connecting(&self, event: ShareConnectingEvent) {
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_connecting(event.clone());
        }
    }

    /// Accounts for a sent chunk and fans out a progress event.
    pub(crate) fn record_sent(
        &self,
        file_index: usize,
        path: &str,
        sent: u64,
        remaining: u64,
        chunk_len: u64,
    ) {
        let total = self
            .bytes_sent
            .fetch_add(chunk_len, Ordering::Relaxed)
            + chunk_len;

        let throughput_mbps = {
            let start = self.start_time.read().unwrap();
            match *start {
                Some(start) if start.elapsed().as_secs_f64() > 0.0 => {
                    (total as f64 / (1024.0 * 1024.0))
                        / start.elapsed().as_secs_f64()
                }
                _ => 0.0,
            }
        };

        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_sending(ShareSendingEvent {
                file_index,
                path: path.to_string(),
                sent,
                remaining,
                throughput_mbps,
            });
        }
    }

    fn mark_streaming_started(&self) {
        let mut start = self.start_time.write().unwrap();
        if start.is_none() {
            *start = Some(Instant::now());
        }
    }
}

/// How one connection's protocol run ended.
pub(crate) enum SessionEnd {
    Completed,
    Cancelled,
    ChannelLost,
    Failed(FailureReason),
}

fn frame_name(frame: &ControlFrame) -> &'static str {
    match frame {
        ControlFrame::Manifest(_) => "MANIFEST",
        ControlFrame::Reject { .. } => "REJECT",
        ControlFrame::Accept => "ACCEPT",
        ControlFrame::Resume { .. } => "RESUME",
        ControlFrame::FileStart { .. } => "FILE_START",
        ControlFrame::FileComplete { .. } => "FILE_COMPLETE",
        ControlFrame::AllComplete => "ALL_COMPLETE",
        ControlFrame::Cancel { .. } => "CANCEL",
    }
}

enum Negotiation {
    Seed(usize, u64),
    End(SessionEnd),
}

/// Drives the sender state machine over one channel.
///
/// Sends the manifest, waits for the peer's `ACCEPT`/`RESUME`, launches the
/// epoch-tagged producer, and keeps listening for control frames so a
/// `CANCEL` is observed while the producer runs.
pub(crate) async fn run_session<C: Channel>(
    handler: Arc<ShareFilesHandler>,
    channel: C,
) -> SessionEnd {
    let session_id = Uuid::new_v4();
    info!(%session_id, "peer connected");
    handler.set_phase(Phase::Negotiating);

    if channel
        .send_control(ControlFrame::Manifest(handler.manifest().clone()))
        .is_err()
    {
        return SessionEnd::ChannelLost;
    }

    let (start_index, start_offset) =
        match negotiate(&handler, &channel, session_id).await {
            Negotiation::Seed(index, offset) => (index, offset),
            Negotiation::End(end) => return end,
        };

    handler.set_phase(Phase::Accepted);
    handler.mark_streaming_started();
    handler.notify_connecting(ShareConnectingEvent {
        resumed_from: ((start_index, start_offset) != (0, 0))
            .then_some((start_index, start_offset)),
    });

    let config = handler
        .config
        .clone()
        .unwrap_or_else(|| TransferConfig::for_class(channel.network_class()));
    let epoch = handler.epoch();
    let mut pump = tokio::spawn(run_pump(
        channel.clone(),
        handler.clone(),
        config,
        start_index,
        start_offset,
        epoch,
    ));
    handler.set_phase(Phase::Streaming);

    let mut stop_rx = handler.stop_watch();
    loop {
        tokio::select! {
            result = &mut pump => {
                return match result {
                    Ok(Ok(PumpOutcome::Done)) => {
                        channel.close(CloseReason::Done);
                        SessionEnd::Completed
                    }
                    Ok(Ok(PumpOutcome::Superseded)) => {
                        channel.close(CloseReason::Cancelled);
                        SessionEnd::Cancelled
                    }
                    Ok(Err(PumpError::Channel)) => SessionEnd::ChannelLost,
                    Ok(Err(PumpError::Source(e))) => {
                        warn!(%session_id, "source read failed: {e:#}");
                        let _ = channel.send_control(ControlFrame::Cancel {
                            reason: Some(format!("source read failed: {e:#}")),
                        });
                        channel.drained_to(0).await;
                        channel.close(CloseReason::Error);
                        SessionEnd::Failed(FailureReason::DiskWrite(
                            format!("{e:#}"),
                        ))
                    }
                    Err(e) => {
                        let detail = if e.is_panic() {
                            let payload = e.into_panic();
                            let message = payload
                                .downcast_ref::<&str>()
                                .map(|s| (*s).to_string())
                                .or_else(|| {
                                    payload.downcast_ref::<String>().cloned()
                                })
                                .unwrap_or_else(|| {
                                    "opaque panic payload".to_string()
                                });
                            format!("producer task panicked: {message}")
                        } else {
                            format!("producer task failed: {e}")
                        };
                        warn!(%session_id, "{detail}");
                        channel.close(CloseReason::Error);
                        SessionEnd::Failed(FailureReason::Protocol(detail))
                    }
                };
            }

            _ = ShareFilesHandler::await_stop(&mut stop_rx) => {
                // Epoch already bumped by request_stop; the producer exits
                // at its next suspension point.
                let _ = channel.send_control(ControlFrame::Cancel {
                    reason: None,
                });
                channel.drained_to(0).await;
                channel.close(CloseReason::Cancelled);
                return SessionEnd::Cancelled;
            }

            frame = channel.recv() => match frame {
                None => {
                    handler.bump_epoch();
                    return SessionEnd::ChannelLost;
                }
                Some(InboundFrame::Control(ControlFrame::Cancel { reason })) => {
                    info!(%session_id, ?reason, "peer cancelled");
                    handler.bump_epoch();
                    let _ = channel.send_control(ControlFrame::Cancel {
                        reason: None,
                    });
                    channel.close(CloseReason::Cancelled);
                    return SessionEnd::Cancelled;
                }
                Some(InboundFrame::Control(ControlFrame::Reject { reason })) => {
                    info!(%session_id, %reason, "peer rejected");
                    handler.bump_epoch();
                    channel.close(CloseReason::Rejected);
                    return SessionEnd::Failed(FailureReason::Rejected(reason));
                }
                Some(InboundFrame::Control(other)) => {
                    handler.bump_epoch();
                    channel.close(CloseReason::ProtocolError);
                    return SessionEnd::Failed(FailureReason::Protocol(
                        format!(
                            "unexpected {} frame while streaming",
                            frame_name(&other)
                        ),
                    ));
                }
                Some(InboundFrame::Binary(_)) => {
                    handler.bump_epoch();
                    channel.close(CloseReason::ProtocolError);
                    return SessionEnd::Failed(FailureReason::Protocol(
                        "binary frame received by the sender".into(),
                    ));
                }
            }
        }
    }
}

/// Waits for the peer's go-ahead, validating any resume seed against the
/// manifest.
async fn negotiate<C: Channel>(
    handler: &Arc<ShareFilesHandler>,
    channel: &C,
    session_id: Uuid,
) -> Negotiation {
    let mut stop_rx = handler.stop_watch();
    loop {
        let frame = tokio::select! {
            _ = ShareFilesHandler::await_stop(&mut stop_rx) => {
                let _ = channel.send_control(ControlFrame::Cancel {
                    reason: None,
                });
                channel.drained_to(0).await;
                channel.close(CloseReason::Cancelled);
                return Negotiation::End(SessionEnd::Cancelled);
            }
            frame = channel.recv() => frame,
        };

        match frame {
            None => {
                return Negotiation::End(SessionEnd::ChannelLost);
            }
            Some(InboundFrame::Control(ControlFrame::Accept)) => {
                debug!(%session_id, "peer accepted");
                return Negotiation::Seed(0, 0);
            }
            Some(InboundFrame::Control(ControlFrame::Resume {
                file_index,
                byte_offset,
            })) => {
                let files = &handler.manifest().files;
                // An index one past the end means everything was already
                // delivered; the producer then only confirms completion.
                let valid = if file_index == files.len() {
                    byte_offset == 0
                } else {
                    files
                        .get(file_index)
                        .map(|entry| byte_offset <= entry.size)
                        .unwrap_or(false)
                };
                if !valid {
                    handler.bump_epoch();
                    channel.close(CloseReason::ProtocolError);
                    return Negotiation::End(SessionEnd::Failed(
                        FailureReason::Protocol(format!(
                            "resume seed ({file_index}, {byte_offset}) \
                             outside the manifest"
                        )),
                    ));
                }
                debug!(%session_id, file_index, byte_offset, "peer resumed");
                return Negotiation::Seed(file_index, byte_offset);
            }
            Some(InboundFrame::Control(ControlFrame::Cancel { reason })) => {
                info!(%session_id, ?reason, "peer cancelled");
                handler.bump_epoch();
                let _ = channel.send_control(ControlFrame::Cancel {
                    reason: None,
                });
                channel.close(CloseReason::Cancelled);
                return Negotiation::End(SessionEnd::Cancelled);
            }
            Some(InboundFrame::Control(ControlFrame::Reject { reason })) => {
                info!(%session_id, %reason, "peer rejected");
                handler.bump_epoch();
                channel.close(CloseReason::Rejected);
                return Negotiation::End(SessionEnd::Failed(
                    FailureReason::Rejected(reason),
                ));
            }
            Some(InboundFrame::Control(other)) => {
                handler.bump_epoch();
                channel.close(CloseReason::ProtocolError);
                return Negotiation::End(SessionEnd::Failed(
                    FailureReason::Protocol(format!(
                        "unexpected {} frame while negotiating",
                        frame_name(&other)
                    )),
                ));
            }
            Some(InboundFrame::Binary(_)) => {
                handler.bump_epoch();
                channel.close(CloseReason::ProtocolError);
                return Negotiation::End(SessionEnd::Failed(
                    FailureReason::Protocol(
                        "binary frame received by the sender".into(),
                    ),
                ));
            }
        }
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use aerodropx_common::{
    channel::{Channel, CloseReason, InboundFrame},
    config::TransferConfig,
    error::FailureReason,
    frames::{ControlFrame, RejectReason},
    host::HostHooks,
    manifest::TransferManifest,
    phase::Phase,
};
use anyhow::Context;
use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    RetainedState, progress::ReceiveProgressEvent, progress::spawn_sampler,
    sink::SinkProvider, write_queue::WriteQueue,
};

/// Observer interface for a receive session.
///
/// All notifications have no-op defaults; implement what you render.
pub trait ReceiveFilesSubscriber: Send + Sync {
    /// Stable identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;

    /// The session was accepted and streaming is about to begin.
    fn notify_connecting(&self, event: ReceiveConnectingEvent) {
        let _ = event;
    }

    /// A file finished and its sink was closed.
    fn notify_file_complete(&self, file_index: usize) {
        let _ = file_index;
    }

    /// Once-per-second progress snapshot.
    fn notify_progress(&self, event: ReceiveProgressEvent) {
        let _ = event;
    }

    /// The session phase changed.
    fn notify_phase(&self, phase: &Phase) {
        let _ = phase;
    }
}

/// Event published when the receiver commits to the transfer.
#[derive(Clone, Debug)]
pub struct ReceiveConnectingEvent {
    pub manifest: TransferManifest,
    /// `Some((file_index, byte_offset))` when the session resumed.
    pub resumed_from: Option<(usize, u64)>,
}

/// User commands flowing from the bubble into the session task.
pub(crate) enum Command {
    Accept(Arc<dyn SinkProvider>),
    Reject(RejectReason),
    Cancel,
}

/// Shared state between the bubble, the session task, and the sampler.
pub(crate) struct ReceiveShared {
    manifest: TransferManifest,
    pub(crate) config: TransferConfig,
    phase_tx: watch::Sender<Phase>,
    subscribers: RwLock<HashMap<String, Arc<dyn ReceiveFilesSubscriber>>>,
    delivered: AtomicU64,
    retained: Mutex<RetainedState>,
    hooks: Arc<dyn HostHooks>,
}

impl ReceiveShared {
    pub(crate) fn new(
        manifest: TransferManifest,
        config: TransferConfig,
        retained: RetainedState,
        hooks: Arc<dyn HostHooks>,
    ) -> Self {
        let delivered = retained.delivered_bytes();
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            manifest,
            config,
            phase_tx,
            subscribers: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(delivered),
            retained: Mutex::new(retained),
            hooks,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase_tx.borrow().clone()
    }

    pub(crate) fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        if phase == Phase::Streaming {
            self.hooks.acquire_wake_lock();
        } else if phase.is_terminal() {
            self.hooks.release_wake_lock();
        }
        info!(?phase, "receiver phase");
        self.phase_tx.send_replace(phase.clone());
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_phase(&phase);
        }
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.manifest.total_size
    }

    fn add_delivered(&self, bytes: u64) {
        self.delivered.fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_delivered(&self, bytes: u64) {
        self.delivered.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn retained_snapshot(&self) -> RetainedState {
        self.retained.lock().unwrap().clone()
    }

    fn with_retained(&self, update: impl FnOnce(&mut RetainedState)) {
        update(&mut self.retained.lock().unwrap());
    }

    pub(crate) fn subscribe(
        &self,
        subscriber: Arc<dyn ReceiveFilesSubscriber>,
    ) {
        self.subscribers
            .write()
            .unwrap()
            .insert(subscriber.get_id(), subscriber);
    }

    pub(crate) fn unsubscribe(
        &self,
        subscriber: Arc<dyn ReceiveFilesSubscriber>,
    ) {
        self.subscribers
            .write()
            .unwrap()
            .remove(&subscriber.get_id());
    }

    pub(crate) fn notify_progress(&self, event: ReceiveProgressEvent) {
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_progress(event.clone());
        }
    }

    fn notify_connecting(&self, event: ReceiveConnectingEvent) {
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_connecting(event.clone());
        }
    }

    fn notify_file_complete(&self, file_index: usize) {
        for subscriber in self.subscribers.read().unwrap().values() {
            subscriber.notify_file_complete(file_index);
        }
    }
}

/// The file currently being received.
struct ActiveFile {
    index: usize,
    /// Offset the sink was opened at (non-zero only for a resumed file).
    base_offset: u64,
    /// Bytes received for this file during this session.
    received: u64,
    /// Frames coalesced but not yet queued for writing.
    coalesce: BytesMut,
    seekable: bool,
}

impl ActiveFile {
    fn delivered(&self) -> u64 {
        self.base_offset + self.received
    }
}

/// Drives the receiver state machine over one channel.
pub(crate) async fn run_session<C: Channel>(
    channel: C,
    shared: Arc<ReceiveShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    resume_offer: Option<(usize, u64)>,
) {
    let session_id = Uuid::new_v4();

    // Phase 1: wait for the local decision, staying responsive to the peer.
    let provider = loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Accept(provider)) => break provider,
                Some(Command::Reject(reason)) => {
                    info!(%session_id, %reason, "rejecting transfer");
                    let _ = channel.send_control(ControlFrame::Reject {
                        reason,
                    });
                    channel.drained_to(0).await;
                    channel.close(CloseReason::Rejected);
                    shared.set_phase(Phase::Cancelled);
                    return;
                }
                // A dropped bubble means nobody can accept anymore.
                Some(Command::Cancel) | None => {
                    let _ = channel.send_control(ControlFrame::Cancel {
                        reason: None,
                    });
                    channel.drained_to(0).await;
                    channel.close(CloseReason::Cancelled);
                    shared.set_phase(Phase::Cancelled);
                    return;
                }
            },
            frame = channel.recv() => match frame {
                None => {
                    shared.set_phase(Phase::Failed(FailureReason::ChannelLost));
                    return;
                }
                Some(InboundFrame::Control(ControlFrame::Cancel { reason })) => {
                    info!(%session_id, ?reason, "peer cancelled");
                    channel.close(CloseReason::Cancelled);
                    shared.set_phase(Phase::Cancelled);
                    return;
                }
                Some(InboundFrame::Control(ControlFrame::Reject { reason })) => {
                    channel.close(CloseReason::Rejected);
                    shared.set_phase(Phase::Failed(
                        FailureReason::Rejected(reason),
                    ));
                    return;
                }
                Some(InboundFrame::Binary(_)) => {
                    // Absorbs the race where the sender already emitted
                    // bytes before processing a cancel.
                    debug!(%session_id, "dropping binary frame outside streaming");
                }
                Some(InboundFrame::Control(other)) => {
                    protocol_violation(
                        &channel,
                        &shared,
                        format!("unexpected frame while negotiating: {other:?}"),
                    );
                    return;
                }
            }
        }
    };

    // Phase 2: commit.
    let go_ahead = match resume_offer {
        Some((file_index, byte_offset)) => ControlFrame::Resume {
            file_index,
            byte_offset,
        },
        None => ControlFrame::Accept,
    };
    if channel.send_control(go_ahead).is_err() {
        shared.set_phase(Phase::Failed(FailureReason::ChannelLost));
        return;
    }
    shared.set_phase(Phase::Accepted);
    shared.notify_connecting(ReceiveConnectingEvent {
        manifest: shared.manifest.clone(),
        resumed_from: resume_offer,
    });

    shared.set_phase(Phase::Streaming);
    let sampler = spawn_sampler(shared.clone(), shared.phase_watch());

    stream(
        &channel,
        &shared,
        &mut cmd_rx,
        provider,
        resume_offer,
        session_id,
    )
    .await;

    sampler.abort();
}

/// Phase 3: the streaming loop, until a terminal phase is reached.
async fn stream<C: Channel>(
    channel: &C,
    shared: &Arc<ReceiveShared>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    provider: Arc<dyn SinkProvider>,
    resume_offer: Option<(usize, u64)>,
    session_id: Uuid,
) {
    let queue = WriteQueue::spawn();
    let mut failure_rx = queue.failure_watch();
    let mut active: Option<ActiveFile> = None;
    let mut pending_resume = resume_offer;
    let write_batch = shared.config.write_batch as usize;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Cancel) | None => {
                    info!(%session_id, "local cancel");
                    let _ = channel.send_control(ControlFrame::Cancel {
                        reason: None,
                    });
                    channel.drained_to(0).await;
                    queue.abort().await;
                    channel.close(CloseReason::Cancelled);
                    shared.set_phase(Phase::Cancelled);
                    return;
                }
                Some(_) => {
                    debug!(%session_id, "ignoring command while streaming");
                }
            },

            failure = crate::write_queue::await_failure(&mut failure_rx) => {
                let detail = failure.unwrap_or_default();
                warn!(%session_id, "sink write failed: {detail}");
                let _ = channel.send_control(ControlFrame::Cancel {
                    reason: Some(format!("disk write failed: {detail}")),
                });
                channel.drained_to(0).await;
                queue.abort().await;
                channel.close(CloseReason::Error);
                shared.set_phase(Phase::Failed(
                    FailureReason::DiskWrite(detail),
                ));
                return;
            }

            frame = channel.recv() => match frame {
                None => {
                    on_channel_lost(shared, &queue, active.take()).await;
                    shared.set_phase(Phase::Failed(FailureReason::ChannelLost));
                    return;
                }

                Some(InboundFrame::Control(ControlFrame::FileStart {
                    file_index,
                    path,
                    size,
                })) => {
                    debug!(%session_id, file_index, %path, size, "file start");
                    match start_file(
                        shared,
                        &queue,
                        &provider,
                        &mut active,
                        &mut pending_resume,
                        file_index,
                    )
                    .await
                    {
                        Ok(()) => {}
                        Err(StartError::Violation(detail)) => {
                            queue.abort().await;
                            protocol_violation(channel, shared, detail);
                            return;
                        }
                        Err(StartError::Sink(e)) => {
                            warn!(%session_id, "opening sink failed: {e:#}");
                            let _ = channel.send_control(ControlFrame::Cancel {
                                reason: Some(format!(
                                    "disk write failed: {e:#}"
                                )),
                            });
                            channel.drained_to(0).await;
                            queue.abort().await;
                            channel.close(CloseReason::Error);
                            shared.set_phase(Phase::Failed(
                                FailureReason::DiskWrite(format!("{e:#}")),
                            ));
                            return;
                        }
                    }
                }

                Some(InboundFrame::Binary(data)) => {
                    let Some(file) = active.as_mut() else {
                        debug!(%session_id, "dropping binary frame with no open file");
                        continue;
                    };
                    let entry = &shared.manifest.files[file.index];
                    if file.delivered() + data.len() as u64 > entry.size {
                        queue.abort().await;
                        protocol_violation(
                            channel,
                            shared,
                            format!(
                                "file {} overflows its declared {} bytes",
                                entry.path, entry.size
                            ),
                        );
                        return;
                    }

                    // Account before enqueueing so progress never lags
                    // writes.
                    file.received += data.len() as u64;
                    shared.add_delivered(data.len() as u64);

                    file.coalesce.extend_from_slice(&data);
                    if file.coalesce.len() >= write_batch {
                        queue.push(file.coalesce.split().freeze());
                    }
                }

                Some(InboundFrame::Control(ControlFrame::FileComplete {
                    file_index,
                })) => {
                    let Some(mut file) = active.take() else {
                        queue.abort().await;
                        protocol_violation(
                            channel,
                            shared,
                            format!("FILE_COMPLETE({file_index}) with no open file"),
                        );
                        return;
                    };
                    if file.index != file_index {
                        queue.abort().await;
                        protocol_violation(
                            channel,
                            shared,
                            format!(
                                "FILE_COMPLETE({file_index}) while file {} is open",
                                file.index
                            ),
                        );
                        return;
                    }

                    if !file.coalesce.is_empty() {
                        queue.push(file.coalesce.split().freeze());
                    }
                    match queue.close_file().await {
                        Ok(()) => {}
                        Err(e) => {
                            warn!(%session_id, "closing sink failed: {e}");
                            let _ = channel.send_control(ControlFrame::Cancel {
                                reason: Some(format!("disk write failed: {e}")),
                            });
                            channel.drained_to(0).await;
                            channel.close(CloseReason::Error);
                            shared.set_phase(Phase::Failed(
                                FailureReason::DiskWrite(e.to_string()),
                            ));
                            return;
                        }
                    }

                    // Completion is atomic with sink closure.
                    shared.with_retained(|retained| {
                        retained.completed.insert(file_index);
                        retained.partial = None;
                    });
                    shared.notify_file_complete(file_index);
                    debug!(%session_id, file_index, "file complete");
                }

                Some(InboundFrame::Control(ControlFrame::AllComplete)) => {
                    if active.is_some() {
                        queue.abort().await;
                        protocol_violation(
                            channel,
                            shared,
                            "ALL_COMPLETE while a file is open".to_string(),
                        );
                        return;
                    }
                    if let Err(e) = queue.drain().await {
                        channel.close(CloseReason::Error);
                        shared.set_phase(Phase::Failed(
                            FailureReason::DiskWrite(e.to_string()),
                        ));
                        return;
                    }
                    info!(%session_id, "transfer complete");
                    channel.close(CloseReason::Done);
                    shared.set_phase(Phase::Completed);
                    return;
                }

                Some(InboundFrame::Control(ControlFrame::Cancel { reason })) => {
                    info!(%session_id, ?reason, "peer cancelled");
                    queue.abort().await;
                    channel.close(CloseReason::Cancelled);
                    shared.set_phase(Phase::Cancelled);
                    return;
                }

                Some(InboundFrame::Control(other)) => {
                    queue.abort().await;
                    protocol_violation(
                        channel,
                        shared,
                        format!("unexpected frame while streaming: {other:?}"),
                    );
                    return;
                }
            }
        }
    }
}

enum StartError {
    Violation(String),
    Sink(anyhow::Error),
}

async fn start_file(
    shared: &Arc<ReceiveShared>,
    queue: &WriteQueue,
    provider: &Arc<dyn SinkProvider>,
    active: &mut Option<ActiveFile>,
    pending_resume: &mut Option<(usize, u64)>,
    file_index: usize,
) -> Result<(), StartError> {
    let Some(entry) = shared.manifest.files.get(file_index).cloned() else {
        return Err(StartError::Violation(format!(
            "FILE_START({file_index}) outside the manifest"
        )));
    };

    if let Some(current) = active.as_ref() {
        if current.index != file_index {
            return Err(StartError::Violation(format!(
                "FILE_START({file_index}) while file {} is open",
                current.index
            )));
        }
        if current.received == 0 {
            // Duplicate FILE_START before any bytes is idempotent.
            return Ok(());
        }
    }
    if let Some(stale) = active.take() {
        // Bytes already arrived: restart the file, discarding them.
        shared.sub_delivered(stale.received);
        queue.abort().await;
        shared.with_retained(|retained| retained.partial = None);
    }

    let offset = match pending_resume.take() {
        Some((index, offset)) if index == file_index => offset,
        _ => 0,
    };

    let sink = provider
        .open(file_index, &entry, offset)
        .await
        .with_context(|| format!("opening sink for {}", entry.path))
        .map_err(StartError::Sink)?;
    let seekable = sink.seekable();
    queue.open(sink);

    *active = Some(ActiveFile {
        index: file_index,
        base_offset: offset,
        received: 0,
        coalesce: BytesMut::new(),
        seekable,
    });
    Ok(())
}

/// Best-effort preservation of progress when the channel drops.
///
/// A seekable sink is flushed and closed so its byte count can seed a
/// `RESUME`; anything else is aborted and the file restarts from zero.
async fn on_channel_lost(
    shared: &Arc<ReceiveShared>,
    queue: &WriteQueue,
    active: Option<ActiveFile>,
) {
    let Some(mut file) = active else {
        return;
    };
    if file.seekable {
        if !file.coalesce.is_empty() {
            queue.push(file.coalesce.split().freeze());
        }
        match queue.close_file().await {
            Ok(()) => shared.with_retained(|retained| {
                retained.partial = Some((file.index, file.delivered()));
            }),
            Err(_) => shared.with_retained(|retained| {
                retained.partial = None;
            }),
        }
    } else {
        shared.sub_delivered(file.received);
        queue.abort().await;
    }
}

fn protocol_violation<C: Channel>(
    channel: &C,
    shared: &Arc<ReceiveShared>,
    detail: String,
) {
    warn!("protocol violation: {detail}");
    channel.close(CloseReason::ProtocolError);
    shared.set_phase(Phase::Failed(FailureReason::Protocol(detail)));
}

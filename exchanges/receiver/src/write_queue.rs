//! The per-session serial write queue.
//!
//! Every sink operation is appended to one unbounded queue consumed by a
//! single task, so writes reach the active sink strictly in receive order no
//! matter how many batches are in flight. Closing a file is acknowledged
//! only after everything queued before it has been written, which is the
//! drain guarantee `FILE_COMPLETE` and `ALL_COMPLETE` rely on.
//!
//! An abort flips a flag read by the consumer, so batches already queued are
//! discarded rather than written; a cancel mid-drain must not keep writing.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::sink::Sink;

enum WriteOp {
    Open(Box<dyn Sink>),
    Batch(Bytes),
    CloseFile(oneshot::Sender<io::Result<()>>),
    Abort(oneshot::Sender<()>),
    Drain(oneshot::Sender<io::Result<()>>),
}

/// Handle to the session's writer task.
pub(crate) struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteOp>,
    aborting: Arc<AtomicBool>,
    failure_rx: watch::Receiver<Option<String>>,
}

impl WriteQueue {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let aborting = Arc::new(AtomicBool::new(false));
        let (failure_tx, failure_rx) = watch::channel(None);
        tokio::spawn(writer(rx, aborting.clone(), failure_tx));
        Self {
            tx,
            aborting,
            failure_rx,
        }
    }

    /// Installs the sink for the next file.
    pub(crate) fn open(&self, sink: Box<dyn Sink>) {
        self.aborting.store(false, Ordering::Release);
        let _ = self.tx.send(WriteOp::Open(sink));
    }

    /// Appends a batch for the active sink. Non-blocking.
    pub(crate) fn push(&self, batch: Bytes) {
        let _ = self.tx.send(WriteOp::Batch(batch));
    }

    /// Closes the active sink after all queued batches have been written.
    pub(crate) async fn close_file(&self) -> io::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.tx.send(WriteOp::CloseFile(ack_tx));
        ack_rx.await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write queue task gone",
            ))
        })
    }

    /// Discards queued batches and aborts the active sink.
    pub(crate) async fn abort(&self) {
        self.aborting.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.tx.send(WriteOp::Abort(ack_tx));
        let _ = ack_rx.await;
    }

    /// Resolves once everything queued so far has been written.
    pub(crate) async fn drain(&self) -> io::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.tx.send(WriteOp::Drain(ack_tx));
        ack_rx.await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write queue task gone",
            ))
        })
    }

    /// Watch that fires when a queued write fails.
    pub(crate) fn failure_watch(&self) -> watch::Receiver<Option<String>> {
        self.failure_rx.clone()
    }
}

/// Resolves with the failure detail once `failure_watch` reports one,
/// without holding a `watch::Ref` across an await point (that guard is
/// not `Send`, and this is driven from a `tokio::select!` branch that
/// must be).
pub(crate) async fn await_failure(
    rx: &mut watch::Receiver<Option<String>>,
) -> Option<String> {
    loop {
        if let Some(detail) = rx.borrow().clone() {
            return Some(detail);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

async fn writer(
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    aborting: Arc<AtomicBool>,
    failure_tx: watch::Sender<Option<String>>,
) {
    let mut sink: Option<Box<dyn Sink>> = None;
    let mut error: Option<io::Error> = None;

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Open(new_sink) => {
                sink = Some(new_sink);
                error = None;
            }
            WriteOp::Batch(batch) => {
                if aborting.load(Ordering::Acquire) || error.is_some() {
                    continue;
                }
                if let Some(active) = sink.as_mut() {
                    if let Err(e) = active.write(batch).await {
                        warn!("sink write failed: {e}");
                        failure_tx.send_replace(Some(e.to_string()));
                        error = Some(e);
                    }
                }
            }
            WriteOp::CloseFile(ack) => {
                let result = match error.take() {
                    Some(e) => Err(e),
                    None => match sink.as_mut() {
                        Some(active) => active.close().await,
                        None => Ok(()),
                    },
                };
                if let Err(e) = &result {
                    failure_tx.send_replace(Some(e.to_string()));
                }
                sink = None;
                let _ = ack.send(result);
            }
            WriteOp::Abort(ack) => {
                if let Some(mut active) = sink.take() {
                    if let Err(e) = active.abort().await {
                        debug!("sink abort: {e}");
                    }
                }
                error = None;
                let _ = ack.send(());
            }
            WriteOp::Drain(ack) => {
                let result = match error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                let _ = ack.send(result);
            }
        }
    }

    // Session gone without a close: treat like an abort so no half-written
    // file masquerades as complete.
    if let Some(mut active) = sink.take() {
        let _ = active.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sink recording operations, optionally failing on a given write.
    struct ProbeSink {
        log: Arc<Mutex<Vec<String>>>,
        fail_on_write: Option<usize>,
        writes: usize,
    }

    impl ProbeSink {
        fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                log,
                fail_on_write: None,
                writes: 0,
            }
        }
    }

    #[async_trait]
    impl Sink for ProbeSink {
        async fn write(&mut self, batch: Bytes) -> io::Result<()> {
            self.writes += 1;
            if self.fail_on_write == Some(self.writes) {
                return Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "disk full",
                ));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("write:{}", batch.len()));
            Ok(())
        }

        async fn abort(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("abort".into());
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_acknowledges_after_all_writes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WriteQueue::spawn();

        queue.open(Box::new(ProbeSink::new(log.clone())));
        queue.push(Bytes::from(vec![0u8; 10]));
        queue.push(Bytes::from(vec![0u8; 20]));
        queue.close_file().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["write:10", "write:20", "close"]
        );
    }

    #[tokio::test]
    async fn abort_discards_queued_batches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WriteQueue::spawn();

        queue.open(Box::new(ProbeSink::new(log.clone())));
        queue.push(Bytes::from(vec![0u8; 10]));
        queue.push(Bytes::from(vec![0u8; 20]));
        queue.abort().await;

        let log = log.lock().unwrap();
        // The first batch may already be in flight when the flag flips, but
        // the abort lands and nothing is closed.
        assert!(log.last().map(String::as_str) == Some("abort"));
        assert!(!log.iter().any(|op| op == "close"));
    }

    /// Sink whose write blocks until released, so an abort can be
    /// requested while a write is executing.
    struct GateSink {
        log: Arc<Mutex<Vec<String>>>,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Sink for GateSink {
        async fn write(&mut self, batch: Bytes) -> io::Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            self.log
                .lock()
                .unwrap()
                .push(format!("write:{}", batch.len()));
            Ok(())
        }

        async fn abort(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("abort".into());
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn abort_requested_mid_write_aborts_the_sink() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let queue = WriteQueue::spawn();

        queue.open(Box::new(GateSink {
            log: log.clone(),
            entered: entered.clone(),
            release: release.clone(),
        }));
        queue.push(Bytes::from(vec![0u8; 10]));
        queue.push(Bytes::from(vec![0u8; 20]));

        // Wait until the first batch is executing inside the sink.
        entered.notified().await;

        // Request the abort while that write is in flight, then let the
        // write finish. join! polls the abort first, so the flag is set
        // before the gate opens.
        tokio::join!(queue.abort(), async {
            release.notify_one();
        });

        let log = log.lock().unwrap();
        // The in-flight batch completes at the io level but the sink is
        // aborted afterwards (discarding it), never closed, and the
        // second batch is dropped without a write.
        assert_eq!(log.last().map(String::as_str), Some("abort"));
        assert!(!log.iter().any(|op| op == "close"));
        assert!(!log.iter().any(|op| op == "write:20"));
    }

    #[tokio::test]
    async fn write_failure_surfaces_on_the_watch_and_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = WriteQueue::spawn();
        let mut failures = queue.failure_watch();

        let mut sink = ProbeSink::new(log.clone());
        sink.fail_on_write = Some(2);
        queue.open(Box::new(sink));
        queue.push(Bytes::from(vec![0u8; 10]));
        queue.push(Bytes::from(vec![0u8; 20]));

        failures
            .wait_for(|failure| failure.is_some())
            .await
            .unwrap();
        assert!(queue.close_file().await.is_err());
    }

    #[tokio::test]
    async fn drain_resolves_with_an_empty_queue() {
        let queue = WriteQueue::spawn();
        queue.drain().await.unwrap();
    }
}

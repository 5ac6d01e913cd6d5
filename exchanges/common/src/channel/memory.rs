//! In-process loopback channel and rendezvous broker.
//!
//! The loopback pair backs tests and single-process deployments. Each
//! direction runs a forwarding task between the sender's outbound queue and
//! the peer's inbound queue; bytes sitting in the outbound queue are what
//! `buffered_amount` reports. An optional throttle meters the forwarding
//! rate, simulating link bandwidth so flow-control behaviour is observable
//! without a network.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::{
    config::NetworkClass,
    error::TransferError,
    frames::{self, ControlFrame},
};

use super::{
    Channel, ChannelClosed, CloseReason, InboundFrame, Listener, Rendezvous,
};

/// Simulated link speed: at most `quantum` bytes forwarded per `interval`.
#[derive(Clone, Copy, Debug)]
pub struct LinkThrottle {
    pub quantum: u64,
    pub interval: Duration,
}

enum Item {
    Frame(InboundFrame, u64),
    Close,
}

struct Outbound {
    buffered: AtomicU64,
    drained: Notify,
    closed: AtomicBool,
}

/// One half of an in-process channel pair.
#[derive(Clone)]
pub struct MemoryChannel {
    class: NetworkClass,
    out: Arc<Outbound>,
    out_tx: mpsc::UnboundedSender<Item>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<InboundFrame>>>,
}

/// Creates a connected pair of channels with an unthrottled link.
pub fn pair(class: NetworkClass) -> (MemoryChannel, MemoryChannel) {
    pair_throttled(class, None)
}

/// Creates a connected pair whose link forwards at the given rate.
pub fn pair_throttled(
    class: NetworkClass,
    throttle: Option<LinkThrottle>,
) -> (MemoryChannel, MemoryChannel) {
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
    let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

    let a_out = Arc::new(Outbound {
        buffered: AtomicU64::new(0),
        drained: Notify::new(),
        closed: AtomicBool::new(false),
    });
    let b_out = Arc::new(Outbound {
        buffered: AtomicU64::new(0),
        drained: Notify::new(),
        closed: AtomicBool::new(false),
    });

    tokio::spawn(forward(a_out_rx, b_in_tx, a_out.clone(), throttle));
    tokio::spawn(forward(b_out_rx, a_in_tx, b_out.clone(), throttle));

    let a = MemoryChannel {
        class,
        out: a_out,
        out_tx: a_out_tx,
        inbound: Arc::new(Mutex::new(a_in_rx)),
    };
    let b = MemoryChannel {
        class,
        out: b_out,
        out_tx: b_out_tx,
        inbound: Arc::new(Mutex::new(b_in_rx)),
    };
    (a, b)
}

/// Moves frames from one side's outbound queue to the peer's inbound queue,
/// releasing buffered bytes as they are "handed to the network".
async fn forward(
    mut out_rx: mpsc::UnboundedReceiver<Item>,
    in_tx: mpsc::UnboundedSender<InboundFrame>,
    out: Arc<Outbound>,
    throttle: Option<LinkThrottle>,
) {
    while let Some(item) = out_rx.recv().await {
        let (frame, cost) = match item {
            Item::Frame(frame, cost) => (frame, cost),
            Item::Close => break,
        };

        if let Some(t) = throttle {
            let mut remaining = cost;
            loop {
                tokio::time::sleep(t.interval).await;
                if remaining <= t.quantum {
                    break;
                }
                remaining -= t.quantum;
            }
        }

        out.buffered.fetch_sub(cost, Ordering::AcqRel);
        out.drained.notify_waiters();

        if in_tx.send(frame).is_err() {
            break;
        }
    }

    // Peer gone or close requested: fail subsequent sends and wake any
    // producer parked on the watermark.
    out.closed.store(true, Ordering::Release);
    out.drained.notify_waiters();
}

impl MemoryChannel {
    fn enqueue(&self, frame: InboundFrame, cost: u64) -> Result<(), ChannelClosed> {
        if self.out.closed.load(Ordering::Acquire) {
            return Err(ChannelClosed);
        }
        self.out.buffered.fetch_add(cost, Ordering::AcqRel);
        self.out_tx
            .send(Item::Frame(frame, cost))
            .map_err(|_| {
                self.out.buffered.fetch_sub(cost, Ordering::AcqRel);
                ChannelClosed
            })
    }
}

impl Channel for MemoryChannel {
    fn send_control(&self, frame: ControlFrame) -> Result<(), ChannelClosed> {
        // Cost mirrors what a wire transport would queue for this frame.
        let cost = frames::encode(&frame)
            .map(|body| body.len() as u64 + 4)
            .map_err(|_| ChannelClosed)?;
        self.enqueue(InboundFrame::Control(frame), cost)
    }

    fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed> {
        let cost = data.len() as u64;
        self.enqueue(InboundFrame::Binary(data), cost)
    }

    async fn recv(&self) -> Option<InboundFrame> {
        if self.out.closed.load(Ordering::Acquire) {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    fn buffered_amount(&self) -> u64 {
        self.out.buffered.load(Ordering::Acquire)
    }

    async fn drained_to(&self, low: u64) {
        loop {
            // Arm the waiter before checking, so a notify between the check
            // and the await is not lost.
            let drained = self.out.drained.notified();
            if self.out.closed.load(Ordering::Acquire)
                || self.buffered_amount() <= low
            {
                return;
            }
            drained.await;
        }
    }

    fn network_class(&self) -> NetworkClass {
        self.class
    }

    fn close(&self, reason: CloseReason) {
        tracing::debug!(reason = reason.as_str(), "closing loopback channel");
        self.out.closed.store(true, Ordering::Release);
        let _ = self.out_tx.send(Item::Close);
        self.out.drained.notify_waiters();
    }
}

/// In-process rendezvous registry mapping codes to listeners.
pub struct MemoryBroker {
    class: NetworkClass,
    throttle: Option<LinkThrottle>,
    codes: StdMutex<HashMap<String, mpsc::UnboundedSender<MemoryChannel>>>,
}

impl MemoryBroker {
    /// A broker whose links are host-local and unthrottled.
    pub fn new() -> Self {
        Self::with_link(NetworkClass::Lan, None)
    }

    /// A broker producing channels of the given class and link speed.
    pub fn with_link(
        class: NetworkClass,
        throttle: Option<LinkThrottle>,
    ) -> Self {
        Self {
            class,
            throttle,
            codes: StdMutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener half of a registered code.
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<MemoryChannel>,
}

impl Listener for MemoryListener {
    type Channel = MemoryChannel;

    async fn accept(&mut self) -> Option<MemoryChannel> {
        self.rx.recv().await
    }
}

impl Rendezvous for MemoryBroker {
    type Channel = MemoryChannel;
    type Listener = MemoryListener;

    async fn register(
        &self,
        code: &str,
    ) -> Result<MemoryListener, TransferError> {
        let mut codes = self.codes.lock().unwrap();
        if let Some(existing) = codes.get(code) {
            if !existing.is_closed() {
                return Err(TransferError::CodeInUse);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        codes.insert(code.to_string(), tx);
        tracing::info!(code, "registered rendezvous code");
        Ok(MemoryListener { rx })
    }

    async fn dial(&self, code: &str) -> Result<MemoryChannel, TransferError> {
        let host_tx = {
            let codes = self.codes.lock().unwrap();
            codes
                .get(code)
                .filter(|tx| !tx.is_closed())
                .cloned()
                .ok_or(TransferError::PeerUnavailable)?
        };
        let (host_half, guest_half) = pair_throttled(self.class, self.throttle);
        host_tx
            .send(host_half)
            .map_err(|_| TransferError::PeerUnavailable)?;
        Ok(guest_half)
    }

    async fn release(&self, code: &str) {
        self.codes.lock().unwrap().remove(code);
        tracing::info!(code, "released rendezvous code");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_send_order_across_kinds() {
        let (a, b) = pair(NetworkClass::Lan);
        a.send_control(ControlFrame::Accept).unwrap();
        a.send_binary(Bytes::from_static(b"one")).unwrap();
        a.send_binary(Bytes::from_static(b"two")).unwrap();
        a.send_control(ControlFrame::AllComplete).unwrap();

        assert!(matches!(
            b.recv().await,
            Some(InboundFrame::Control(ControlFrame::Accept))
        ));
        match b.recv().await {
            Some(InboundFrame::Binary(data)) => assert_eq!(&data[..], b"one"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match b.recv().await {
            Some(InboundFrame::Binary(data)) => assert_eq!(&data[..], b"two"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            b.recv().await,
            Some(InboundFrame::Control(ControlFrame::AllComplete))
        ));
    }

    #[tokio::test]
    async fn buffered_amount_tracks_the_throttled_link() {
        let (a, _b) = pair_throttled(
            NetworkClass::Wan,
            Some(LinkThrottle {
                quantum: 1024,
                interval: Duration::from_millis(5),
            }),
        );

        a.send_binary(Bytes::from(vec![0u8; 4096])).unwrap();
        assert_eq!(a.buffered_amount(), 4096);

        a.drained_to(0).await;
        assert_eq!(a.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn close_ends_recv_and_fails_sends() {
        let (a, b) = pair(NetworkClass::Lan);
        a.close(CloseReason::Cancelled);
        assert!(a.send_binary(Bytes::from_static(b"x")).is_err());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_drop_is_observed_as_closed() {
        let (a, b) = pair(NetworkClass::Lan);
        b.close(CloseReason::Done);
        // Give the forwarding tasks a beat to observe the teardown.
        tokio::task::yield_now().await;
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn broker_rejects_duplicate_codes() {
        let broker = MemoryBroker::new();
        let _listener = broker.register("4217").await.unwrap();
        assert!(matches!(
            broker.register("4217").await,
            Err(TransferError::CodeInUse)
        ));
        broker.release("4217").await;
        assert!(broker.register("4217").await.is_ok());
    }

    #[tokio::test]
    async fn broker_dial_reaches_the_listener() {
        let broker = MemoryBroker::new();
        let mut listener = broker.register("0042").await.unwrap();

        let guest = broker.dial("0042").await.unwrap();
        let host = listener.accept().await.unwrap();

        guest.send_control(ControlFrame::Accept).unwrap();
        assert!(matches!(
            host.recv().await,
            Some(InboundFrame::Control(ControlFrame::Accept))
        ));
    }

    #[tokio::test]
    async fn dialing_an_unknown_code_is_unavailable() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.dial("9999").await,
            Err(TransferError::PeerUnavailable)
        ));
    }
}

//! Channel implementation over an iroh QUIC connection.
//!
//! One bidirectional stream carries both frame kinds, each prefixed by a
//! kind byte and a 4-byte big-endian length. The host (rendezvous holder)
//! opens the stream so its `MANIFEST` is the first thing on the wire; the
//! guest accepts it.
//!
//! A writer task drains an unbounded outbound queue and accounts for what it
//! has not yet written; that count is `buffered_amount`. A reader task
//! parses inbound frames and hands them to `recv`.
//!
//! Mapping a rendezvous code to a node ticket is the broker's job, modelled
//! by [`TicketDirectory`]. The code is also baked into the ALPN, so a guest
//! holding a stale ticket but the wrong code cannot connect.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use iroh::{
    Endpoint, Watcher,
    endpoint::{Connection, RecvStream, SendStream, VarInt},
    protocol::{AcceptError, ProtocolHandler, Router},
};
use iroh_base::ticket::NodeTicket;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, warn};

use crate::{
    config::NetworkClass,
    error::TransferError,
    frames::{self, ControlFrame},
};

use super::{
    Channel, ChannelClosed, CloseReason, InboundFrame, Listener, Rendezvous,
};

const KIND_CONTROL: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Upper bound on a single binary frame; anything larger is a protocol
/// violation (well above any configured chunk size).
const MAX_BINARY_FRAME: usize = 16 * 1024 * 1024;

fn alpn_for(code: &str) -> Vec<u8> {
    format!("aerodrop/{code}").into_bytes()
}

fn broker_err(e: impl std::fmt::Display) -> TransferError {
    TransferError::Broker(e.to_string())
}

/// The external broker interface: publish a ticket under a short code,
/// look one up, withdraw it.
#[async_trait]
pub trait TicketDirectory: Send + Sync {
    /// Publishes `ticket` under `code`. Fails with
    /// [`TransferError::CodeInUse`] when the code is taken.
    async fn publish(&self, code: &str, ticket: &str)
    -> Result<(), TransferError>;

    /// Resolves `code` to a ticket. Fails with
    /// [`TransferError::PeerUnavailable`] when nobody holds the code.
    async fn lookup(&self, code: &str) -> Result<String, TransferError>;

    /// Withdraws a published code.
    async fn withdraw(&self, code: &str);
}

struct Shared {
    buffered: AtomicU64,
    drained: Notify,
    closed: AtomicBool,
}

/// A [`Channel`] running over one iroh QUIC connection.
#[derive(Clone)]
pub struct QuicChannel {
    class: NetworkClass,
    connection: Connection,
    endpoint: Option<Endpoint>,
    shared: Arc<Shared>,
    out_tx: mpsc::UnboundedSender<(u8, Bytes)>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<InboundFrame>>>,
}

impl QuicChannel {
    /// Host side: opens the frame stream on an accepted connection.
    pub async fn host_open(
        connection: Connection,
        class: NetworkClass,
    ) -> Result<Self, TransferError> {
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        Ok(Self::spawn_io(connection, None, send, recv, class))
    }

    /// Guest side: accepts the frame stream on a dialed connection.
    ///
    /// `endpoint` is retained so the connection outlives the dial; it is
    /// closed when the channel closes.
    pub async fn guest_accept(
        connection: Connection,
        endpoint: Endpoint,
        class: NetworkClass,
    ) -> Result<Self, TransferError> {
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        Ok(Self::spawn_io(connection, Some(endpoint), send, recv, class))
    }

    fn spawn_io(
        connection: Connection,
        endpoint: Option<Endpoint>,
        send: SendStream,
        recv: RecvStream,
        class: NetworkClass,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffered: AtomicU64::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(send, out_rx, shared.clone()));
        tokio::spawn(read_loop(recv, in_tx));

        Self {
            class,
            connection,
            endpoint,
            shared,
            out_tx,
            inbound: Arc::new(Mutex::new(in_rx)),
        }
    }

    fn enqueue(&self, kind: u8, payload: Bytes) -> Result<(), ChannelClosed> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelClosed);
        }
        let cost = payload.len() as u64 + 5;
        self.shared.buffered.fetch_add(cost, Ordering::AcqRel);
        self.out_tx.send((kind, payload)).map_err(|_| {
            self.shared.buffered.fetch_sub(cost, Ordering::AcqRel);
            ChannelClosed
        })
    }
}

async fn write_loop(
    mut send: SendStream,
    mut out_rx: mpsc::UnboundedReceiver<(u8, Bytes)>,
    shared: Arc<Shared>,
) {
    while let Some((kind, payload)) = out_rx.recv().await {
        let cost = payload.len() as u64 + 5;
        let mut header = [0u8; 5];
        header[0] = kind;
        header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        if send.write_all(&header).await.is_err()
            || send.write_all(&payload).await.is_err()
        {
            break;
        }

        shared.buffered.fetch_sub(cost, Ordering::AcqRel);
        shared.drained.notify_waiters();
    }

    let _ = send.finish();
    shared.closed.store(true, Ordering::Release);
    shared.drained.notify_waiters();
}

async fn read_loop(
    mut recv: RecvStream,
    in_tx: mpsc::UnboundedSender<InboundFrame>,
) {
    loop {
        let mut header = [0u8; 5];
        if recv.read_exact(&mut header).await.is_err() {
            break;
        }
        let kind = header[0];
        let len =
            u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        if len > MAX_BINARY_FRAME {
            warn!(len, "inbound frame exceeds the size limit, dropping channel");
            break;
        }

        let mut payload = vec![0u8; len];
        if recv.read_exact(&mut payload).await.is_err() {
            break;
        }

        let frame = match kind {
            KIND_CONTROL => match frames::decode(&payload) {
                Ok(frame) => InboundFrame::Control(frame),
                Err(e) => {
                    warn!("dropping channel on malformed control frame: {e}");
                    break;
                }
            },
            KIND_BINARY => InboundFrame::Binary(Bytes::from(payload)),
            other => {
                warn!(kind = other, "unknown frame kind, dropping channel");
                break;
            }
        };

        if in_tx.send(frame).is_err() {
            break;
        }
    }
}

impl Channel for QuicChannel {
    fn send_control(&self, frame: ControlFrame) -> Result<(), ChannelClosed> {
        let body = frames::encode(&frame).map_err(|_| ChannelClosed)?;
        self.enqueue(KIND_CONTROL, Bytes::from(body))
    }

    fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed> {
        self.enqueue(KIND_BINARY, data)
    }

    async fn recv(&self) -> Option<InboundFrame> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    fn buffered_amount(&self) -> u64 {
        self.shared.buffered.load(Ordering::Acquire)
    }

    async fn drained_to(&self, low: u64) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.closed.load(Ordering::Acquire)
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
        debug!(reason = reason.as_str(), "closing quic channel");
        self.shared.closed.store(true, Ordering::Release);
        self.shared.drained.notify_waiters();
        self.connection.close(
            VarInt::from_u32(reason.code()),
            reason.as_str().as_bytes(),
        );
        if let Some(endpoint) = self.endpoint.clone() {
            tokio::spawn(async move {
                endpoint.close().await;
            });
        }
    }
}

/// Protocol handler pushing accepted connections to the listener.
#[derive(Debug)]
struct InboundChannels {
    conn_tx: mpsc::UnboundedSender<QuicChannel>,
    class: NetworkClass,
}

impl ProtocolHandler for InboundChannels {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let conn_tx = self.conn_tx.clone();
        let class = self.class;
        async move {
            info!("accepting inbound connection");
            let channel = QuicChannel::host_open(connection.clone(), class)
                .await
                .map_err(|_| AcceptError::NotAllowed {})?;
            conn_tx
                .send(channel)
                .map_err(|_| AcceptError::NotAllowed {})?;
            // Keep the connection alive until either side closes it; the
            // router tears down connections whose accept future resolves.
            let _ = connection.closed().await;
            Ok(())
        }
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Listener half of a published code.
pub struct QuicListener {
    router: Router,
    ticket: String,
    conn_rx: mpsc::UnboundedReceiver<QuicChannel>,
}

impl QuicListener {
    /// The node ticket the broker published for this registration.
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Shuts the router down, refusing further connections.
    pub async fn shutdown(self) {
        let _ = self.router.shutdown().await;
    }
}

impl Listener for QuicListener {
    type Channel = QuicChannel;

    async fn accept(&mut self) -> Option<QuicChannel> {
        self.conn_rx.recv().await
    }
}

/// [`Rendezvous`] over iroh endpoints and an external ticket directory.
pub struct QuicRendezvous {
    directory: Arc<dyn TicketDirectory>,
    class: NetworkClass,
}

impl QuicRendezvous {
    pub fn new(directory: Arc<dyn TicketDirectory>) -> Self {
        Self {
            directory,
            class: NetworkClass::Wan,
        }
    }

    /// Overrides the network class reported by produced channels.
    pub fn with_class(mut self, class: NetworkClass) -> Self {
        self.class = class;
        self
    }
}

impl Rendezvous for QuicRendezvous {
    type Channel = QuicChannel;
    type Listener = QuicListener;

    async fn register(
        &self,
        code: &str,
    ) -> Result<QuicListener, TransferError> {
        let endpoint = Endpoint::builder()
            .discovery_n0()
            .bind()
            .await
            .map_err(broker_err)?;
        let node_addr = endpoint.node_addr().initialized().await;
        let ticket = NodeTicket::new(node_addr).to_string();

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let handler = InboundChannels {
            conn_tx,
            class: self.class,
        };
        let router = Router::builder(endpoint)
            .accept(alpn_for(code), handler)
            .spawn();

        if let Err(e) = self.directory.publish(code, &ticket).await {
            let _ = router.shutdown().await;
            return Err(e);
        }
        info!(code, "published rendezvous ticket");

        Ok(QuicListener {
            router,
            ticket,
            conn_rx,
        })
    }

    async fn dial(&self, code: &str) -> Result<QuicChannel, TransferError> {
        let ticket: NodeTicket = self
            .directory
            .lookup(code)
            .await?
            .parse()
            .map_err(broker_err)?;

        let endpoint = Endpoint::builder()
            .discovery_n0()
            .bind()
            .await
            .map_err(broker_err)?;
        let connection = endpoint
            .connect(ticket, &alpn_for(code))
            .await
            .map_err(|_| TransferError::PeerUnavailable)?;

        QuicChannel::guest_accept(connection, endpoint, self.class).await
    }

    async fn release(&self, code: &str) {
        self.directory.withdraw(code).await;
    }
}

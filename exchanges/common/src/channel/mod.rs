//! The transport abstraction the transfer engine is written against.
//!
//! A channel is a reliable, ordered, bidirectional carrier of two frame
//! kinds: control frames (small structured records) and binary frames
//! (opaque byte buffers). Control and binary frames are totally ordered with
//! respect to each other. Channels are cheap-to-clone handles; sends enqueue
//! without suspending, and `buffered_amount` reports what has been enqueued
//! but not yet handed to the network, which is the quantity the producer's
//! flow control watches.
//!
//! Two implementations ship here: an in-process loopback pair with a
//! rendezvous broker ([`memory`]), and an adapter over an iroh QUIC
//! connection ([`quic`]).

pub mod memory;
pub mod quic;

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;

use crate::{
    config::NetworkClass, error::TransferError, frames::ControlFrame,
};

/// An inbound frame, tagged by kind.
#[derive(Clone, Debug)]
pub enum InboundFrame {
    Control(ControlFrame),
    Binary(Bytes),
}

/// Why a peer is closing its end of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The session ran to completion.
    Done,
    /// The session was cancelled.
    Cancelled,
    /// The session was refused.
    Rejected,
    /// The peer violated the protocol.
    ProtocolError,
    /// Local failure unrelated to the protocol.
    Error,
}

impl CloseReason {
    /// Application close code used by wire transports.
    pub fn code(self) -> u32 {
        match self {
            CloseReason::Done => 200,
            CloseReason::Cancelled => 0,
            CloseReason::Rejected => 403,
            CloseReason::ProtocolError => 400,
            CloseReason::Error => 500,
        }
    }

    /// Human-readable close reason used by wire transports.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Done => "finished",
            CloseReason::Cancelled => "cancelled",
            CloseReason::Rejected => "rejected",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::Error => "error",
        }
    }
}

/// Error returned by sends once the channel has closed.
#[derive(Clone, Copy, Debug, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// A reliable-ordered duplex frame channel.
///
/// Handles are `Clone`; all clones refer to the same underlying channel.
/// Exactly one task should call `recv` at a time.
pub trait Channel: Clone + Send + Sync + 'static {
    /// Enqueues a control frame for in-order delivery.
    fn send_control(&self, frame: ControlFrame) -> Result<(), ChannelClosed>;

    /// Enqueues opaque bytes for in-order delivery, interleaved with control
    /// frames but preserving total order.
    fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed>;

    /// Next inbound frame, or `None` once the channel is closed or lost.
    fn recv(&self) -> impl Future<Output = Option<InboundFrame>> + Send;

    /// Bytes enqueued locally but not yet handed to the network.
    fn buffered_amount(&self) -> u64;

    /// Suspends until `buffered_amount()` is at most `low`.
    fn drained_to(&self, low: u64) -> impl Future<Output = ()> + Send;

    /// Coarse classification of the path this channel runs over.
    fn network_class(&self) -> NetworkClass;

    /// Closes the channel. Frames still queued are not guaranteed delivery.
    fn close(&self, reason: CloseReason);
}

/// Accepts inbound channels for a registered rendezvous code.
pub trait Listener: Send + 'static {
    type Channel: Channel;

    /// Next inbound channel, or `None` once the registration is withdrawn.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Option<Self::Channel>> + Send;
}

/// The rendezvous surface the session managers are written against:
/// register under a code as host, or connect to a peer by code as guest.
pub trait Rendezvous: Send + Sync + 'static {
    type Channel: Channel;
    type Listener: Listener<Channel = Self::Channel>;

    /// Registers `code` and returns a listener for inbound channels.
    /// Fails with [`TransferError::CodeInUse`] when the code is taken.
    fn register(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Self::Listener, TransferError>> + Send;

    /// Dials the peer registered under `code`. A single attempt; retry
    /// policy lives with the caller. Fails with
    /// [`TransferError::PeerUnavailable`] when nobody holds the code.
    fn dial(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransferError>> + Send;

    /// Withdraws a registration, releasing the code.
    fn release(&self, code: &str) -> impl Future<Output = ()> + Send;
}

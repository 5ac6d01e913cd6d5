//! Typed errors surfaced by the transfer engine.

use thiserror::Error;

use crate::frames::RejectReason;

/// Errors surfaced by session managers and protocol handlers.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The rendezvous code is already registered at the broker.
    #[error("rendezvous code already in use")]
    CodeInUse,

    /// The rendezvous code is not four decimal digits.
    #[error("rendezvous code must be four decimal digits")]
    InvalidCode,

    /// No peer answered the dial after the retry budget.
    #[error("peer unavailable")]
    PeerUnavailable,

    /// No control frame arrived within the connect budget.
    #[error("timed out waiting for the peer")]
    ConnectTimeout,

    /// The channel closed or was lost.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer refused the session.
    #[error("rejected by peer: {0}")]
    Rejected(RejectReason),

    /// The session was cancelled.
    #[error("transfer cancelled")]
    Cancelled,

    /// An unexpected or malformed frame for the current phase.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The receiving sink failed to accept bytes.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// The rendezvous broker misbehaved.
    #[error("broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cloneable terminal reason carried inside `Phase::Failed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// Connect timeout elapsed.
    Timeout,
    /// Peer unavailable after retries.
    Unavailable,
    /// Channel lost mid-transfer; receiver-side state stays recoverable.
    ChannelLost,
    /// Peer sent `REJECT`.
    Rejected(RejectReason),
    /// Out of space, permissions, or any other sink write failure.
    DiskWrite(String),
    /// Unexpected frame for the current phase, or malformed payload.
    Protocol(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Unavailable => write!(f, "unavailable"),
            FailureReason::ChannelLost => write!(f, "channel_closed"),
            FailureReason::Rejected(reason) => write!(f, "rejected:{reason}"),
            FailureReason::DiskWrite(detail) => {
                write!(f, "disk_write:{detail}")
            }
            FailureReason::Protocol(detail) => write!(f, "protocol:{detail}"),
        }
    }
}

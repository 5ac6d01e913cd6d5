//! Control frames exchanged between sender and receiver, and their codec.
//!
//! Control frames are structured records with a `type` discriminator and a
//! `payload` object. On byte-stream transports each frame travels as a 4-byte
//! big-endian length prefix followed by the JSON body; the in-process
//! loopback passes the values directly. Binary frames are raw bytes and never
//! pass through this module.

use serde::{Deserialize, Serialize};

use crate::{error::TransferError, manifest::TransferManifest};

/// Upper bound on the serialized size of a single control frame.
///
/// Manifests dominate; a megabyte covers tens of thousands of entries.
pub const MAX_CONTROL_FRAME: usize = 1024 * 1024;

/// Why a session was refused before or during negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The rendezvous deadline has passed.
    Expired,
    /// The sender is already serving another peer.
    Busy,
    /// Free-form reason passed through from the peer.
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Expired => write!(f, "expired"),
            RejectReason::Busy => write!(f, "busy"),
            RejectReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// The fixed control-frame set of the transfer protocol.
///
/// Directionality and ordering semantics:
/// - `Manifest` is the first frame after channel open (sender to receiver)
///   and is sent exactly once per session.
/// - `Accept` / `Resume` are the receiver's go-ahead; `Resume` carries the
///   seed the producer must honour.
/// - `FileStart` precedes the binary frames of a file; `FileComplete` follows
///   the last one. The channel's total ordering makes a separate end-of-file
///   marker unnecessary.
/// - `Cancel` may flow in either direction at any time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlFrame {
    Manifest(TransferManifest),
    Reject {
        reason: RejectReason,
    },
    Accept,
    Resume {
        file_index: usize,
        byte_offset: u64,
    },
    FileStart {
        file_index: usize,
        path: String,
        size: u64,
    },
    FileComplete {
        file_index: usize,
    },
    AllComplete,
    Cancel {
        reason: Option<String>,
    },
}

/// Serializes a control frame to its JSON body (no length prefix).
pub fn encode(frame: &ControlFrame) -> Result<Vec<u8>, TransferError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| TransferError::Protocol(format!("encode: {e}")))?;
    if body.len() > MAX_CONTROL_FRAME {
        return Err(TransferError::Protocol(format!(
            "control frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_CONTROL_FRAME
        )));
    }
    Ok(body)
}

/// Parses a control frame from its JSON body.
pub fn decode(body: &[u8]) -> Result<ControlFrame, TransferError> {
    if body.len() > MAX_CONTROL_FRAME {
        return Err(TransferError::Protocol(format!(
            "control frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_CONTROL_FRAME
        )));
    }
    serde_json::from_slice(body)
        .map_err(|e| TransferError::Protocol(format!("malformed frame: {e}")))
}

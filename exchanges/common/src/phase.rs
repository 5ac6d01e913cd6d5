//! Protocol phases shared by both peers.

use crate::error::FailureReason;

/// The session phase on either peer.
///
/// `Completed`, `Cancelled`, `Expired`, and `Failed` are terminal. `Expired`
/// is reachable only on the sender (the rendezvous holder).
#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    Idle,
    AwaitingPeer,
    Negotiating,
    Accepted,
    Streaming,
    Completed,
    Cancelled,
    Expired,
    Failed(FailureReason),
}

impl Phase {
    /// Terminal phases admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed
                | Phase::Cancelled
                | Phase::Expired
                | Phase::Failed(_)
        )
    }

    /// Phases during which a peer is attached.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Negotiating | Phase::Accepted | Phase::Streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(Phase::Expired.is_terminal());
        assert!(Phase::Failed(FailureReason::Timeout).is_terminal());
        assert!(!Phase::Idle.is_terminal());
        assert!(!Phase::AwaitingPeer.is_terminal());
        assert!(!Phase::Streaming.is_terminal());
    }
}

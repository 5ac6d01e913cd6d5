//! Hooks into the hosting environment.
//!
//! The engine itself has no UI, but the environment embedding it usually
//! does: a sender should warn before window teardown while a transfer is
//! live, and a receiver should keep the device awake while streaming. Both
//! are modelled as a trait the session managers invoke on phase changes;
//! every method has a no-op default.

use std::sync::Arc;

/// Environment integration invoked by the session managers.
pub trait HostHooks: Send + Sync {
    /// Engaged while a sender session is neither idle nor completed. Hosts
    /// may surface a teardown warning while engaged.
    fn set_teardown_guard(&self, engaged: bool) {
        let _ = engaged;
    }

    /// Requested while the receiver is streaming.
    fn acquire_wake_lock(&self) {}

    /// Released on any terminal state.
    fn release_wake_lock(&self) {}
}

/// The default hooks: do nothing.
pub struct NoopHostHooks;

impl HostHooks for NoopHostHooks {}

/// Convenience constructor for the default hooks.
pub fn noop_hooks() -> Arc<dyn HostHooks> {
    Arc::new(NoopHostHooks)
}

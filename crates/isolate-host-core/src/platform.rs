//! Process-wide platform services.
//!
//! The [`Platform`] records which event loop serves each live isolate.
//! Owning main instances register their isolate themselves; callers that
//! attach an instance to their own isolate register it beforehand.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::{EventLoop, EventLoopId, Isolate, IsolateId};

/// Shared handle to the platform's isolate registry.
///
/// Cloning is cheap and every clone sees the same registry.
#[derive(Debug, Clone, Default)]
pub struct Platform {
    isolates: Arc<DashMap<IsolateId, EventLoopId>>,
}

impl Platform {
    /// Create an empty platform.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `isolate` with `event_loop`.
    ///
    /// # Panics
    ///
    /// Panics if the isolate is already registered.
    pub fn register_isolate(&self, isolate: &Isolate, event_loop: &EventLoop) {
        let previous = self.isolates.insert(isolate.id(), event_loop.id());
        assert!(
            previous.is_none(),
            "isolate {} registered with the platform twice",
            isolate.id()
        );

        debug!(
            isolate_id = %isolate.id(),
            event_loop_id = %event_loop.id(),
            "Isolate registered"
        );
    }

    /// Remove `isolate` from the registry.
    ///
    /// # Panics
    ///
    /// Panics if the isolate was never registered.
    pub fn unregister_isolate(&self, isolate: &Isolate) {
        assert!(
            self.isolates.remove(&isolate.id()).is_some(),
            "isolate {} unregistered without being registered",
            isolate.id()
        );

        debug!(isolate_id = %isolate.id(), "Isolate unregistered");
    }

    /// Returns `true` if the isolate is registered.
    pub fn is_registered(&self, id: IsolateId) -> bool {
        self.isolates.contains_key(&id)
    }

    /// Event loop serving the isolate, if registered.
    pub fn event_loop_of(&self, id: IsolateId) -> Option<EventLoopId> {
        self.isolates.get(&id).map(|entry| *entry.value())
    }

    /// Number of registered isolates.
    pub fn registered_count(&self) -> usize {
        self.isolates.len()
    }
}

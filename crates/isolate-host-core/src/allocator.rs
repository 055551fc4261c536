//! Linear memory accounting for an isolate.
//!
//! - [`Allocator`]: Shared byte budget for every environment on one isolate
//! - [`AllocatorLimiter`]: Per-store [`ResourceLimiter`] charging that budget

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};
use wasmtime::ResourceLimiter;

/// Byte budget for the linear memories an isolate hands out.
///
/// The allocator is created together with the isolate and must outlive
/// every store charged against it. Stores hold it through an
/// [`AllocatorLimiter`], which is why it is always shared via [`Arc`].
#[derive(Debug)]
pub struct Allocator {
    limit: usize,
    reserved: AtomicUsize,
}

impl Allocator {
    /// Create an allocator that hands out at most `limit` bytes.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            reserved: AtomicUsize::new(0),
        })
    }

    /// Maximum number of bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently reserved.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.reserved())
    }

    /// Reserve `bytes`, returning `false` if the budget would be exceeded.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    /// Return `bytes` previously obtained from [`Allocator::try_reserve`].
    pub fn release(&self, bytes: usize) {
        let previous = self.reserved.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "allocator released more than reserved");
    }
}

/// Resource limiter that charges memory growth to an [`Allocator`].
///
/// Installed on every environment store. Whatever the store reserved is
/// returned to the allocator when the limiter is dropped together with
/// the store.
#[derive(Debug)]
pub struct AllocatorLimiter {
    allocator: Arc<Allocator>,
    charged: usize,
}

impl AllocatorLimiter {
    /// Create a limiter charging `allocator`.
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            charged: 0,
        }
    }

    /// Bytes this limiter has reserved.
    pub fn charged(&self) -> usize {
        self.charged
    }
}

impl ResourceLimiter for AllocatorLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if maximum.is_some_and(|max| desired > max) {
            return Ok(false);
        }

        let delta = desired.saturating_sub(current);
        if !self.allocator.try_reserve(delta) {
            warn!(
                requested = delta,
                available = self.allocator.available(),
                "Allocator exhausted, denying memory growth"
            );
            return Ok(false);
        }

        self.charged += delta;
        debug!(current, desired, "Linear memory grown");
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(maximum.is_none_or(|max| desired <= max))
    }
}

impl Drop for AllocatorLimiter {
    fn drop(&mut self) {
        self.allocator.release(self.charged);
    }
}

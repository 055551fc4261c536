//! Engine execution contexts ("isolates").
//!
//! An [`Isolate`] is a configured Wasmtime [`Engine`] bound to the
//! [`Allocator`] that budgets its linear memory. Code running on an isolate
//! must do so from the thread that entered it (see [`Isolate::enter`]).

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use isolate_host_common::{IsolateConfig, RuntimeError};

use crate::Allocator;

/// Unique identifier of an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsolateId(Uuid);

impl IsolateId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct EntryState {
    thread: Option<ThreadId>,
    depth: usize,
}

/// An isolated engine instance with its own allocator.
///
/// # Entering
///
/// Exactly one thread may have the isolate entered at a time. Entry is
/// re-entrant on that thread; entering from another thread while it is
/// held panics.
pub struct Isolate {
    id: IsolateId,
    engine: Engine,
    allocator: Arc<Allocator>,
    config: IsolateConfig,
    entry: Mutex<EntryState>,
}

impl Isolate {
    /// Allocate and initialize an isolate from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::IsolateCreation`] if the engine rejects the
    /// configuration or the pooling allocator cannot reserve its slots.
    /// There is no fallback for this: without an isolate nothing can run.
    pub fn new(config: &IsolateConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Guest code is driven by the instance's event loop
        wasmtime_config.async_support(true);

        wasmtime_config.consume_fuel(config.consume_fuel);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::isolate_creation(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let allocator = Allocator::new(config.heap_limit_bytes());
        let id = IsolateId::new();

        info!(
            isolate_id = %id,
            heap_limit_mb = config.heap_limit_mb,
            consume_fuel = config.consume_fuel,
            "Isolate created"
        );

        Ok(Self {
            id,
            engine,
            allocator,
            config: config.clone(),
            entry: Mutex::new(EntryState::default()),
        })
    }

    fn create_pooling_config(config: &IsolateConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_component_instances(config.max_instances);
        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Enter the isolate on the current thread.
    ///
    /// The returned scope exits when dropped. Scopes nest on the same thread.
    ///
    /// # Panics
    ///
    /// Panics if another thread currently has the isolate entered.
    pub fn enter(&self) -> IsolateScope<'_> {
        let current = thread::current().id();
        let mut entry = self.entry.lock();

        match entry.thread {
            Some(owner) if owner != current => {
                panic!(
                    "isolate {} entered from {current:?} while held by {owner:?}",
                    self.id
                );
            }
            _ => {
                entry.thread = Some(current);
                entry.depth += 1;
            }
        }

        debug!(isolate_id = %self.id, depth = entry.depth, "Isolate entered");

        IsolateScope {
            isolate: self,
            _not_send: PhantomData,
        }
    }

    fn exit(&self) {
        let mut entry = self.entry.lock();
        entry.depth -= 1;
        if entry.depth == 0 {
            entry.thread = None;
        }

        debug!(isolate_id = %self.id, depth = entry.depth, "Isolate exited");
    }

    /// Returns `true` if the current thread has the isolate entered.
    pub fn is_entered(&self) -> bool {
        self.entry.lock().thread == Some(thread::current().id())
    }

    /// Get the isolate identifier.
    pub fn id(&self) -> IsolateId {
        self.id
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the allocator this isolate was created with.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Get the configuration this isolate was created with.
    pub fn config(&self) -> &IsolateConfig {
        &self.config
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id)
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("heap_limit_mb", &self.config.heap_limit_mb)
            .finish_non_exhaustive()
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        debug!(isolate_id = %self.id, "Isolate disposed");
    }
}

/// Guard returned by [`Isolate::enter`]; exits the isolate on drop.
///
/// Must be dropped on the thread that created it.
#[must_use = "the isolate is exited as soon as the scope is dropped"]
pub struct IsolateScope<'a> {
    isolate: &'a Isolate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for IsolateScope<'_> {
    fn drop(&mut self) {
        self.isolate.exit();
    }
}

impl fmt::Debug for IsolateScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateScope")
            .field("isolate", &self.isolate.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> IsolateConfig {
        IsolateConfig {
            pooling_allocator: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_isolate_creation() {
        let isolate = Isolate::new(&test_config()).unwrap();

        assert!(!isolate.config().pooling_allocator);
        assert_eq!(isolate.allocator().limit(), 512 * 1024 * 1024);
        assert_eq!(isolate.allocator().reserved(), 0);
    }

    #[test]
    fn test_isolate_creation_with_pooling() {
        let config = IsolateConfig {
            pooling_allocator: true,
            max_instances: 2,
            instance_memory_mb: 1,
            ..Default::default()
        };

        let isolate = Isolate::new(&config);
        assert!(isolate.is_ok());
    }

    #[test]
    fn test_isolate_ids_are_unique() {
        let a = Isolate::new(&test_config()).unwrap();
        let b = Isolate::new(&test_config()).unwrap();

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_enter_and_exit() {
        let isolate = Isolate::new(&test_config()).unwrap();
        assert!(!isolate.is_entered());

        let outer = isolate.enter();
        assert!(isolate.is_entered());

        let inner = isolate.enter();
        drop(inner);
        assert!(isolate.is_entered());

        drop(outer);
        assert!(!isolate.is_entered());
    }

    #[test]
    fn test_entry_is_per_thread() {
        let isolate = Isolate::new(&test_config()).unwrap();
        let _scope = isolate.enter();

        thread::scope(|s| {
            let seen = s.spawn(|| isolate.is_entered()).join().unwrap();
            assert!(!seen);
        });
    }

    #[test]
    fn test_enter_from_second_thread_panics() {
        let isolate = Isolate::new(&test_config()).unwrap();
        let _scope = isolate.enter();

        thread::scope(|s| {
            let result = s.spawn(|| drop(isolate.enter())).join();
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_isolate_debug() {
        let isolate = Isolate::new(&test_config()).unwrap();

        let debug_str = format!("{isolate:?}");
        assert!(debug_str.contains("Isolate"));
        assert!(debug_str.contains("heap_limit_mb"));
    }
}

//! Isolate lifecycle for isolate-host.
//!
//! This crate hosts a single embedded engine instance:
//! - [`Isolate`]: Engine execution context with its [`Allocator`]
//! - [`SnapshotSource`]: Optional precompiled startup state and its [`IndexTable`]
//! - [`IsolateData`]: Per-isolate data, deserialized or built fresh
//! - [`MainInstance`]: Creates, runs, and tears down the main environment
//! - [`RuntimeEnvironment`]: One bootstrap instance bound to an [`EventLoop`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           Isolate (owned or borrowed) + Allocator       │
//! │  - Wasmtime engine                                      │
//! │  - Entered by one thread at a time                      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     IsolateData                         │
//! │  - Bootstrap module (from snapshot or compiled)         │
//! │  - Per-isolate exports, restored by index               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        RuntimeEnvironment (Store + Instance)            │
//! │  - argv, WASI, guest logs                               │
//! │  - Driven by the EventLoop until quiescence             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Teardown runs bottom-up: environments, then isolate data, then the
//! isolate if the main instance owns it.

pub mod allocator;
pub mod environment;
pub mod event_loop;
pub mod index_table;
pub mod isolate;
pub mod isolate_data;
pub mod main_instance;
pub mod module;
pub mod platform;
pub mod snapshot;

pub use allocator::{Allocator, AllocatorLimiter};
pub use environment::{EnvironmentContext, ExecutionMetrics, LogEntry, LogLevel, RuntimeEnvironment};
pub use event_loop::{EventLoop, EventLoopId};
pub use index_table::IndexTable;
pub use isolate::{Isolate, IsolateId, IsolateScope};
pub use isolate_data::IsolateData;
pub use main_instance::MainInstance;
pub use module::{Bootstrap, CompiledModule};
pub use platform::Platform;
pub use snapshot::{BuildConfig, SnapshotBlob, SnapshotSource};

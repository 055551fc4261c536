//! Host functions exposed to guest code by isolate-host.
//!
//! Register them on a main instance before creating its environment:
//!
//! ```ignore
//! isolate_host_bindings::register_all(instance.linker_mut())?;
//! ```
//!
//! # Interfaces
//!
//! - [`logging`]: Structured logging from guest code (`env::log`)

pub mod linker;
pub mod logging;

pub use linker::register_all;
pub use logging::LoggingHost;

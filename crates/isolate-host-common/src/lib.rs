//! Common types, errors, and configuration for isolate-host.
//!
//! This crate provides shared functionality used across the isolate-host workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for isolate and execution settings
//! - Exit codes reported by the main instance

pub mod config;
pub mod config_file;
pub mod error;
pub mod exit_code;

pub use config::{ExecutionConfig, IsolateConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, StartupConfig};
pub use error::RuntimeError;
pub use exit_code::ExitCode;

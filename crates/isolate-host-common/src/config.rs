//! Configuration structures for isolate-host.
//!
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`IsolateConfig`]: Engine creation parameters (allocator, fuel, pooling)
//! - [`ExecutionConfig`]: Per-environment execution limits

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from TOML (see [`crate::config_file::ConfigFile`]) or JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Isolate creation parameters.
    #[serde(default)]
    pub isolate: IsolateConfig,

    /// Per-environment execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Parameters used to allocate and initialize an isolate.
///
/// Two isolates built from equal parameters produce compatible compiled
/// code, which is what makes a snapshot from one loadable by the other.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IsolateConfig {
    /// Use the pooling instance allocator.
    ///
    /// Pre-reserves slots for `max_instances` instances. Worth it when
    /// environments are created repeatedly on the same isolate.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Instance slots in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Linear memory per pool slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Total linear memory the isolate's allocator may hand out, in megabytes.
    #[serde(default = "defaults::heap_limit_mb")]
    pub heap_limit_mb: u32,

    /// Compile guest code with fuel metering.
    #[serde(default = "defaults::consume_fuel")]
    pub consume_fuel: bool,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            heap_limit_mb: defaults::heap_limit_mb(),
            consume_fuel: defaults::consume_fuel(),
        }
    }
}

impl IsolateConfig {
    /// Allocator limit in bytes.
    pub fn heap_limit_bytes(&self) -> usize {
        (self.heap_limit_mb as usize) * 1024 * 1024
    }
}

/// Per-environment execution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fuel granted to each environment.
    ///
    /// Only effective when the isolate was created with `consume_fuel`.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Fuel consumed between yields back to the event loop.
    ///
    /// `None` lets guest code run uninterrupted until it returns.
    #[serde(default = "defaults::fuel_yield_interval")]
    pub fuel_yield_interval: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_yield_interval: defaults::fuel_yield_interval(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn heap_limit_mb() -> u32 {
        512
    }

    pub const fn consume_fuel() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn fuel_yield_interval() -> Option<u64> {
        Some(10_000)
    }
}

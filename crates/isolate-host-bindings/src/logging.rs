//! Logging host function implementation.
//!
//! Guest log lines are kept on the [`EnvironmentContext`] and also emitted
//! through `tracing`.

use isolate_host_core::{EnvironmentContext, LogLevel};
use tracing::{debug, error, info, warn};

/// Host implementation for the logging interface.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(ctx: &mut EnvironmentContext, level: LogLevel, message: &str) {
        ctx.log(level, message.to_string());

        let environment_id = &ctx.environment_id;
        match level {
            LogLevel::Debug => debug!(environment_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(environment_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(environment_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(environment_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values map to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

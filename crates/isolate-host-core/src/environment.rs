//! Runtime environments: one instantiated bootstrap bound to an isolate
//! and an event loop.
//!
//! This module provides:
//! - [`EnvironmentContext`]: Store data reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Performance metrics for each run
//! - [`RuntimeEnvironment`]: The environment itself

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{Extern, Linker, Memory, Store, Trap, TypedFunc};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use isolate_host_common::{ExecutionConfig, ExitCode};

use crate::{Allocator, AllocatorLimiter, EventLoop, Isolate, IsolateData};

/// Store data of a runtime environment.
///
/// Host functions reach it through [`wasmtime::Caller::data_mut`].
pub struct EnvironmentContext {
    /// WASI preview1 context (argv, stdio, `proc_exit`).
    wasi: WasiP1Ctx,

    /// Charges linear memory to the isolate's allocator.
    limiter: AllocatorLimiter,

    /// Unique environment identifier for tracing.
    pub environment_id: String,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed by the last run.
    pub fuel_consumed: u64,

    /// Linear memory size in bytes after the last run.
    pub memory_used_bytes: usize,

    /// Bytes charged to the isolate's allocator.
    pub allocator_charged_bytes: usize,

    /// Duration of the last run.
    pub duration: Option<Duration>,
}

impl EnvironmentContext {
    /// Create a context whose guest sees `args` as its argv.
    pub fn new(environment_id: String, args: &[String], allocator: Arc<Allocator>) -> Self {
        let wasi = WasiCtxBuilder::new()
            .args(args)
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();

        Self {
            wasi,
            limiter: AllocatorLimiter::new(allocator),
            environment_id,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// The WASI context, for linker registration.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// The primary execution environment of a main instance.
///
/// Borrows the instance that created it, so it cannot outlive it and the
/// instance cannot be disposed while it exists. Dropping the environment
/// releases its store and lets the instance create another.
pub struct RuntimeEnvironment<'i> {
    id: String,
    store: Store<EnvironmentContext>,
    entry_point: TypedFunc<(), ()>,
    memory: Option<Memory>,
    isolate: &'i Isolate,
    event_loop: &'i EventLoop,
    live: &'i Cell<bool>,
}

/// Everything an environment needs from its main instance.
pub(crate) struct EnvironmentSetup<'i> {
    pub isolate: &'i Isolate,
    pub isolate_data: &'i IsolateData<'i>,
    pub linker: &'i Linker<EnvironmentContext>,
    pub event_loop: &'i EventLoop,
    pub execution: &'i ExecutionConfig,
    pub args: &'i [String],
    pub live: &'i Cell<bool>,
}

impl<'i> RuntimeEnvironment<'i> {
    /// Instantiate the bootstrap module in a fresh store.
    ///
    /// Runs the module's start function, if any. A guest `proc_exit(n)`
    /// during instantiation yields `Err(n)`; any other failure yields
    /// [`ExitCode::BOOTSTRAP_FAILURE`].
    #[instrument(skip_all, fields(isolate_id = %setup.isolate.id()))]
    pub(crate) fn bootstrap(setup: EnvironmentSetup<'i>) -> Result<Self, ExitCode> {
        let id = Uuid::new_v4().to_string();
        let data = setup.isolate_data;

        let Some(entry_export) = data.entry_point() else {
            error!(
                environment_id = %id,
                entry_point = crate::isolate_data::ENTRY_POINT,
                "Bootstrap module has no entry point"
            );
            return Err(ExitCode::BOOTSTRAP_FAILURE);
        };

        let context =
            EnvironmentContext::new(id.clone(), setup.args, Arc::clone(data.allocator()));
        let mut store = Store::new(setup.isolate.engine(), context);
        store.limiter(|ctx| &mut ctx.limiter);

        if setup.isolate.config().consume_fuel {
            if let Err(e) = store.set_fuel(setup.execution.max_fuel) {
                error!(environment_id = %id, error = %e, "Failed to set fuel");
                return Err(ExitCode::BOOTSTRAP_FAILURE);
            }
            if let Err(e) = store.fuel_async_yield_interval(setup.execution.fuel_yield_interval) {
                error!(environment_id = %id, error = %e, "Failed to set fuel yield interval");
                return Err(ExitCode::BOOTSTRAP_FAILURE);
            }
        }

        debug!(environment_id = %id, "Instantiating bootstrap module");

        let instantiated = setup.event_loop.block_on(
            setup
                .linker
                .instantiate_async(&mut store, data.module().as_module()),
        );

        let instance = match instantiated {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    info!(
                        environment_id = %id,
                        exit_code = exit.0,
                        "Bootstrap requested early exit"
                    );
                    return Err(ExitCode::new(exit.0));
                }

                error!(environment_id = %id, error = %e, "Bootstrap instantiation failed");
                return Err(ExitCode::BOOTSTRAP_FAILURE);
            }
        };

        let entry_point = instance
            .get_module_export(&mut store, entry_export)
            .and_then(Extern::into_func)
            .and_then(|func| func.typed::<(), ()>(&store).ok());

        let Some(entry_point) = entry_point else {
            error!(
                environment_id = %id,
                "Entry point is not a function of type () -> ()"
            );
            return Err(ExitCode::BOOTSTRAP_FAILURE);
        };

        let memory = data
            .memory_export()
            .and_then(|export| instance.get_module_export(&mut store, export))
            .and_then(Extern::into_memory);

        setup.live.set(true);

        info!(
            environment_id = %id,
            deserialized = data.is_deserialized(),
            "Runtime environment created"
        );

        Ok(Self {
            id,
            store,
            entry_point,
            memory,
            isolate: setup.isolate,
            event_loop: setup.event_loop,
            live: setup.live,
        })
    }

    /// Run the entry point and drive the event loop until it is idle.
    ///
    /// Returns 0 when the entry point returns, the guest's code when it
    /// calls `proc_exit`, and [`ExitCode::GENERIC_USER_ERROR`] when it traps
    /// or runs out of fuel.
    #[instrument(skip(self), fields(environment_id = %self.id))]
    pub fn run(&mut self) -> ExitCode {
        let isolate = self.isolate;
        let event_loop = self.event_loop;
        let _scope = isolate.enter();
        let start = Instant::now();
        let initial_fuel = self.store.get_fuel().ok();
        let entry_point = self.entry_point.clone();

        debug!("Executing entry point");

        let result = event_loop.run_to_quiescence(entry_point.call_async(&mut self.store, ()));

        let duration = start.elapsed();
        self.record_metrics(initial_fuel, duration);
        let fuel_consumed = self.store.data().metrics.fuel_consumed;

        match result {
            Ok(()) => {
                info!(
                    duration_ms = duration.as_millis(),
                    fuel_consumed, "Environment completed"
                );
                ExitCode::NO_FAILURE
            }
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    info!(
                        duration_ms = duration.as_millis(),
                        exit_code = exit.0,
                        "Environment exited"
                    );
                    return ExitCode::new(exit.0);
                }

                if is_out_of_fuel(&e) {
                    warn!(
                        duration_ms = duration.as_millis(),
                        fuel_consumed, "Environment terminated: fuel exhausted"
                    );
                    return ExitCode::GENERIC_USER_ERROR;
                }

                let (message, code) = extract_trap_info(&e);
                error!(
                    duration_ms = duration.as_millis(),
                    trap_message = %message,
                    trap_code = ?code,
                    "Environment trapped"
                );
                ExitCode::GENERIC_USER_ERROR
            }
        }
    }

    fn record_metrics(&mut self, initial_fuel: Option<u64>, duration: Duration) {
        let remaining = self.store.get_fuel().ok();
        let memory_used_bytes = self.memory.map_or(0, |m| m.data_size(&self.store));

        let ctx = self.store.data_mut();
        ctx.metrics.fuel_consumed = match (initial_fuel, remaining) {
            (Some(initial), Some(remaining)) => initial.saturating_sub(remaining),
            _ => 0,
        };
        ctx.metrics.memory_used_bytes = memory_used_bytes;
        ctx.metrics.allocator_charged_bytes = ctx.limiter.charged();
        ctx.metrics.duration = Some(duration);
    }

    /// Unique environment identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The store data.
    pub fn context(&self) -> &EnvironmentContext {
        self.store.data()
    }

    /// Metrics of the last run.
    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.store.data().metrics
    }

    /// Logs emitted by the guest so far.
    pub fn logs(&self) -> &[LogEntry] {
        &self.store.data().logs
    }

    /// The bootstrap's linear memory, if it exports one.
    pub fn memory(&self) -> Option<Memory> {
        self.memory
    }
}

impl Drop for RuntimeEnvironment<'_> {
    fn drop(&mut self) {
        self.live.set(false);
        debug!(environment_id = %self.id, "Runtime environment destroyed");
    }
}

impl std::fmt::Debug for RuntimeEnvironment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnvironment")
            .field("id", &self.id)
            .field("isolate", &self.isolate.id())
            .finish_non_exhaustive()
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = error.to_string();
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));

    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> EnvironmentContext {
        EnvironmentContext::new(
            "test-env".into(),
            &["main".to_string()],
            Allocator::new(1024),
        )
    }

    #[test]
    fn test_context_creation() {
        let ctx = context();

        assert_eq!(ctx.environment_id, "test-env");
        assert!(ctx.logs.is_empty());
        assert_eq!(ctx.metrics.fuel_consumed, 0);
        assert!(ctx.metrics.duration.is_none());
    }

    #[test]
    fn test_context_logging() {
        let mut ctx = context();

        ctx.log(LogLevel::Info, "Hello".into());
        ctx.log(LogLevel::Error, "World".into());

        assert_eq!(ctx.logs.len(), 2);
        assert_eq!(ctx.logs[0].level, LogLevel::Info);
        assert_eq!(ctx.logs[0].message, "Hello");
        assert_eq!(ctx.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_out_of_fuel_detection() {
        let err = wasmtime::Error::from(Trap::OutOfFuel);
        assert!(is_out_of_fuel(&err));

        let err = wasmtime::Error::from(Trap::UnreachableCodeReached);
        assert!(!is_out_of_fuel(&err));

        let (_, code) = extract_trap_info(&err);
        assert_eq!(code.as_deref(), Some("UnreachableCodeReached"));
    }
}

//! The main instance: owner of the primary environment of the process.
//!
//! A [`MainInstance`] binds an isolate, its [`IsolateData`], and an event
//! loop, and creates and runs the main [`RuntimeEnvironment`]. It either
//! owns its isolate or is attached to one the caller manages.
//!
//! # Teardown order
//!
//! Environments borrow the instance, so they are always gone before it is
//! disposed. The instance then drops its isolate data while the isolate is
//! still entered, and only afterwards releases an owned isolate.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use wasmtime::{Caller, Linker};
use wasmtime_wasi::I32Exit;

use isolate_host_common::{ExecutionConfig, ExitCode, IsolateConfig, RuntimeError};

use crate::environment::EnvironmentSetup;
use crate::{
    BuildConfig, EnvironmentContext, EventLoop, Isolate, IsolateData, Platform,
    RuntimeEnvironment,
};

/// An isolate created by and released with its main instance.
struct OwnedIsolate {
    isolate: Isolate,
    platform: Platform,
}

impl Drop for OwnedIsolate {
    fn drop(&mut self) {
        self.platform.unregister_isolate(&self.isolate);
    }
}

enum IsolateHolder<'a> {
    Owned(OwnedIsolate),
    Borrowed(&'a Isolate),
}

impl IsolateHolder<'_> {
    fn get(&self) -> &Isolate {
        match self {
            IsolateHolder::Owned(owned) => &owned.isolate,
            IsolateHolder::Borrowed(isolate) => isolate,
        }
    }
}

/// Controller for the primary runtime environment of an isolate.
///
/// # Ownership modes
///
/// - [`MainInstance::new`] creates the isolate, registers it with the
///   platform, and releases both when the instance goes away.
/// - [`MainInstance::attach`] borrows an isolate the caller allocated,
///   registered, and entered. The caller exits and drops it after the
///   instance is disposed; the borrow makes the reverse order a compile
///   error. Dropping an attached instance after exiting the isolate panics.
///
/// # Environments
///
/// At most one main environment may be live at a time. Creating another
/// while the previous one still exists panics; creating them one after
/// the other is fine.
///
/// Disposal consumes the instance, so it can happen only once and only
/// after every environment is gone:
///
/// ```compile_fail
/// # use isolate_host_core::MainInstance;
/// fn twice(instance: MainInstance<'_>) {
///     instance.dispose();
///     instance.dispose();
/// }
/// ```
///
/// ```compile_fail
/// # use isolate_host_core::MainInstance;
/// fn while_running(instance: MainInstance<'_>) {
///     let environment = instance.create_main_environment();
///     instance.dispose();
///     drop(environment);
/// }
/// ```
pub struct MainInstance<'a> {
    live_environment: Cell<bool>,
    linker: Linker<EnvironmentContext>,
    // `None` only while dropping.
    isolate_data: Option<IsolateData<'a>>,
    isolate: IsolateHolder<'a>,
    event_loop: &'a EventLoop,
    args: Vec<String>,
    exec_args: Vec<String>,
    execution: ExecutionConfig,
}

impl<'a> MainInstance<'a> {
    /// Create a main instance that owns its isolate.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::IsolateCreation`] if the isolate cannot be
    /// allocated, which the caller should treat as fatal, or an error from
    /// building the isolate data.
    #[instrument(skip_all)]
    pub fn new(
        config: &IsolateConfig,
        event_loop: &'a EventLoop,
        platform: &Platform,
        args: Vec<String>,
        exec_args: Vec<String>,
        build: &'a BuildConfig,
    ) -> Result<Self, RuntimeError> {
        let isolate = Isolate::new(config)?;
        platform.register_isolate(&isolate, event_loop);

        let owned = OwnedIsolate {
            isolate,
            platform: platform.clone(),
        };

        let (isolate_data, linker) = {
            let _scope = owned.isolate.enter();
            Self::initialize(&owned.isolate, build)?
        };

        info!(
            isolate_id = %owned.isolate.id(),
            owns_isolate = true,
            deserialized = isolate_data.is_deserialized(),
            "Main instance created"
        );

        Ok(Self {
            live_environment: Cell::new(false),
            linker,
            isolate_data: Some(isolate_data),
            isolate: IsolateHolder::Owned(owned),
            event_loop,
            args,
            exec_args,
            execution: ExecutionConfig::default(),
        })
    }

    /// Create a main instance on an isolate owned by the caller.
    ///
    /// # Panics
    ///
    /// Panics if the current thread has not entered `isolate`, or if the
    /// isolate is not registered with `platform`.
    #[instrument(skip_all, fields(isolate_id = %isolate.id()))]
    pub fn attach(
        isolate: &'a Isolate,
        event_loop: &'a EventLoop,
        platform: &Platform,
        args: Vec<String>,
        exec_args: Vec<String>,
        build: &'a BuildConfig,
    ) -> Result<Self, RuntimeError> {
        assert!(
            isolate.is_entered(),
            "isolate {} must be entered before attaching a main instance",
            isolate.id()
        );
        assert!(
            platform.is_registered(isolate.id()),
            "isolate {} must be registered with the platform before attaching a main instance",
            isolate.id()
        );

        let (isolate_data, linker) = Self::initialize(isolate, build)?;

        info!(
            owns_isolate = false,
            deserialized = isolate_data.is_deserialized(),
            "Main instance attached"
        );

        Ok(Self {
            live_environment: Cell::new(false),
            linker,
            isolate_data: Some(isolate_data),
            isolate: IsolateHolder::Borrowed(isolate),
            event_loop,
            args,
            exec_args,
            execution: ExecutionConfig::default(),
        })
    }

    fn initialize(
        isolate: &Isolate,
        build: &'a BuildConfig,
    ) -> Result<(IsolateData<'a>, Linker<EnvironmentContext>), RuntimeError> {
        let isolate_data = IsolateData::new(isolate, Arc::clone(isolate.allocator()), build)?;

        let mut linker = Linker::new(isolate.engine());
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, EnvironmentContext::wasi_mut)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to link WASI: {e}")))?;
        Self::link_proc_exit(&mut linker)?;

        Ok((isolate_data, linker))
    }

    /// Replace WASI `proc_exit` so every status reaches the exit code
    /// unchanged; the stock one traps on statuses of 126 and above.
    fn link_proc_exit(linker: &mut Linker<EnvironmentContext>) -> Result<(), RuntimeError> {
        linker.allow_shadowing(true);
        let linked = linker
            .func_wrap(
                "wasi_snapshot_preview1",
                "proc_exit",
                |_caller: Caller<'_, EnvironmentContext>, status: i32| -> wasmtime::Result<()> {
                    Err(I32Exit(status).into())
                },
            )
            .map(|_| ());
        linker.allow_shadowing(false);

        linked.map_err(|e| RuntimeError::invalid_config(format!("Failed to link proc_exit: {e}")))
    }

    /// Set the execution limits applied to new environments.
    #[must_use]
    pub fn with_execution_config(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Create the main environment.
    ///
    /// On failure the error carries the exit code the process should end
    /// with: the guest's own code if it exited during bootstrap, or
    /// [`ExitCode::BOOTSTRAP_FAILURE`].
    ///
    /// # Panics
    ///
    /// Panics if a main environment created earlier is still alive.
    pub fn create_main_environment(&self) -> Result<RuntimeEnvironment<'_>, ExitCode> {
        assert!(
            !self.live_environment.get(),
            "a main environment is already live on this instance"
        );

        let isolate = self.isolate.get();
        let _scope = isolate.enter();

        RuntimeEnvironment::bootstrap(EnvironmentSetup {
            isolate,
            isolate_data: self.isolate_data(),
            linker: &self.linker,
            event_loop: self.event_loop,
            execution: &self.execution,
            args: &self.args,
            live: &self.live_environment,
        })
    }

    /// Create the main environment, run it until the event loop is idle,
    /// and return its exit code.
    #[instrument(skip(self), fields(isolate_id = %self.isolate.get().id()))]
    pub fn run(&self) -> ExitCode {
        let _scope = self.isolate.get().enter();

        let exit_code = match self.create_main_environment() {
            Ok(mut environment) => environment.run(),
            Err(exit_code) => exit_code,
        };

        info!(exit_code = exit_code.code(), "Main instance finished");
        exit_code
    }

    /// Tear the instance down.
    ///
    /// # Panics
    ///
    /// Panics if the instance is attached and the current thread has not
    /// entered the isolate.
    pub fn dispose(self) {
        if let IsolateHolder::Borrowed(isolate) = &self.isolate {
            assert!(
                isolate.is_entered(),
                "main instance disposed while isolate {} is not entered",
                isolate.id()
            );
        }

        info!(
            isolate_id = %self.isolate.get().id(),
            owns_isolate = self.owns_isolate(),
            "Disposing main instance"
        );
    }

    /// Returns `true` if this instance created its isolate.
    pub fn owns_isolate(&self) -> bool {
        matches!(self.isolate, IsolateHolder::Owned(_))
    }

    /// The isolate this instance runs on.
    pub fn isolate(&self) -> &Isolate {
        self.isolate.get()
    }

    /// The per-isolate data.
    pub fn isolate_data(&self) -> &IsolateData<'a> {
        self.isolate_data
            .as_ref()
            .expect("isolate data accessed after disposal")
    }

    /// Linker used for new environments, for registering host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<EnvironmentContext> {
        &mut self.linker
    }

    /// Arguments passed to the guest as argv.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Host execution arguments.
    pub fn exec_args(&self) -> &[String] {
        &self.exec_args
    }

    /// Execution limits applied to new environments.
    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }
}

impl Drop for MainInstance<'_> {
    fn drop(&mut self) {
        let _scope = match &self.isolate {
            IsolateHolder::Owned(owned) => Some(owned.isolate.enter()),
            IsolateHolder::Borrowed(isolate) => {
                assert!(
                    isolate.is_entered() || std::thread::panicking(),
                    "main instance dropped while isolate {} is not entered",
                    isolate.id()
                );
                None
            }
        };
        self.isolate_data.take();

        debug!(isolate_id = %self.isolate.get().id(), "Isolate data released");
    }
}

impl std::fmt::Debug for MainInstance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainInstance")
            .field("isolate", &self.isolate.get().id())
            .field("owns_isolate", &self.owns_isolate())
            .field("live_environment", &self.live_environment.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bootstrap;

    const TRIVIAL_WAT: &str = r#"
        (module
            (func (export "_start"))
        )
    "#;

    fn build() -> BuildConfig {
        BuildConfig::new(Bootstrap::text(TRIVIAL_WAT))
    }

    #[test]
    fn test_owned_instance_registers_isolate() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();

        let instance = MainInstance::new(
            &IsolateConfig::default(),
            &event_loop,
            &platform,
            vec!["main".into()],
            Vec::new(),
            &build,
        )
        .unwrap();

        assert!(instance.owns_isolate());
        assert!(platform.is_registered(instance.isolate().id()));
        assert!(!instance.isolate_data().is_deserialized());

        instance.dispose();
        assert_eq!(platform.registered_count(), 0);
    }

    #[test]
    fn test_owned_instance_failure_unregisters() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = BuildConfig::new(Bootstrap::text("(module (func"));

        let result = MainInstance::new(
            &IsolateConfig::default(),
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        );

        assert!(matches!(result, Err(RuntimeError::CompilationFailed { .. })));
        assert_eq!(platform.registered_count(), 0);
    }

    #[test]
    fn test_attached_instance_keeps_isolate() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        platform.register_isolate(&isolate, &event_loop);

        {
            let _scope = isolate.enter();
            let instance = MainInstance::attach(
                &isolate,
                &event_loop,
                &platform,
                Vec::new(),
                vec!["--trace".into()],
                &build,
            )
            .unwrap();

            assert!(!instance.owns_isolate());
            assert_eq!(instance.exec_args(), ["--trace"]);
            instance.dispose();
        }

        assert!(platform.is_registered(isolate.id()));
        platform.unregister_isolate(&isolate);
    }

    #[test]
    #[should_panic(expected = "must be entered before attaching")]
    fn test_attach_without_entering_panics() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        platform.register_isolate(&isolate, &event_loop);

        let _ = MainInstance::attach(
            &isolate,
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        );
    }

    #[test]
    #[should_panic(expected = "must be registered with the platform")]
    fn test_attach_unregistered_panics() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let _scope = isolate.enter();

        let _ = MainInstance::attach(
            &isolate,
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        );
    }

    #[test]
    #[should_panic(expected = "disposed while isolate")]
    fn test_dispose_attached_without_entering_panics() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        platform.register_isolate(&isolate, &event_loop);

        let scope = isolate.enter();
        let instance = MainInstance::attach(
            &isolate,
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        )
        .unwrap();
        drop(scope);

        instance.dispose();
    }

    #[test]
    #[should_panic(expected = "dropped while isolate")]
    fn test_drop_attached_without_entering_panics() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        platform.register_isolate(&isolate, &event_loop);

        let scope = isolate.enter();
        let instance = MainInstance::attach(
            &isolate,
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        )
        .unwrap();
        drop(scope);

        drop(instance);
    }

    #[test]
    fn test_drop_owned_without_entering() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();

        let instance = MainInstance::new(
            &IsolateConfig::default(),
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        )
        .unwrap();
        assert!(!instance.isolate().is_entered());

        drop(instance);
        assert_eq!(platform.registered_count(), 0);
    }

    #[test]
    fn test_execution_config_builder() {
        let event_loop = EventLoop::new().unwrap();
        let platform = Platform::new();
        let build = build();
        let execution = ExecutionConfig {
            max_fuel: 42,
            fuel_yield_interval: None,
        };

        let instance = MainInstance::new(
            &IsolateConfig::default(),
            &event_loop,
            &platform,
            Vec::new(),
            Vec::new(),
            &build,
        )
        .unwrap()
        .with_execution_config(execution.clone());

        assert_eq!(instance.execution_config(), &execution);
    }
}

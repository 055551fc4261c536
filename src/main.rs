//! Isolate Host CLI entry point.
//!
//! Boots a single main instance on a bootstrap module and exits with the
//! code the guest produced.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use isolate_host_common::{ConfigFile, ExitCode};
use isolate_host_core::{
    Bootstrap, BuildConfig, EventLoop, Isolate, MainInstance, Platform, SnapshotSource,
};

/// Run a bootstrap module as the main instance of an embedded engine.
#[derive(Debug, Parser)]
#[command(name = "isolate-host", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "ISOLATE_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot container to start from.
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Host execution argument (repeatable).
    #[arg(long = "exec-arg", value_name = "ARG")]
    exec_args: Vec<String>,

    /// Write a snapshot container for the bootstrap to OUT and exit.
    #[arg(long, value_name = "OUT")]
    build_snapshot: Option<PathBuf>,

    /// Bootstrap module (`.wasm` or `.wat`).
    bootstrap: Option<PathBuf>,

    /// Arguments passed to the guest after the bootstrap path.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,isolate_host=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let Some(bootstrap_path) = cli
        .bootstrap
        .clone()
        .or_else(|| config.startup.bootstrap.as_ref().map(PathBuf::from))
    else {
        bail!("No bootstrap module given on the command line or in the config file");
    };
    let bootstrap = read_bootstrap(&bootstrap_path)?;

    if let Some(out) = &cli.build_snapshot {
        return build_snapshot(&config, &bootstrap, out);
    }

    let mut build = BuildConfig::new(bootstrap);
    let snapshot_path = cli
        .snapshot
        .clone()
        .or_else(|| config.startup.snapshot.as_ref().map(PathBuf::from));
    if let Some(path) = snapshot_path {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        match SnapshotSource::from_bytes(&bytes) {
            Ok(snapshot) => build = build.with_snapshot(snapshot),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Startup snapshot is unusable");
                std::process::exit(ExitCode::STARTUP_SNAPSHOT_FAILURE.code());
            }
        }
    }

    let mut args = vec![bootstrap_path.display().to_string()];
    args.extend(cli.args);

    let mut exec_args = config.startup.exec_args.clone();
    exec_args.extend(cli.exec_args);

    let exit_code = run(&config, &build, args, exec_args)?;
    std::process::exit(exit_code.code());
}

fn run(
    config: &ConfigFile,
    build: &BuildConfig,
    args: Vec<String>,
    exec_args: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let event_loop = EventLoop::new()?;
    let platform = Platform::new();

    let mut instance = match MainInstance::new(
        &config.runtime.isolate,
        &event_loop,
        &platform,
        args,
        exec_args,
        build,
    ) {
        Ok(instance) => instance.with_execution_config(config.runtime.execution.clone()),
        Err(e) if e.is_snapshot_error() => {
            error!(error = %e, "Startup snapshot rejected");
            return Ok(ExitCode::STARTUP_SNAPSHOT_FAILURE);
        }
        Err(e) if e.is_fatal() => return Err(e).context("Failed to create main instance"),
        Err(e) => {
            error!(error = %e, "Bootstrap could not be prepared");
            return Ok(ExitCode::BOOTSTRAP_FAILURE);
        }
    };

    isolate_host_bindings::register_all(instance.linker_mut())?;

    let exit_code = instance.run();
    instance.dispose();

    info!(exit_code = exit_code.code(), "Isolate host exiting");
    Ok(exit_code)
}

fn build_snapshot(config: &ConfigFile, bootstrap: &Bootstrap, out: &Path) -> anyhow::Result<()> {
    let isolate = Isolate::new(&config.runtime.isolate)?;
    let snapshot = {
        let _scope = isolate.enter();
        SnapshotSource::build(&isolate, bootstrap)?
    };

    let bytes = snapshot.to_bytes()?;
    std::fs::write(out, &bytes)
        .with_context(|| format!("Failed to write snapshot to {}", out.display()))?;

    info!(path = %out.display(), size = bytes.len(), "Snapshot written");
    Ok(())
}

fn read_bootstrap(path: &Path) -> anyhow::Result<Bootstrap> {
    let is_text = path.extension().is_some_and(|ext| ext == "wat");
    let bootstrap = if is_text {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bootstrap {}", path.display()))?;
        Bootstrap::text(text)
    } else {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read bootstrap {}", path.display()))?;
        Bootstrap::binary(bytes)
    };

    Ok(bootstrap)
}

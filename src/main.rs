mod actions;
mod config;
mod core;
mod dbus;
mod keys;
mod pipe;
mod registry;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::actions::BusHandle;
use crate::core::Core;
use crate::registry::{MultipleActionsBehaviour, Registry};
use crate::worker::X11Backend;

#[derive(Parser, Debug)]
#[command(author, version, about = "X11 global shortcut daemon", long_about = None)]
struct Args {
    /// Configuration files; later files override earlier ones.
    #[arg(long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,

    /// error, warning, notice, info or debug. Overrides the configuration
    /// file.
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// first, last, all or none. Overrides the configuration file.
    #[arg(long = "multiple-actions-behaviour", value_name = "POLICY")]
    multiple_actions_behaviour: Option<String>,
}

/// Syslog-style level names from the configuration schema.
fn level_filter(name: &str) -> Option<LevelFilter> {
    match name {
        "error" => Some(LevelFilter::ERROR),
        "warning" => Some(LevelFilter::WARN),
        "notice" | "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_files = if args.config.is_empty() {
        vec![config::default_path()]
    } else {
        args.config.clone()
    };
    let (general, bindings) = config::load(&config_files);

    let cli_level = match args.log_level.as_deref() {
        Some(name) => Some(
            level_filter(name).with_context(|| format!("unknown log level '{}'", name))?,
        ),
        None => None,
    };
    let level = cli_level
        .or_else(|| general.log_level.as_deref().and_then(level_filter))
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        )
        .init();

    let behaviour = match args.multiple_actions_behaviour.as_deref() {
        Some(name) => Some(MultipleActionsBehaviour::parse(name).with_context(|| {
            format!("unknown multiple-actions behaviour '{}'", name)
        })?),
        None => None,
    }
    .or(general.multiple_actions_behaviour)
    .unwrap_or_default();

    info!("starting");

    // Claim the bus name before anything else so a second instance fails
    // fast.
    let connection = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    connection
        .request_name(dbus::SERVICE_NAME)
        .await
        .with_context(|| format!("cannot register service '{}'", dbus::SERVICE_NAME))?;

    let data = Arc::new(Mutex::new(Registry::new(behaviour, general.allow_grab)));
    let bus = BusHandle::new(connection.clone(), tokio::runtime::Handle::current());
    let (grab_resolved_tx, mut grab_resolved_rx) = tokio::sync::mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let mut worker_handle = tokio::task::spawn_blocking({
        let data = data.clone();
        let bus = bus.clone();
        move || worker::start(data, bus, grab_resolved_tx)
    })
    .await
    .context("X11 worker startup panicked")??;

    let save_target = config_files
        .last()
        .cloned()
        .unwrap_or_else(config::default_path);
    let core = Arc::new(Core::new(
        data,
        worker_handle.backend.clone() as Arc<dyn X11Backend>,
        bus,
        save_target,
        general.log_level.clone(),
        shutdown_tx,
    ));

    // Register the configured bindings; saving stays off until the initial
    // load is done.
    tokio::task::spawn_blocking({
        let core = core.clone();
        move || {
            core.load_bindings(bindings);
            core.allow_saving();
        }
    })
    .await
    .context("configuration load panicked")?;

    dbus::serve(&connection, core.clone())
        .await
        .context("cannot export the daemon objects")?;

    tokio::spawn(dbus::watch_services(connection.clone(), core.clone()));

    // Complete pending interactive grabs as the worker resolves them.
    tokio::spawn({
        let core = core.clone();
        async move {
            while grab_resolved_rx.recv().await.is_some() {
                let core = core.clone();
                let _ = tokio::task::spawn_blocking(move || core.handle_grab_resolved()).await;
            }
        }
    });

    info!("started");

    let mut sigterm =
        signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
        result = shutdown_rx.changed() => {
            if result.is_ok() {
                info!("shutdown requested");
            } else {
                error!("shutdown channel closed unexpectedly");
            }
        }
    }

    info!("stopping");
    tokio::task::spawn_blocking(move || worker_handle.shutdown())
        .await
        .context("X11 worker shutdown panicked")?;
    info!("stopped");
    Ok(())
}

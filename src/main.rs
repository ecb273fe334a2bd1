//! completion-server: a TCP server driven by a kernel completion queue
//!
//! Connections are accepted on a dedicated thread and every read and
//! write is submitted to one shared io_uring instance. A fixed pool of
//! worker threads waits on that queue and runs the per-connection state
//! machine as completions arrive.
//!
//! Features:
//! - Close-after-first-read or keep-alive connection policy
//! - Print or echo payload handling
//! - Cooperative shutdown with one sentinel per worker on Ctrl-C/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod consumer;
mod error;
mod runtime;
#[cfg(target_os = "linux")]
mod server;

use config::Config;
use error::StartupError;
use std::io;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(StartupError::from(e).exit_code());
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        buffer_size = config.buffer_size,
        policy = ?config.policy,
        consumer = ?config.consumer,
        "Starting completion-server"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Serve until Ctrl-C or SIGTERM, then shut down cooperatively.
#[cfg(target_os = "linux")]
fn run(config: Config) -> Result<(), StartupError> {
    let consumer = consumer::from_kind(config.consumer);
    let server = server::Server::start(&config, consumer)?;

    let signal = wait_for_shutdown_signal();
    if let Err(ref e) = signal {
        error!(error = %e, "Signal handling failed");
    }

    let report = server.shutdown();
    info!(
        workers_stopped = report.workers_stopped,
        drained = report.drained,
        abandoned = report.abandoned,
        "Server stopped"
    );

    signal.map_err(StartupError::Runtime)
}

#[cfg(not(target_os = "linux"))]
fn run(_config: Config) -> Result<(), StartupError> {
    Err(StartupError::CompletionQueue(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unsupported platform: io_uring requires Linux",
    )))
}

#[cfg(target_os = "linux")]
fn wait_for_shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
        Ok::<_, io::Error>(())
    })?;

    info!("Shutdown signal received");
    Ok(())
}

//! CLI entry point: one verb, `daemon`, running the privileged loop. Exit
//! code 0 on clean shutdown, non-zero on setup failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use applock_daemon::config::Config;
use applock_daemon::controller::{Controller, UnlimitedAttempts};
use applock_daemon::error::DaemonError;
use applock_daemon::event_source::{run_reader_loop, EventSource};
use applock_daemon::frame::{decode_frame, DropReason};
use applock_daemon::inspector::ProcFsInspector;
use applock_daemon::policy::ProtectionPolicy;
use applock_daemon::privilege;
use applock_daemon::server::{run_accept_loop, ArbitrationHub, DaemonArbiter};
use applock_daemon::signaler::KillSignaler;

#[derive(Parser)]
#[command(name = "applockd", about = "Execution-interception engine daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the privileged interception loop.
    Daemon {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let (config_path, socket_override) = match cli.command {
        Some(Command::Daemon { config, socket }) => (config, socket),
        None => (None, None),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(mut config) => {
            if let Some(socket) = socket_override {
                config.socket_path = socket;
            }
            config
        }
        Err(e) => {
            eprintln!("fatal: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(config.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match runtime.block_on(run_daemon(config)) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "daemon failed to start or encountered a fatal error");
            1
        }
    };
    std::process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Bounded concurrency for per-EXEC work.
const MAX_CONCURRENT_INSPECTIONS: usize = 16;

async fn run_daemon(config: Config) -> Result<(), DaemonError> {
    let event_source = EventSource::open()?;
    let listener = bind_arbitration_socket(&config.socket_path).await?;
    privilege::harden_after_setup()?;

    let policy = ProtectionPolicy::new(config.protected_apps.clone());
    let hub = ArbitrationHub::new();
    let arbiter = Arc::new(DaemonArbiter::new(hub.clone()));
    let controller = Arc::new(Controller::new(
        Arc::new(ProcFsInspector),
        Arc::new(KillSignaler),
        policy,
        Arc::new(UnlimitedAttempts),
        arbiter,
    ));
    hub.bind_controller(controller.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reader_shutdown = Arc::new(AtomicBool::new(false));

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(256);
    let reader_handle = {
        let reader_shutdown = reader_shutdown.clone();
        std::thread::spawn(move || run_reader_loop(event_source, frame_tx, reader_shutdown))
    };

    let accept_handle = tokio::spawn(run_accept_loop(listener, hub.clone(), shutdown_rx.clone()));

    let dispatch_controller = controller.clone();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_INSPECTIONS));
    let mut dispatch_shutdown = shutdown_rx.clone();
    let dispatch_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = dispatch_shutdown.changed() => break,
                frame = frame_rx.recv() => {
                    let Some(bytes) = frame else { break };
                    match decode_frame(&bytes) {
                        Ok(event) => {
                            let controller = dispatch_controller.clone();
                            let permit = semaphore
                                .clone()
                                .acquire_owned()
                                .await
                                .expect("semaphore is never closed");
                            tokio::spawn(async move {
                                let _permit = permit;
                                controller.handle_exec(event).await;
                            });
                        }
                        // Any connector-id mismatch is routine traffic from other
                        // consumers sharing the connector multicast bus and is
                        // silently ignored per spec; everything else is an actually
                        // malformed or partial frame worth a warning.
                        Err(DropReason::ConnectorIdMismatch) => {}
                        Err(reason) => {
                            warn!(?reason, "dropped malformed or uninteresting frame");
                        }
                    }
                }
            }
        }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight interceptions");

    let _ = shutdown_tx.send(true);
    reader_shutdown.store(true, Ordering::Relaxed);

    let deadline = config.shutdown_deadline;
    if tokio::time::timeout(deadline, controller.shutdown_sweep())
        .await
        .is_err()
    {
        warn!("shutdown deadline exceeded while terminating suspended processes");
    }

    accept_handle.abort();
    dispatch_handle.abort();
    let _ = reader_handle.join();
    let _ = std::fs::remove_file(&config.socket_path);

    info!("shutdown complete");
    Ok(())
}

async fn bind_arbitration_socket(
    path: &std::path::Path,
) -> Result<tokio::net::UnixListener, DaemonError> {
    // The existing socket file is removed and recreated on startup.
    use std::os::unix::fs::PermissionsExt;

    let to_daemon_error = |source: std::io::Error| DaemonError::SocketBind {
        path: path.to_path_buf(),
        source,
    };

    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path).map_err(to_daemon_error)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(to_daemon_error)?;
    Ok(listener)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

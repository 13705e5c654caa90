use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mrtd::config::DaemonConfig;
use mrtd::coordinator::Coordinator;
use mrtd::ipc::IpcServer;
use mrtd::kernel::MrouteSocket;
use mrtd::store::Store;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tracing::{error, info};

/// Multicast forwarding control daemon.
#[derive(Parser)]
#[command(name = "mrtd", about = "Multicast forwarding control daemon")]
struct Args {
    /// Config file path
    #[arg(long, default_value = mrtd::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Unix socket path (overrides config)
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// State file path (overrides config)
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::load(&args.config);
    if let Some(path) = args.socket_path {
        config.socket_path = path;
    }
    if let Some(path) = args.state_file {
        config.state_file = path;
    }

    if !nix::unistd::geteuid().is_root() {
        error!("mrtd must run as root: MRT_INIT requires CAP_NET_ADMIN");
        std::process::exit(1);
    }

    // Ensure the state directory exists
    if let Some(parent) = config.state_file.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        error!(error = %e, path = %parent.display(), "failed to create state directory");
        std::process::exit(1);
    }

    // A corrupt or inconsistent snapshot is fatal: refuse to serve rather
    // than guess at kernel state.
    let store = match Store::load(&config.state_file) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %config.state_file.display(), "cannot load state");
            std::process::exit(1);
        }
    };

    let mut coordinator = Coordinator::new(MrouteSocket::new(), store, config.state_file.clone());
    if let Err(e) = coordinator.start() {
        error!(error = %e, "failed to initialize the multicast engine");
        error!("Do you have root privileges? Try running with 'sudo'.");
        std::process::exit(1);
    }
    let coordinator = Arc::new(Mutex::new(coordinator));

    let server = match IpcServer::bind(&config.socket_path, Arc::clone(&coordinator)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, path = %config.socket_path.display(), "failed to bind IPC socket");
            coordinator.lock().await.shutdown();
            std::process::exit(1);
        }
    };

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");

    info!("mrtd ready");
    server
        .run(async {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
        })
        .await;

    coordinator.lock().await.shutdown();
    info!("mrtd stopped");
}

//! KubePortal daemon: multiplexes persistent TCP port forwards on the
//! developer workstation.
//!
//! Each configured forward listens on a loopback port and relays bytes
//! either to a raw TCP endpoint or to a pod selected from a Kubernetes
//! Service. Forwards are managed at runtime over a loopback JSON-RPC
//! surface (`POST /rpc`, default port 50051).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};

use kubeportal_commons::utils::logging::init_logging;
use kubeportal_commons::{
    get_config_file_path,
    ConfigStore,
    LockFile,
};
use kubeportal_daemon::manager::ForwardManager;
use kubeportal_daemon::rpc::protocol::DEFAULT_RPC_PORT;
use kubeportal_daemon::rpc::{
    server,
    RpcContext,
};
use kubeportal_daemon::watcher::ConfigWatcher;
use kubeportal_portforward::{
    KubeCache,
    KubeconfigClientFactory,
};

#[derive(Parser, Debug)]
#[command(
    name = "kubeportal",
    version,
    about = "Local daemon multiplexing TCP port forwards to sockets and Kubernetes services"
)]
struct Args {
    /// Loopback port for the JSON-RPC surface
    #[arg(short, long, default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    /// Override the configuration directory
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Some(dir) = &args.config_dir {
        std::env::set_var("KUBEPORTAL_CONFIG", dir);
    }

    info!("starting kubeportal daemon v{}", env!("CARGO_PKG_VERSION"));

    let _lock = LockFile::acquire(args.port)?;

    let cancel = CancellationToken::new();
    let config_path = get_config_file_path()?;
    let store = ConfigStore::new(config_path.clone());

    let kube_cache = Arc::new(KubeCache::new(Arc::new(KubeconfigClientFactory)));
    let sweeper = Arc::clone(&kube_cache).spawn_sweeper(cancel.child_token());

    let manager = Arc::new(ForwardManager::new(store, kube_cache, cancel.clone()));
    manager.initialize().await;

    let mut watcher = ConfigWatcher::new(config_path, manager.watch_suppress());
    if let Err(e) = watcher.start(Arc::clone(&manager)) {
        warn!(error = %e, "config file watcher unavailable");
    }

    let ctx = Arc::new(RpcContext {
        manager: Arc::clone(&manager),
        shutdown: cancel.clone(),
        started_at: Instant::now(),
    });
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let server = tokio::spawn(server::serve(addr, ctx, cancel.clone()));

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            cancel.cancel();
        }
    }

    watcher.stop();
    manager.stop_all().await;
    if let Ok(Err(e)) = server.await {
        warn!(error = %e, "RPC server exited with error");
    }
    let _ = sweeper.await;

    info!("kubeportal daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{
        signal,
        SignalKind,
    };

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

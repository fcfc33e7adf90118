use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use brcni::cluster::{watch_nodes, KubeNodeSource};
use brcni::daemon::{shutdown_signal, Daemon, DaemonConfig};
use brcni::queue::{BackoffPolicy, WorkQueue};
use brcni::route::IpRouteTable;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::parse();
    info!("starting brcnid with {:?}", config);

    let client = kube::Client::try_default().await.context("failed to create kube client")?;
    let source = KubeNodeSource::new(client);
    let api = source.api();

    let mut daemon = Daemon::bootstrap(&config, source, IpRouteTable::default())
        .await
        .context("failed to bootstrap node")?;

    let queue = WorkQueue::new(BackoffPolicy::default());
    let watch = tokio::spawn(watch_nodes(api, queue.clone()));

    daemon.run(&queue, shutdown_signal()).await;

    queue.shutdown();
    watch.abort();
    if let Err(e) = watch.await {
        if !e.is_cancelled() {
            error!("node watch task failed: {}", e);
        }
    }
    info!("brcnid stopped");
    Ok(())
}

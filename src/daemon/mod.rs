//! The per-node daemon: bootstraps the node and keeps peer routes converged.

pub mod config;
mod reconciler;

use std::future::Future;

use ipnetwork::Ipv4Network;
use tracing::{info, instrument, warn};

use crate::bridge;
use crate::cluster::NodeSource;
use crate::config::SubnetConf;
use crate::error::{CniError, Result};
use crate::firewall::Iptables;
use crate::ipam::{gateway_for, validate_subnet};
use crate::queue::WorkQueue;
use crate::route::RouteTable;

pub use config::DaemonConfig;
pub use reconciler::{ReconcileReport, RouteReconciler};

/// A bootstrapped node, ready to process work queue keys.
pub struct Daemon<S, R> {
    source: S,
    reconciler: RouteReconciler<R>,
}

impl<S: NodeSource, R: RouteTable> Daemon<S, R> {
    /// Wire up a daemon for a node whose host traffic leaves on `host_link`.
    pub fn new(node_name: &str, host_link: &str, source: S, routes: R) -> Self {
        Self { source, reconciler: RouteReconciler::new(node_name, host_link, routes) }
    }

    /// Prepare this node and return a daemon seeded with the routes already
    /// in the kernel.
    ///
    /// Publishes the subnet file, creates the bridge, finds the host link by
    /// the node's InternalIP and optionally installs iptables rules.
    #[instrument(skip_all, fields(node = ?config.node_name))]
    pub async fn bootstrap(config: &DaemonConfig, source: S, routes: R) -> Result<Self> {
        config.validate()?;
        let cluster = config.cluster_network()?;
        let node_name = config.node_name()?;

        let node = source.get_node(node_name).await?;
        let host_ip = node
            .internal_ip
            .ok_or_else(|| CniError::config(format!("node {} has no InternalIP", node_name)))?;
        let subnet = validate_subnet(node.pod_network()?)?;
        if !cluster.contains(subnet.network()) {
            warn!("pod subnet {} is outside cluster CIDR {}", subnet, cluster);
        }
        info!("node {} has pod subnet {} and host IP {}", node_name, subnet, host_ip);

        let subnet_conf = SubnetConf { subnet: subnet.to_string(), bridge: config.bridge.clone() };
        subnet_conf.store(&config.subnet_file)?;

        let host_link = bridge::link_by_addr(host_ip)?
            .ok_or_else(|| CniError::not_found(format!("interface with address {}", host_ip)))?;
        info!("host link is {}", host_link.name);

        let gateway = Ipv4Network::new(gateway_for(subnet), subnet.prefix())
            .map_err(|e| CniError::config(format!("gateway for {}: {}", subnet, e)))?;
        bridge::create_bridge(&config.bridge, config.mtu, gateway)?;

        if config.enable_iptables {
            Iptables::default()
                .install_forwarding_rules(&config.bridge, &host_link.name, &subnet.to_string())
                .await?;
        }

        let mut daemon = Self::new(node_name, &host_link.name, source, routes);
        daemon.reconciler.seed(cluster, subnet).await?;
        Ok(daemon)
    }

    pub fn reconciler(&self) -> &RouteReconciler<R> {
        &self.reconciler
    }

    /// Process queue keys until `shutdown` resolves or the queue shuts down.
    ///
    /// Shutdown is only observed between passes.
    pub async fn run(&mut self, queue: &WorkQueue<String>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let key = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                key = queue.get() => key,
            };
            let Some(key) = key else {
                break;
            };

            self.process(queue, &key).await;
            queue.done(key);
        }
        info!("worker stopped");
    }

    /// One reconcile pass triggered by `key`. Failures requeue the key.
    pub async fn process(&mut self, queue: &WorkQueue<String>, key: &String) {
        match self.reconcile_once().await {
            Ok(report) => {
                info!(
                    node = %key,
                    added = report.added,
                    replaced = report.replaced,
                    deleted = report.deleted,
                    unchanged = report.unchanged,
                    "routes reconciled"
                );
                queue.forget(key);
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(node = %key, ?delay, "reconcile failed: {}", e);
            }
        }
    }

    /// List every node and converge routes to them.
    pub async fn reconcile_once(&mut self) -> Result<ReconcileReport> {
        let nodes = self.source.list_nodes().await?;
        self.reconciler.reconcile(&nodes).await
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInfo;
    use crate::queue::BackoffPolicy;
    use crate::route::fake::FakeRoutes;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct FakeNodes {
        nodes: Arc<Mutex<Vec<NodeInfo>>>,
        down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl NodeSource for FakeNodes {
        async fn get_node(&self, name: &str) -> Result<NodeInfo> {
            self.nodes
                .lock()
                .unwrap()
                .iter()
                .find(|n| n.name == name)
                .cloned()
                .ok_or_else(|| CniError::not_found(name))
        }

        async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CniError::ClusterApi { reason: "connection refused".into() });
            }
            Ok(self.nodes.lock().unwrap().clone())
        }
    }

    fn node(name: &str, cidr: &str, ip: [u8; 4]) -> NodeInfo {
        NodeInfo {
            name: name.into(),
            pod_cidr: Some(cidr.into()),
            internal_ip: Some(Ipv4Addr::from(ip)),
        }
    }

    fn nodes() -> FakeNodes {
        let nodes = FakeNodes::default();
        *nodes.nodes.lock().unwrap() = vec![
            node("self", "10.244.0.0/24", [192, 168, 1, 10]),
            node("a", "10.244.1.0/24", [192, 168, 1, 11]),
        ];
        nodes
    }

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(BackoffPolicy { base: Duration::from_millis(1), max: Duration::from_millis(10) })
    }

    #[tokio::test]
    async fn run_processes_keys_until_shutdown() {
        let source = nodes();
        let mut daemon = Daemon::new("self", "eth0", source.clone(), FakeRoutes::default());
        let q = queue();
        q.add("a".to_string());

        let stopper = {
            let q = q.clone();
            async move {
                while !q.is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), daemon.run(&q, stopper)).await.unwrap();

        let installed = daemon.reconciler().routes().installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].to_string(), "10.244.1.0/24 via 192.168.1.11 dev eth0");
        assert_eq!(q.num_requeues(&"a".to_string()), 0);
    }

    #[tokio::test]
    async fn failed_pass_requeues_with_backoff() {
        let source = nodes();
        source.down.store(true, Ordering::SeqCst);
        let mut daemon = Daemon::new("self", "eth0", source.clone(), FakeRoutes::default());
        let q = queue();

        daemon.process(&q, &"a".to_string()).await;
        assert_eq!(q.num_requeues(&"a".to_string()), 1);

        source.down.store(false, Ordering::SeqCst);
        let key = tokio::time::timeout(Duration::from_secs(5), q.get()).await.unwrap().unwrap();
        daemon.process(&q, &key).await;
        q.done(key);

        assert_eq!(q.num_requeues(&"a".to_string()), 0);
        assert_eq!(daemon.reconciler().routes().installed().len(), 1);
    }

    #[tokio::test]
    async fn queue_shutdown_stops_worker() {
        let source = nodes();
        let mut daemon = Daemon::new("self", "eth0", source.clone(), FakeRoutes::default());
        let q = queue();
        q.shutdown();

        tokio::time::timeout(Duration::from_secs(5), daemon.run(&q, std::future::pending()))
            .await
            .unwrap();
        assert!(daemon.reconciler().routes().installed().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_refuses_subnet_too_small_for_pods() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            cluster_cidr: "10.244.0.0/16".into(),
            node_name: Some("self".into()),
            enable_iptables: false,
            subnet_file: dir.path().join("subnet.json"),
            bridge: "cni0".into(),
            mtu: 1500,
        };
        let source = FakeNodes::default();
        *source.nodes.lock().unwrap() = vec![node("self", "10.244.0.0/31", [192, 168, 1, 10])];

        let result = Daemon::bootstrap(&config, source, FakeRoutes::default()).await;

        assert!(matches!(result, Err(CniError::Config { .. })));
        assert!(!config.subnet_file.exists(), "unusable subnet was published");
    }
}

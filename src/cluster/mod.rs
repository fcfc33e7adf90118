//! Node records from the Kubernetes API.
//!
//! The daemon only needs three things from a `Node`: its name, its pod CIDR
//! and its InternalIP. Everything else is dropped at the boundary.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures::StreamExt;
use ipnetwork::Ipv4Network;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::{CniError, Result};
use crate::queue::WorkQueue;

/// The part of a node record the daemon uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// `spec.podCIDR`, if assigned
    pub pod_cidr: Option<String>,
    /// First `InternalIP` in `status.addresses`
    pub internal_ip: Option<Ipv4Addr>,
}

impl NodeInfo {
    /// The pod CIDR as a network.
    pub fn pod_network(&self) -> Result<Ipv4Network> {
        let cidr = self
            .pod_cidr
            .as_deref()
            .ok_or_else(|| CniError::config(format!("node {} has no pod CIDR", self.name)))?;
        cidr.parse().map_err(|e| {
            CniError::config(format!("node {} has invalid pod CIDR {:?}: {}", self.name, cidr, e))
        })
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let pod_cidr = node
            .spec
            .as_ref()
            .and_then(|spec| spec.pod_cidr.clone())
            .filter(|cidr| !cidr.is_empty());

        let internal_ip = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addresses| {
                addresses
                    .iter()
                    .filter(|a| a.type_ == "InternalIP")
                    .find_map(|a| a.address.parse().ok())
            });

        Self { name: node.name_any(), pod_cidr, internal_ip }
    }
}

/// Read access to node records.
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<NodeInfo>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;
}

/// [`NodeSource`] over the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeSource {
    api: Api<Node>,
}

impl KubeNodeSource {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    pub fn api(&self) -> Api<Node> {
        self.api.clone()
    }
}

#[async_trait]
impl NodeSource for KubeNodeSource {
    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        let node = self.api.get_opt(name).await?;
        node.as_ref()
            .map(NodeInfo::from)
            .ok_or_else(|| CniError::not_found(format!("node {}", name)))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.api.list(&Default::default()).await?;
        Ok(nodes.items.iter().map(NodeInfo::from).collect())
    }
}

/// A change seen on the node watch.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Applied(NodeInfo),
    Deleted(NodeInfo),
    /// Full relist after the watch (re)started
    Restarted(Vec<NodeInfo>),
}

impl From<watcher::Event<Node>> for NodeEvent {
    fn from(event: watcher::Event<Node>) -> Self {
        match event {
            watcher::Event::Applied(node) => Self::Applied(NodeInfo::from(&node)),
            watcher::Event::Deleted(node) => Self::Deleted(NodeInfo::from(&node)),
            watcher::Event::Restarted(nodes) => {
                Self::Restarted(nodes.iter().map(NodeInfo::from).collect())
            }
        }
    }
}

/// Lets through node creations and deletions, and only those updates that
/// change the pod CIDR.
#[derive(Debug, Default)]
pub struct PodCidrFilter {
    known: HashMap<String, Option<String>>,
}

impl PodCidrFilter {
    /// Keys to enqueue for `event`.
    pub fn admit(&mut self, event: NodeEvent) -> Vec<String> {
        match event {
            NodeEvent::Applied(node) => {
                let previous = self.known.insert(node.name.clone(), node.pod_cidr.clone());
                if previous == Some(node.pod_cidr) {
                    Vec::new()
                } else {
                    vec![node.name]
                }
            }
            NodeEvent::Deleted(node) => {
                self.known.remove(&node.name);
                vec![node.name]
            }
            NodeEvent::Restarted(nodes) => {
                let mut previous = std::mem::take(&mut self.known);
                let mut keys = Vec::new();
                for node in nodes {
                    let changed = previous.remove(&node.name) != Some(node.pod_cidr.clone());
                    if changed {
                        keys.push(node.name.clone());
                    }
                    self.known.insert(node.name, node.pod_cidr);
                }
                // Whatever is left disappeared while the watch was down
                keys.extend(previous.into_keys());
                keys
            }
        }
    }
}

/// Feed node changes into `queue` until the queue shuts down.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub async fn watch_nodes(api: Api<Node>, queue: WorkQueue<String>) {
    let mut filter = PodCidrFilter::default();
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();

    while let Some(event) = events.next().await {
        if queue.is_shutting_down() {
            break;
        }
        match event {
            Ok(event) => {
                for key in filter.admit(event.into()) {
                    debug!(node = %key, "queueing reconcile");
                    queue.add(key);
                }
            }
            Err(e) => warn!("node watch error: {}", e),
        }
    }
    info!("node watch stopped");
}

//! Per-remote reconciliation runner.
//!
//! One runner owns one WireGuard device and one remote cluster watch. It
//! advertises the local endpoint on the local node, learns peers from the
//! annotations the far side advertised on the remote cluster's nodes, and
//! converges the kernel peer table toward that set. Sync requests are
//! coalesced through a single-slot channel and a periodic full resync
//! guarantees eventual convergence even when events are dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::kube::node_watcher::{NodeEventHandler, NodeWatcher, WatchEventType};
use crate::kube::patch::patch_node_annotations;
use crate::metrics;
use crate::wireguard::{Device, PeerConfig, PeerSync};

/// How long a caller waits for a slot on the sync channel before counting a
/// queue-full failure and requeueing in the background.
const SYNC_QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Annotation key under which a cluster's runners advertise their device
/// public key for the named far side.
pub fn wg_public_key_annotation(cluster_name: &str) -> String {
    format!("{cluster_name}.wireguard.semaphore.uw.io/pubKey")
}

/// Annotation key under which a cluster's runners advertise their endpoint
/// for the named far side.
pub fn wg_endpoint_annotation(cluster_name: &str) -> String {
    format!("{cluster_name}.wireguard.semaphore.uw.io/endpoint")
}

/// Device name for the tunnel to the named remote cluster
pub fn wg_device_name(remote_cluster_name: &str) -> String {
    format!("wireguard.{remote_cluster_name}")
}

/// Annotation keys a runner reads from remote nodes and writes on the local
/// node.
#[derive(Clone, Debug)]
struct RunnerAnnotations {
    watch_public_key: String,
    watch_endpoint: String,
    advertise_public_key: String,
    advertise_endpoint: String,
}

impl RunnerAnnotations {
    fn new(local_cluster_name: &str, remote_cluster_name: &str) -> Self {
        Self {
            watch_public_key: wg_public_key_annotation(local_cluster_name),
            watch_endpoint: wg_endpoint_annotation(local_cluster_name),
            advertise_public_key: wg_public_key_annotation(remote_cluster_name),
            advertise_endpoint: wg_endpoint_annotation(remote_cluster_name),
        }
    }
}

/// Desired configuration for one WireGuard peer, as learned from a remote
/// node's annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Networks routed to the peer, in the order they were learned
    pub allowed_ips: Vec<String>,
    /// The peer's advertised `host:port` endpoint
    pub endpoint: String,
}

/// Settings for constructing a [`Runner`]
pub struct RunnerConfig {
    /// Name of the local node this process runs on
    pub node_name: String,
    /// Local cluster name, used for the watch annotation keys
    pub local_cluster_name: String,
    /// Remote cluster name, used for the advertise annotation keys
    pub remote_cluster_name: String,
    /// Name of the WireGuard device the runner owns
    pub wg_device_name: String,
    /// File path for the persisted device private key
    pub wg_key_filename: PathBuf,
    /// MTU for the device
    pub wg_device_mtu: u32,
    /// WireGuard listen port for the device
    pub wg_listen_port: u16,
    /// Remote pod subnet routed via the device
    pub pod_subnet: IpNet,
    /// Node watcher relist period
    pub watcher_resync_period: Duration,
    /// Period of the forced full peer resync
    pub full_resync_period: Duration,
}

/// State shared between the sync loop, the event handlers and the runner
struct RunnerState {
    device_name: String,
    annotations: RunnerAnnotations,
    /// Mirrors the last successfully applied peer set. Only the sync task
    /// writes it; event handlers read it for change detection.
    peers: RwLock<HashMap<String, Peer>>,
    can_sync: AtomicBool,
    sync_tx: mpsc::Sender<()>,
    peer_sync: Arc<dyn PeerSync>,
}

impl RunnerState {
    /// Queue a peer sync, waiting up to [`SYNC_QUEUE_WAIT`] for a slot.
    ///
    /// On timeout the failure is counted and a background requeue keeps
    /// trying, so a sync request is never dropped.
    async fn enqueue_peers_sync(self: &Arc<Self>) {
        match self.sync_tx.send_timeout((), SYNC_QUEUE_WAIT).await {
            Ok(()) => debug!(device = %self.device_name, "Sync task queued"),
            Err(_) => {
                error!(
                    device = %self.device_name,
                    "Timed out trying to queue a sync action, sync queue is full"
                );
                metrics::inc_sync_queue_full_failures(&self.device_name);
                self.requeue_peers_sync();
            }
        }
    }

    fn requeue_peers_sync(self: &Arc<Self>) {
        debug!(device = %self.device_name, "Requeueing peers sync task");
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_nanos(1)).await;
            metrics::inc_sync_requeue(&state.device_name);
            state.enqueue_peers_sync().await;
        });
    }

    async fn do_sync_peers(self: &Arc<Self>, watcher: &NodeWatcher) {
        if !self.can_sync.load(Ordering::SeqCst) {
            warn!(device = %self.device_name, "Cannot sync peers while canSync flag is not set");
            return;
        }
        let nodes = watcher.list().await;
        let result = self.sync_peers(&nodes).await;
        metrics::record_sync_peer_attempt(&self.device_name, result.is_ok());
        if let Err(e) = result {
            warn!(device = %self.device_name, error = %e, "Failed to sync wg peers");
            self.requeue_peers_sync();
        }
    }

    /// Compute the desired peer set from the node list and push it to the
    /// device. The in-memory peer map is replaced only when the kernel
    /// update succeeded, so it always mirrors applied state.
    async fn sync_peers(&self, nodes: &[Node]) -> Result<(), Error> {
        let peers = self.calculate_peers_from_node_list(nodes);
        let mut peer_configs = Vec::with_capacity(peers.len());
        for (public_key, peer) in &peers {
            peer_configs.push(PeerConfig::new(public_key, "", &peer.endpoint, &peer.allowed_ips)?);
        }
        debug!(device = %self.device_name, peers = peer_configs.len(), "Updating wg peers");
        self.peer_sync
            .set_peers(&self.device_name, peer_configs)
            .await?;
        *self.peers.write().await = peers;
        Ok(())
    }

    fn calculate_peers_from_node_list(&self, nodes: &[Node]) -> HashMap<String, Peer> {
        let mut peers = HashMap::new();
        for node in nodes {
            if let Some((public_key, peer)) = self.peer_from_node(node) {
                peers.insert(public_key, peer);
            }
        }
        peers
    }

    /// Extract the advertised peer from a node, or None when either watch
    /// annotation is missing.
    fn peer_from_node(&self, node: &Node) -> Option<(String, Peer)> {
        let annotations = node.metadata.annotations.as_ref()?;
        let public_key = annotations.get(&self.annotations.watch_public_key)?;
        let endpoint = annotations.get(&self.annotations.watch_endpoint)?;
        let pod_cidr = node
            .spec
            .as_ref()
            .and_then(|spec| spec.pod_cidr.clone())
            .unwrap_or_default();
        Some((
            public_key.clone(),
            Peer {
                allowed_ips: vec![pod_cidr],
                endpoint: endpoint.clone(),
            },
        ))
    }

    async fn handle_node_event(self: Arc<Self>, event_type: WatchEventType, node: Node) {
        match event_type {
            WatchEventType::Added | WatchEventType::Modified => match self.peer_from_node(&node) {
                Some((public_key, peer)) => self.on_peer_node_update(public_key, peer).await,
                None => debug!(
                    node = %node.name_any(),
                    "Node missing the needed wireguard annotations"
                ),
            },
            WatchEventType::Deleted => match self.peer_from_node(&node) {
                Some((public_key, _)) => self.on_peer_node_delete(public_key).await,
                None => debug!(
                    node = %node.name_any(),
                    "Deleted node missing the needed wireguard annotations"
                ),
            },
        }
    }

    async fn on_peer_node_update(self: &Arc<Self>, public_key: String, peer: Peer) {
        debug!(device = %self.device_name, "On peer node update");
        {
            let peers = self.peers.read().await;
            if peers.get(&public_key) == Some(&peer) {
                return;
            }
        }
        self.enqueue_peers_sync().await;
    }

    async fn on_peer_node_delete(self: &Arc<Self>, public_key: String) {
        debug!(device = %self.device_name, "On peer node delete");
        {
            let peers = self.peers.read().await;
            if !peers.contains_key(&public_key) {
                // Peer was never applied, nothing to converge.
                return;
            }
        }
        self.enqueue_peers_sync().await;
    }
}

/// Write the advertised public key and `<firstInternalIP>:<listenPort>`
/// endpoint onto the local node. A node without an InternalIP address is an
/// error; there is nothing useful to advertise.
async fn advertise_local_node(
    client: &Client,
    node_name: &str,
    annotations: &RunnerAnnotations,
    public_key: &str,
    listen_port: u16,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes.get(node_name).await?;
    let endpoint = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| format!("{}:{listen_port}", a.address))
        .ok_or_else(|| {
            Error::device("could not calculate wg endpoint, node internal address not found")
        })?;
    let annotations = HashMap::from([
        (
            annotations.advertise_public_key.clone(),
            public_key.to_string(),
        ),
        (annotations.advertise_endpoint.clone(), endpoint),
    ]);
    patch_node_annotations(client, node_name, &annotations).await
}

async fn sync_loop(
    state: Arc<RunnerState>,
    watcher: Arc<NodeWatcher>,
    mut sync_rx: mpsc::Receiver<()>,
    stop: CancellationToken,
    full_resync_period: Duration,
) {
    let mut ticker = tokio::time::interval(full_resync_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // An interval's first tick completes immediately; consume it so the
    // first forced resync happens one full period from now.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(device = %state.device_name, "Stopping sync loop");
                return;
            }
            Some(()) = sync_rx.recv() => state.do_sync_peers(&watcher).await,
            _ = ticker.tick() => {
                info!(device = %state.device_name, "Full sync ticker expired, attempting a peers sync");
                state.do_sync_peers(&watcher).await;
            }
        }
    }
}

/// Keeps a watch on a remote cluster's nodes and converges the local
/// WireGuard device's peers toward what they advertise.
pub struct Runner {
    state: Arc<RunnerState>,
    watcher: Arc<NodeWatcher>,
    device: Device,
    local_client: Client,
    node_name: String,
    pod_subnet: IpNet,
    stop: CancellationToken,
}

impl Runner {
    /// Construct a runner and start its sync loop.
    ///
    /// `local_client` talks to the cluster whose node gets annotated;
    /// `watch_client` talks to the remote cluster whose nodes are watched.
    pub fn new(
        local_client: Client,
        watch_client: Client,
        config: RunnerConfig,
        peer_sync: Arc<dyn PeerSync>,
    ) -> Self {
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let state = Arc::new(RunnerState {
            device_name: config.wg_device_name.clone(),
            annotations: RunnerAnnotations::new(
                &config.local_cluster_name,
                &config.remote_cluster_name,
            ),
            peers: RwLock::new(HashMap::new()),
            can_sync: AtomicBool::new(false),
            sync_tx,
            peer_sync,
        });
        let handler: NodeEventHandler = {
            let state = Arc::clone(&state);
            Arc::new(move |event_type, node| {
                let state = Arc::clone(&state);
                state.handle_node_event(event_type, node).boxed()
            })
        };
        let watcher = Arc::new(NodeWatcher::new(
            watch_client,
            config.remote_cluster_name.clone(),
            config.watcher_resync_period,
            handler,
        ));
        let device = Device::new(
            config.wg_device_name,
            config.wg_key_filename,
            config.wg_device_mtu,
            config.wg_listen_port,
        );
        let stop = CancellationToken::new();
        tokio::spawn(sync_loop(
            Arc::clone(&state),
            Arc::clone(&watcher),
            sync_rx,
            stop.clone(),
            config.full_resync_period,
        ));
        Self {
            state,
            watcher,
            device,
            local_client,
            node_name: config.node_name,
            pod_subnet: config.pod_subnet,
            stop,
        }
    }

    /// Set up the device and the local advertisement, then start watching
    /// the remote cluster.
    ///
    /// Peer syncs are enabled only after the watcher cache completed its
    /// initial list, so a half-filled cache can never wipe the peer table.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.device.run().await?;
        self.device.configure()?;
        self.patch_local_node().await?;
        self.device.flush_addresses().await?;
        self.device.ensure_link_up().await?;
        {
            let watcher = Arc::clone(&self.watcher);
            tokio::spawn(async move { watcher.run().await });
        }
        self.wait_for_cache_sync().await;
        self.device.add_route_to_net(&self.pod_subnet).await?;
        self.state.can_sync.store(true, Ordering::SeqCst);
        self.state.enqueue_peers_sync().await;
        Ok(())
    }

    // TODO: bound the wait and fail the runner if the cache never syncs;
    // right now a dead remote API server keeps startup waiting forever.
    async fn wait_for_cache_sync(&self) {
        while !self.watcher.has_synced() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Advertise this node's device public key and endpoint so the far side
    /// can add it as a peer. Must run after the device is configured.
    async fn patch_local_node(&self) -> Result<(), Error> {
        let public_key = self
            .device
            .public_key()
            .ok_or_else(|| Error::device("device public key is not set"))?;
        advertise_local_node(
            &self.local_client,
            &self.node_name,
            &self.state.annotations,
            public_key,
            self.device.listen_port(),
        )
        .await
    }

    /// The name of the device this runner owns
    pub fn device_name(&self) -> &str {
        self.state.device_name.as_str()
    }

    /// True while the remote node watcher reports healthy
    pub fn healthy(&self) -> bool {
        self.watcher.healthy()
    }

    /// Stop the sync loop and the node watcher
    pub fn stop(&self) {
        self.stop.cancel();
        self.watcher.stop();
    }
}

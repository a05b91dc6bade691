//! Informer-style watch over a cluster's nodes.
//!
//! Maintains a local cache fed by a list+watch stream, delivers
//! Added/Modified/Deleted callbacks, and relists on a fixed period so the
//! cache converges even if watch events were dropped. List and watch health
//! are tracked separately; both must be good for the watcher to report
//! healthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

/// The kind of node change delivered to the event handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    /// Node appeared (including the initial list burst)
    Added,
    /// Node changed (including relist re-deliveries)
    Modified,
    /// Node is gone
    Deleted,
}

/// Callback invoked for every node event. Callbacks are serialized: the next
/// event is not delivered until the returned future completes.
pub type NodeEventHandler =
    Arc<dyn Fn(WatchEventType, Node) -> BoxFuture<'static, ()> + Send + Sync>;

/// Watches one cluster's nodes and keeps a local cache
pub struct NodeWatcher {
    client: Client,
    cluster_name: String,
    resync_period: Duration,
    handler: NodeEventHandler,
    store: RwLock<HashMap<String, Node>>,
    synced: AtomicBool,
    list_healthy: AtomicBool,
    watch_healthy: AtomicBool,
    stop: CancellationToken,
}

impl NodeWatcher {
    /// Create a watcher for the given cluster.
    ///
    /// `cluster_name` labels failure metrics; `resync_period` bounds how
    /// long the cache can drift before a full relist.
    pub fn new(
        client: Client,
        cluster_name: impl Into<String>,
        resync_period: Duration,
        handler: NodeEventHandler,
    ) -> Self {
        Self {
            client,
            cluster_name: cluster_name.into(),
            resync_period,
            handler,
            store: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            list_healthy: AtomicBool::new(false),
            watch_healthy: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    /// Run the list+watch loop until [`NodeWatcher::stop`] is called.
    ///
    /// The watch stream is recreated every `resync_period`, which re-lists
    /// the node collection and re-delivers Modified callbacks for every
    /// cached node.
    pub async fn run(&self) {
        info!(cluster = %self.cluster_name, "Starting node watcher");
        while !self.stop.is_cancelled() {
            let api: Api<Node> = Api::all(self.client.clone());
            let mut stream = watcher::watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();
            let relist = tokio::time::sleep(self.resync_period);
            tokio::pin!(relist);
            let mut pending: Option<HashMap<String, Node>> = None;
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => {
                        info!(cluster = %self.cluster_name, "Stopped node watcher");
                        return;
                    }
                    _ = &mut relist => {
                        debug!(cluster = %self.cluster_name, "Resync period expired, relisting nodes");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.handle_watch_event(event, &mut pending).await,
                        Some(Err(e)) => self.record_failure(&e),
                        None => break,
                    }
                }
            }
        }
    }

    /// Cancel the watch loop
    pub fn stop(&self) {
        info!(cluster = %self.cluster_name, "Stopping node watcher");
        self.stop.cancel();
    }

    /// Whether the initial node list has been absorbed into the cache
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// All nodes currently in the cache
    pub async fn list(&self) -> Vec<Node> {
        self.store.read().await.values().cloned().collect()
    }

    /// True when both the list and watch sides are operating without errors
    pub fn healthy(&self) -> bool {
        self.list_healthy.load(Ordering::SeqCst) && self.watch_healthy.load(Ordering::SeqCst)
    }

    fn record_failure(&self, error: &watcher::Error) {
        let verb = match error {
            watcher::Error::InitialListFailed(_) => {
                self.list_healthy.store(false, Ordering::SeqCst);
                "list"
            }
            _ => {
                self.watch_healthy.store(false, Ordering::SeqCst);
                "watch"
            }
        };
        warn!(cluster = %self.cluster_name, verb, error = %error, "Node watcher error");
        metrics::inc_node_watcher_failures(&self.cluster_name, verb);
    }

    async fn handle_watch_event(
        &self,
        event: Event<Node>,
        pending: &mut Option<HashMap<String, Node>>,
    ) {
        match event {
            Event::Init => {
                *pending = Some(HashMap::new());
            }
            Event::InitApply(node) => {
                let name = node.name_any();
                if let Some(buffer) = pending.as_mut() {
                    buffer.insert(name.clone(), node.clone());
                }
                let existed = {
                    let mut store = self.store.write().await;
                    store.insert(name, node.clone()).is_some()
                };
                let event_type = if existed {
                    WatchEventType::Modified
                } else {
                    WatchEventType::Added
                };
                (self.handler)(event_type, node).await;
            }
            Event::InitDone => {
                if let Some(buffer) = pending.take() {
                    // Nodes that disappeared between watch sessions get a
                    // Deleted callback now.
                    let stale: Vec<Node> = {
                        let mut store = self.store.write().await;
                        let stale = store
                            .iter()
                            .filter(|(name, _)| !buffer.contains_key(*name))
                            .map(|(_, node)| node.clone())
                            .collect();
                        store.retain(|name, _| buffer.contains_key(name));
                        stale
                    };
                    for node in stale {
                        (self.handler)(WatchEventType::Deleted, node).await;
                    }
                }
                self.list_healthy.store(true, Ordering::SeqCst);
                self.watch_healthy.store(true, Ordering::SeqCst);
                self.synced.store(true, Ordering::SeqCst);
                debug!(cluster = %self.cluster_name, "Node cache synced");
            }
            Event::Apply(node) => {
                let name = node.name_any();
                let existed = {
                    let mut store = self.store.write().await;
                    store.insert(name, node.clone()).is_some()
                };
                self.watch_healthy.store(true, Ordering::SeqCst);
                let event_type = if existed {
                    WatchEventType::Modified
                } else {
                    WatchEventType::Added
                };
                (self.handler)(event_type, node).await;
            }
            Event::Delete(node) => {
                {
                    let mut store = self.store.write().await;
                    store.remove(&node.name_any());
                }
                self.watch_healthy.store(true, Ordering::SeqCst);
                (self.handler)(WatchEventType::Deleted, node).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn recording_watcher() -> (NodeWatcher, Arc<Mutex<Vec<(WatchEventType, String)>>>) {
        let events: Arc<Mutex<Vec<(WatchEventType, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let handler: NodeEventHandler = Arc::new(move |event_type, node: Node| {
            let recorded = recorded.clone();
            async move {
                if let Ok(mut guard) = recorded.lock() {
                    guard.push((event_type, node.name_any()));
                }
            }
            .boxed()
        });
        let client = Client::new(
            tower::service_fn(|_req: http::Request<kube::client::Body>| async {
                Err::<http::Response<kube::client::Body>, tower::BoxError>("no cluster".into())
            }),
            "default",
        );
        (
            NodeWatcher::new(client, "test-cluster", Duration::from_secs(3600), handler),
            events,
        )
    }

    #[tokio::test]
    async fn init_burst_populates_store_and_fires_added() {
        let (watcher, events) = recording_watcher();
        let mut pending = None;
        watcher.handle_watch_event(Event::Init, &mut pending).await;
        watcher
            .handle_watch_event(Event::InitApply(node("a")), &mut pending)
            .await;
        watcher
            .handle_watch_event(Event::InitApply(node("b")), &mut pending)
            .await;
        assert!(!watcher.has_synced());
        watcher.handle_watch_event(Event::InitDone, &mut pending).await;

        assert!(watcher.has_synced());
        assert!(watcher.healthy());
        assert_eq!(watcher.list().await.len(), 2);
        let recorded = events.lock().unwrap();
        assert_eq!(
            *recorded,
            vec![
                (WatchEventType::Added, "a".to_string()),
                (WatchEventType::Added, "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn relist_drops_vanished_nodes_with_deleted_callback() {
        let (watcher, events) = recording_watcher();
        let mut pending = None;
        watcher.handle_watch_event(Event::Init, &mut pending).await;
        watcher
            .handle_watch_event(Event::InitApply(node("a")), &mut pending)
            .await;
        watcher
            .handle_watch_event(Event::InitApply(node("b")), &mut pending)
            .await;
        watcher.handle_watch_event(Event::InitDone, &mut pending).await;

        // Second list only contains "a"; "b" vanished while not watching.
        let mut pending = None;
        watcher.handle_watch_event(Event::Init, &mut pending).await;
        watcher
            .handle_watch_event(Event::InitApply(node("a")), &mut pending)
            .await;
        watcher.handle_watch_event(Event::InitDone, &mut pending).await;

        assert_eq!(watcher.list().await.len(), 1);
        let recorded = events.lock().unwrap();
        assert_eq!(
            recorded.last().cloned(),
            Some((WatchEventType::Deleted, "b".to_string()))
        );
        // The relisted node is re-delivered as Modified.
        assert!(recorded.contains(&(WatchEventType::Modified, "a".to_string())));
    }

    #[tokio::test]
    async fn apply_and_delete_update_the_store() {
        let (watcher, events) = recording_watcher();
        let mut pending = None;
        watcher
            .handle_watch_event(Event::Apply(node("a")), &mut pending)
            .await;
        assert_eq!(watcher.list().await.len(), 1);
        watcher
            .handle_watch_event(Event::Apply(node("a")), &mut pending)
            .await;
        watcher
            .handle_watch_event(Event::Delete(node("a")), &mut pending)
            .await;
        assert!(watcher.list().await.is_empty());
        let recorded = events.lock().unwrap();
        assert_eq!(
            *recorded,
            vec![
                (WatchEventType::Added, "a".to_string()),
                (WatchEventType::Modified, "a".to_string()),
                (WatchEventType::Deleted, "a".to_string()),
            ]
        );
    }
}

//! Prometheus metrics for semaphore-wireguard.
//!
//! Process counters live in static families so any module can record into
//! them; they are attached to the registry (with pre-initialized zero
//! series) at startup. Per-device state is not cached: a custom collector
//! snapshots the live WireGuard devices on every scrape.

use std::fmt;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric};
use prometheus_client::metrics::counter::{ConstCounter, Counter};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;
use tracing::error;

use crate::error::Error;
use crate::wireguard::DeviceSnapshot;

/// Labels for peer sync attempts
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncAttemptLabels {
    /// Device the sync targeted
    pub device: String,
    /// `"1"` for success, `"0"` for failure
    pub success: String,
}

/// Labels carrying only the device name
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceLabels {
    /// Device name
    pub device: String,
}

/// Labels for Kubernetes API requests
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KubeRequestLabels {
    /// API server host
    pub host: String,
    /// HTTP status code
    pub code: String,
    /// HTTP method
    pub method: String,
}

// The node watcher failure metric carries a literal `type` label, which is a
// reserved word as a struct field, so its label set is a plain pair list.
type LabelPairs = Vec<(String, String)>;

/// Counts runners' attempts to sync peers, by device and outcome
pub static SYNC_PEERS_ATTEMPT: LazyLock<Family<SyncAttemptLabels, Counter>> =
    LazyLock::new(Family::default);

/// Counts sync tasks that could not be queued in time
pub static SYNC_QUEUE_FULL_FAILURES: LazyLock<Family<DeviceLabels, Counter>> =
    LazyLock::new(Family::default);

/// Counts sync requeue attempts
pub static SYNC_REQUEUE: LazyLock<Family<DeviceLabels, Counter>> = LazyLock::new(Family::default);

/// Counts node watcher list/watch failures, by cluster and verb
pub static NODE_WATCHER_FAILURES: LazyLock<Family<LabelPairs, Counter>> =
    LazyLock::new(Family::default);

/// Counts HTTP requests to the Kubernetes API
pub static KUBE_HTTP_REQUESTS: LazyLock<Family<KubeRequestLabels, Counter>> =
    LazyLock::new(Family::default);

/// Record one peer sync attempt for the device
pub fn record_sync_peer_attempt(device: &str, success: bool) {
    SYNC_PEERS_ATTEMPT
        .get_or_create(&SyncAttemptLabels {
            device: device.to_string(),
            success: if success { "1" } else { "0" }.to_string(),
        })
        .inc();
}

/// Record a sync that could not be queued because the queue was full
pub fn inc_sync_queue_full_failures(device: &str) {
    SYNC_QUEUE_FULL_FAILURES
        .get_or_create(&DeviceLabels {
            device: device.to_string(),
        })
        .inc();
}

/// Record a sync requeue attempt
pub fn inc_sync_requeue(device: &str) {
    SYNC_REQUEUE
        .get_or_create(&DeviceLabels {
            device: device.to_string(),
        })
        .inc();
}

/// Record a node watcher list/watch failure
pub fn inc_node_watcher_failures(cluster: &str, verb: &str) {
    NODE_WATCHER_FAILURES
        .get_or_create(&vec![
            ("cluster".to_string(), cluster.to_string()),
            ("type".to_string(), verb.to_string()),
        ])
        .inc();
}

/// Record one HTTP request to a Kubernetes API server
pub fn inc_kube_http_request(host: &str, code: u16, method: &str) {
    KUBE_HTTP_REQUESTS
        .get_or_create(&KubeRequestLabels {
            host: host.to_string(),
            code: code.to_string(),
            method: method.to_string(),
        })
        .inc();
}

/// Reader producing live snapshots of all owned devices
pub type DeviceReader = Box<dyn Fn() -> Result<Vec<DeviceSnapshot>, Error> + Send + Sync>;

/// Collector exporting per-device and per-peer series on every scrape
pub struct WgCollector {
    devices: DeviceReader,
}

impl WgCollector {
    /// Create a collector over the given device reader.
    ///
    /// Taking a reader function rather than device names keeps the
    /// collector testable with fixture snapshots.
    pub fn new(devices: DeviceReader) -> Self {
        Self { devices }
    }
}

impl fmt::Debug for WgCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgCollector").finish_non_exhaustive()
    }
}

impl Collector for WgCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        let devices = match (self.devices)() {
            Ok(devices) => devices,
            Err(e) => {
                // A failed device read degrades the scrape rather than
                // failing it; the device series are simply absent.
                error!(error = %e, "Failed to read wg devices for metrics collection");
                return Ok(());
            }
        };

        let mut device_info = encoder.encode_descriptor(
            "semaphore_wg_device_info",
            "Metadata about a device",
            None,
            MetricType::Gauge,
        )?;
        for device in &devices {
            let labels = vec![
                ("device".to_string(), device.name.clone()),
                ("public_key".to_string(), device.public_key.clone()),
            ];
            ConstGauge::new(1i64).encode(device_info.encode_family(&labels)?)?;
        }
        drop(device_info);

        let mut peer_info = encoder.encode_descriptor(
            "semaphore_wg_peer_info",
            "Metadata about a peer; public_key refers to the peer, not the device",
            None,
            MetricType::Gauge,
        )?;
        for device in &devices {
            for peer in &device.peers {
                let endpoint = peer.endpoint.map(|e| e.to_string()).unwrap_or_default();
                let labels = vec![
                    ("device".to_string(), device.name.clone()),
                    ("public_key".to_string(), peer.public_key.clone()),
                    ("endpoint".to_string(), endpoint),
                ];
                ConstGauge::new(1i64).encode(peer_info.encode_family(&labels)?)?;
            }
        }
        drop(peer_info);

        let mut allowed_ips_info = encoder.encode_descriptor(
            "semaphore_wg_peer_allowed_ips_info",
            "Metadata about each of a peer's allowed IP subnets for a given device",
            None,
            MetricType::Gauge,
        )?;
        for device in &devices {
            for peer in &device.peers {
                for allowed_ip in &peer.allowed_ips {
                    let labels = vec![
                        ("device".to_string(), device.name.clone()),
                        ("public_key".to_string(), peer.public_key.clone()),
                        ("allowed_ips".to_string(), allowed_ip.clone()),
                    ];
                    ConstGauge::new(1i64).encode(allowed_ips_info.encode_family(&labels)?)?;
                }
            }
        }
        drop(allowed_ips_info);

        let mut receive_bytes = encoder.encode_descriptor(
            "semaphore_wg_peer_receive_bytes",
            "Number of bytes received from a given peer",
            None,
            MetricType::Counter,
        )?;
        for device in &devices {
            for peer in &device.peers {
                let labels = vec![
                    ("device".to_string(), device.name.clone()),
                    ("public_key".to_string(), peer.public_key.clone()),
                ];
                ConstCounter::new(peer.receive_bytes).encode(receive_bytes.encode_family(&labels)?)?;
            }
        }
        drop(receive_bytes);

        let mut transmit_bytes = encoder.encode_descriptor(
            "semaphore_wg_peer_transmit_bytes",
            "Number of bytes transmitted to a given peer",
            None,
            MetricType::Counter,
        )?;
        for device in &devices {
            for peer in &device.peers {
                let labels = vec![
                    ("device".to_string(), device.name.clone()),
                    ("public_key".to_string(), peer.public_key.clone()),
                ];
                ConstCounter::new(peer.transmit_bytes)
                    .encode(transmit_bytes.encode_family(&labels)?)?;
            }
        }
        drop(transmit_bytes);

        let mut last_handshake = encoder.encode_descriptor(
            "semaphore_wg_peer_last_handshake_seconds",
            "UNIX timestamp for the last handshake with a given peer",
            None,
            MetricType::Gauge,
        )?;
        for device in &devices {
            for peer in &device.peers {
                let seconds = peer
                    .last_handshake
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                let labels = vec![
                    ("device".to_string(), device.name.clone()),
                    ("public_key".to_string(), peer.public_key.clone()),
                ];
                ConstGauge::new(seconds).encode(last_handshake.encode_family(&labels)?)?;
            }
        }

        Ok(())
    }
}

const NODE_WATCHER_VERBS: [&str; 7] = ["get", "list", "create", "update", "patch", "watch", "delete"];

/// Register all process counters and the device collector.
///
/// Counters are pre-initialized with zero series for every known device and
/// cluster so dashboards see them before the first increment.
pub fn register(
    registry: &mut Registry,
    device_names: &[String],
    cluster_names: &[String],
    devices: DeviceReader,
) {
    registry.register(
        "semaphore_wg_sync_peers",
        "Counts runners' attempts to sync peers",
        SYNC_PEERS_ATTEMPT.clone(),
    );
    registry.register(
        "semaphore_wg_sync_queue_full_failures",
        "Number of times a sync task was not added to the sync queue in time because the queue was full",
        SYNC_QUEUE_FULL_FAILURES.clone(),
    );
    registry.register(
        "semaphore_wg_sync_requeue",
        "Number of attempts to requeue a sync",
        SYNC_REQUEUE.clone(),
    );
    registry.register(
        "semaphore_wg_node_watcher_failures",
        "Number of times the node watcher list/watch functions errored",
        NODE_WATCHER_FAILURES.clone(),
    );
    registry.register(
        "semaphore_wg_kube_http_request",
        "Total number of HTTP requests to the Kubernetes API by host, code and method",
        KUBE_HTTP_REQUESTS.clone(),
    );

    for device in device_names {
        for success in ["0", "1"] {
            SYNC_PEERS_ATTEMPT.get_or_create(&SyncAttemptLabels {
                device: device.clone(),
                success: success.to_string(),
            });
        }
        SYNC_QUEUE_FULL_FAILURES.get_or_create(&DeviceLabels {
            device: device.clone(),
        });
        SYNC_REQUEUE.get_or_create(&DeviceLabels {
            device: device.clone(),
        });
    }
    for cluster in cluster_names {
        for verb in NODE_WATCHER_VERBS {
            NODE_WATCHER_FAILURES.get_or_create(&vec![
                ("cluster".to_string(), cluster.clone()),
                ("type".to_string(), verb.to_string()),
            ]);
        }
    }

    registry.register_collector(Box::new(WgCollector::new(devices)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::PeerSnapshot;
    use prometheus_client::encoding::text::encode;
    use std::net::SocketAddr;
    use std::time::Duration;

    const PUB_DEV_A: &str = "YDpmshvOhFLcVNR/yNdMnJJGeA0P+8unDLLBYkemV2w=";
    const PUB_PEER_A: &str = "NkEtSA6GosX40iZFNe9+byAkXweYKvQe3utnFYkQ+00=";
    const PUB_PEER_B: &str = "pbFLuWcDYyMZHjSYYZ288bLBJ2hY9PM1dD22CmBmdDc=";

    fn fixture_devices() -> Vec<DeviceSnapshot> {
        vec![DeviceSnapshot {
            name: "wg0".to_string(),
            public_key: PUB_DEV_A.to_string(),
            peers: vec![
                PeerSnapshot {
                    public_key: PUB_PEER_A.to_string(),
                    endpoint: Some("1.1.1.1:51820".parse::<SocketAddr>().unwrap()),
                    allowed_ips: vec!["10.0.0.1/32".to_string(), "10.0.0.2/32".to_string()],
                    receive_bytes: 1,
                    transmit_bytes: 2,
                    last_handshake: Some(UNIX_EPOCH + Duration::from_secs(10)),
                },
                PeerSnapshot {
                    public_key: PUB_PEER_B.to_string(),
                    endpoint: None,
                    allowed_ips: vec!["10.0.0.3/32".to_string()],
                    receive_bytes: 0,
                    transmit_bytes: 0,
                    last_handshake: None,
                },
            ],
        }]
    }

    #[test]
    fn collector_exports_device_and_peer_series() {
        let mut registry = Registry::default();
        registry.register_collector(Box::new(WgCollector::new(Box::new(|| {
            Ok(fixture_devices())
        }))));

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();

        let expected = [
            format!(r#"semaphore_wg_device_info{{device="wg0",public_key="{PUB_DEV_A}"}} 1"#),
            format!(
                r#"semaphore_wg_peer_info{{device="wg0",public_key="{PUB_PEER_A}",endpoint="1.1.1.1:51820"}} 1"#
            ),
            format!(r#"semaphore_wg_peer_info{{device="wg0",public_key="{PUB_PEER_B}",endpoint=""}} 1"#),
            format!(
                r#"semaphore_wg_peer_allowed_ips_info{{device="wg0",public_key="{PUB_PEER_A}",allowed_ips="10.0.0.1/32"}} 1"#
            ),
            format!(
                r#"semaphore_wg_peer_allowed_ips_info{{device="wg0",public_key="{PUB_PEER_A}",allowed_ips="10.0.0.2/32"}} 1"#
            ),
            format!(
                r#"semaphore_wg_peer_allowed_ips_info{{device="wg0",public_key="{PUB_PEER_B}",allowed_ips="10.0.0.3/32"}} 1"#
            ),
            format!(r#"semaphore_wg_peer_receive_bytes_total{{device="wg0",public_key="{PUB_PEER_A}"}} 1"#),
            format!(r#"semaphore_wg_peer_receive_bytes_total{{device="wg0",public_key="{PUB_PEER_B}"}} 0"#),
            format!(r#"semaphore_wg_peer_transmit_bytes_total{{device="wg0",public_key="{PUB_PEER_A}"}} 2"#),
            format!(r#"semaphore_wg_peer_transmit_bytes_total{{device="wg0",public_key="{PUB_PEER_B}"}} 0"#),
            format!(
                r#"semaphore_wg_peer_last_handshake_seconds{{device="wg0",public_key="{PUB_PEER_A}"}} 10"#
            ),
            format!(
                r#"semaphore_wg_peer_last_handshake_seconds{{device="wg0",public_key="{PUB_PEER_B}"}} 0"#
            ),
        ];
        for line in expected {
            assert!(body.contains(&line), "missing metric line: {line}\nin:\n{body}");
        }
    }

    #[test]
    fn failing_device_reader_does_not_crash_the_scrape() {
        let mut registry = Registry::default();
        registry.register_collector(Box::new(WgCollector::new(Box::new(|| {
            Err(Error::device("no such device"))
        }))));

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(!body.contains("semaphore_wg_device_info"));
    }

    #[test]
    fn counters_are_zero_initialized() {
        let mut registry = Registry::default();
        register(
            &mut registry,
            &["wg-zeroinit".to_string()],
            &["cluster-zeroinit".to_string()],
            Box::new(|| Ok(Vec::new())),
        );

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(body.contains(
            r#"semaphore_wg_sync_peers_total{device="wg-zeroinit",success="0"} 0"#
        ));
        assert!(body.contains(
            r#"semaphore_wg_sync_peers_total{device="wg-zeroinit",success="1"} 0"#
        ));
        assert!(body
            .contains(r#"semaphore_wg_sync_queue_full_failures_total{device="wg-zeroinit"} 0"#));
        assert!(body.contains(
            r#"semaphore_wg_node_watcher_failures_total{cluster="cluster-zeroinit",type="watch"} 0"#
        ));
    }
}

//! semaphore-wireguard - WireGuard mesh between Kubernetes clusters

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use semaphore_wireguard::config::{parse_config, DEFAULT_RESYNC_PERIOD};
use semaphore_wireguard::kube::{client_from_kubeconfig, client_from_token};
use semaphore_wireguard::metrics;
use semaphore_wireguard::runner::{wg_device_name, Runner, RunnerConfig};
use semaphore_wireguard::wireguard::{device_snapshot, verify_interface_name, KernelPeerSync};

/// semaphore-wireguard - node agent meshing Kubernetes clusters over WireGuard
#[derive(Parser, Debug)]
#[command(name = "semaphore-wireguard", version, about, long_about = None)]
struct Cli {
    /// The local cluster node this process runs on
    #[arg(long, env = "SWG_NODE_NAME")]
    node_name: String,

    /// Path of the clusters configuration file
    #[arg(long, env = "SWG_CLUSTERS_CONFIG")]
    clusters_config: PathBuf,

    /// Directory to store and look for wg private keys
    #[arg(long, env = "SWG_WG_KEY_PATH", default_value = "/var/lib/semaphore-wireguard")]
    wg_key_path: PathBuf,

    /// Listen address to serve health and metrics
    #[arg(long, env = "SWG_LISTEN_ADDRESS", default_value = ":7773")]
    listen_address: String,

    /// Log level
    #[arg(long, env = "SWG_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    runners: Arc<Vec<Runner>>,
}

/// Turn a Go style `:port` listen address into one `TcpListener` accepts
fn normalize_listen_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let raw_config = tokio::fs::read(&cli.clusters_config)
        .await
        .with_context(|| format!("cannot read config file {}", cli.clusters_config.display()))?;
    let config = parse_config(&raw_config)?;

    let local_client = client_from_kubeconfig(&config.local.kube_config_path)
        .await
        .context("cannot create kube client for the local cluster")?;
    let peer_sync = Arc::new(KernelPeerSync);

    let mut runners = Vec::new();
    let mut device_names = Vec::new();
    let mut cluster_names = Vec::new();
    for remote in &config.remotes {
        let device_name = wg_device_name(&remote.name);
        verify_interface_name(&device_name)
            .with_context(|| format!("invalid device name for remote {}", remote.name))?;

        let watch_client = if !remote.kube_config_path.is_empty() {
            client_from_kubeconfig(&remote.kube_config_path)
                .await
                .with_context(|| format!("cannot create kube client for remote {}", remote.name))?
        } else {
            let token = tokio::fs::read_to_string(&remote.remote_sa_token_path)
                .await
                .with_context(|| {
                    format!("cannot read token file {}", remote.remote_sa_token_path)
                })?;
            client_from_token(&token, &remote.remote_api_url, &remote.remote_ca_url)
                .await
                .with_context(|| format!("cannot create kube client for remote {}", remote.name))?
        };

        let pod_subnet: IpNet = remote
            .pod_subnet
            .parse()
            .with_context(|| format!("cannot parse pod subnet for remote {}", remote.name))?;
        let resync_period = if remote.resync_period.is_zero() {
            DEFAULT_RESYNC_PERIOD
        } else {
            remote.resync_period.0
        };

        let mut runner = Runner::new(
            local_client.clone(),
            watch_client,
            RunnerConfig {
                node_name: cli.node_name.clone(),
                local_cluster_name: config.local.name.clone(),
                remote_cluster_name: remote.name.clone(),
                wg_device_name: device_name.clone(),
                wg_key_filename: cli.wg_key_path.join(format!("{device_name}.key")),
                wg_device_mtu: remote.wg_device_mtu,
                wg_listen_port: remote.wg_listen_port,
                pod_subnet,
                watcher_resync_period: resync_period,
                full_resync_period: resync_period,
            },
            peer_sync.clone(),
        );
        runner
            .run()
            .await
            .with_context(|| format!("failed to start runner for remote {}", remote.name))?;

        device_names.push(device_name);
        cluster_names.push(remote.name.clone());
        runners.push(runner);
    }
    let runners = Arc::new(runners);

    let mut registry = Registry::default();
    let collector_devices = device_names.clone();
    metrics::register(
        &mut registry,
        &device_names,
        &cluster_names,
        Box::new(move || collector_devices.iter().map(|name| device_snapshot(name)).collect()),
    );

    let state = AppState {
        registry: Arc::new(registry),
        runners: runners.clone(),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state);

    let address = normalize_listen_address(&cli.listen_address);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind listen address {address}"))?;
    info!(address = %address, "Serving health and metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runners))
        .await
        .context("health and metrics server failed")?;

    Ok(())
}

async fn shutdown_signal(runners: Arc<Vec<Runner>>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("Shutdown signal received, stopping runners");
    for runner in runners.iter() {
        runner.stop();
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let mut body = String::new();
    encode(&mut body, &state.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(body)
}

async fn healthz_handler(State(state): State<AppState>) -> StatusCode {
    // 200 only when every runner is healthy.
    if state.runners.iter().all(Runner::healthy) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

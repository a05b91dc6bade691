//! WireGuard device and peer management.
//!
//! [`device`] owns the kernel link lifecycle (create, MTU, addresses, routes).
//! This module holds the peer-facing pieces: building validated peer
//! descriptors, reconciling the kernel peer table against a desired set, and
//! snapshotting live device state for the metrics collector.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, SystemTime};

use ipnet::IpNet;
use wireguard_control::{Backend, Device as WgDevice, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::error::Error;

pub mod device;

pub use device::Device;

/// Keepalive applied to every configured peer, so NAT mappings on either
/// side stay warm.
const PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(25);

/// Validated configuration for a single WireGuard peer.
#[derive(Clone)]
pub struct PeerConfig {
    public_key: Key,
    preshared_key: Option<Key>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Duration,
}

impl PeerConfig {
    /// Build a peer configuration, validating every field.
    ///
    /// The public key is mandatory; the preshared key and endpoint are
    /// optional. The endpoint must resolve to an IPv4 UDP address and every
    /// allowed IP must parse as a network.
    pub fn new(
        public_key: &str,
        preshared_key: &str,
        endpoint: &str,
        allowed_ips: &[String],
    ) -> Result<Self, Error> {
        if public_key.is_empty() {
            return Err(Error::sync("peer public key is empty"));
        }
        let public_key = Key::from_base64(public_key)
            .map_err(|e| Error::sync(format!("cannot parse peer public key: {e}")))?;
        let preshared_key = if preshared_key.is_empty() {
            None
        } else {
            Some(
                Key::from_base64(preshared_key)
                    .map_err(|e| Error::sync(format!("cannot parse preshared key: {e}")))?,
            )
        };
        let endpoint = if endpoint.is_empty() {
            None
        } else {
            let addr = endpoint
                .to_socket_addrs()
                .map_err(|e| Error::sync(format!("cannot resolve endpoint {endpoint:?}: {e}")))?
                .find(SocketAddr::is_ipv4)
                .ok_or_else(|| {
                    Error::sync(format!("endpoint {endpoint:?} has no IPv4 address"))
                })?;
            Some(addr)
        };
        let allowed_ips = allowed_ips
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNet>()
                    .map_err(|e| Error::sync(format!("cannot parse allowed ip {cidr:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            public_key,
            preshared_key,
            endpoint,
            allowed_ips,
            persistent_keepalive: PERSISTENT_KEEPALIVE,
        })
    }

    /// The peer's public key in base64 form
    pub fn public_key_base64(&self) -> String {
        self.public_key.to_base64()
    }

    /// The peer's resolved endpoint, if any
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// The networks routed to this peer
    pub fn allowed_ips(&self) -> &[IpNet] {
        &self.allowed_ips
    }

    fn to_builder(&self) -> PeerConfigBuilder {
        let mut builder = PeerConfigBuilder::new(&self.public_key)
            .replace_allowed_ips()
            .set_persistent_keepalive_interval(self.persistent_keepalive.as_secs() as u16);
        if let Some(psk) = &self.preshared_key {
            builder = builder.set_preshared_key(psk.clone());
        }
        if let Some(endpoint) = self.endpoint {
            builder = builder.set_endpoint(endpoint);
        }
        for net in &self.allowed_ips {
            builder = builder.add_allowed_ip(net.addr(), net.prefix_len());
        }
        builder
    }
}

/// Replace the device's peer table with the desired set in one update.
///
/// Peers currently on the device but absent from `desired` are marked for
/// removal; every desired peer replaces its allowed IPs so stale routes do
/// not accumulate. The whole update is applied as a single kernel call.
pub fn set_peers(device_name: &str, desired: &[PeerConfig]) -> Result<(), Error> {
    let iface: InterfaceName = device_name
        .parse()
        .map_err(|e| Error::sync(format!("invalid device name {device_name:?}: {e}")))?;
    let device = WgDevice::get(&iface, Backend::Kernel)
        .map_err(|e| Error::sync(format!("cannot read device {device_name}: {e}")))?;

    let desired_keys: HashSet<String> = desired.iter().map(|p| p.public_key.to_base64()).collect();
    let mut update = DeviceUpdate::new();
    for peer in &device.peers {
        if !desired_keys.contains(&peer.config.public_key.to_base64()) {
            update = update.remove_peer_by_key(&peer.config.public_key);
        }
    }
    for peer in desired {
        update = update.add_peer(peer.to_builder());
    }
    update
        .apply(&iface, Backend::Kernel)
        .map_err(|e| Error::sync(format!("cannot configure peers on {device_name}: {e}")))
}

/// Seam between the runner and the kernel peer table.
///
/// The runner only ever replaces the full peer set, so the trait carries a
/// single operation. Tests mock it to exercise the reconciliation logic
/// without a kernel device.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PeerSync: Send + Sync {
    /// Converge the named device's peer table to exactly `peers`
    async fn set_peers(&self, device_name: &str, peers: Vec<PeerConfig>) -> Result<(), Error>;
}

/// [`PeerSync`] implementation backed by the kernel WireGuard device
pub struct KernelPeerSync;

#[async_trait::async_trait]
impl PeerSync for KernelPeerSync {
    async fn set_peers(&self, device_name: &str, peers: Vec<PeerConfig>) -> Result<(), Error> {
        let name = device_name.to_string();
        tokio::task::spawn_blocking(move || set_peers(&name, &peers))
            .await
            .map_err(|e| Error::sync(format!("peer sync task failed: {e}")))?
    }
}

/// Point-in-time peer state read from a device
#[derive(Clone, Debug, Default)]
pub struct PeerSnapshot {
    /// Peer public key, base64
    pub public_key: String,
    /// Configured endpoint, if any
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP networks in CIDR notation
    pub allowed_ips: Vec<String>,
    /// Bytes received from the peer
    pub receive_bytes: u64,
    /// Bytes transmitted to the peer
    pub transmit_bytes: u64,
    /// Completion time of the most recent handshake
    pub last_handshake: Option<SystemTime>,
}

/// Point-in-time device state used by the metrics collector
#[derive(Clone, Debug, Default)]
pub struct DeviceSnapshot {
    /// Device (interface) name
    pub name: String,
    /// Device public key, base64
    pub public_key: String,
    /// Current peer table
    pub peers: Vec<PeerSnapshot>,
}

/// Read the live state of a kernel device
pub fn device_snapshot(device_name: &str) -> Result<DeviceSnapshot, Error> {
    let iface: InterfaceName = device_name
        .parse()
        .map_err(|e| Error::device(format!("invalid device name {device_name:?}: {e}")))?;
    let device = WgDevice::get(&iface, Backend::Kernel)
        .map_err(|e| Error::device(format!("cannot read device {device_name}: {e}")))?;
    Ok(DeviceSnapshot {
        name: device.name.as_str_lossy().into_owned(),
        public_key: device
            .public_key
            .map(|k| k.to_base64())
            .unwrap_or_default(),
        peers: device
            .peers
            .iter()
            .map(|p| PeerSnapshot {
                public_key: p.config.public_key.to_base64(),
                endpoint: p.config.endpoint,
                allowed_ips: p
                    .config
                    .allowed_ips
                    .iter()
                    .map(|ip| format!("{}/{}", ip.address, ip.cidr))
                    .collect(),
                receive_bytes: p.stats.rx_bytes,
                transmit_bytes: p.stats.tx_bytes,
                last_handshake: p.stats.last_handshake_time,
            })
            .collect(),
    })
}

/// Validate a Linux network interface name: 1-16 characters, no spaces, no
/// `/`.
pub fn verify_interface_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 16 {
        return Err(Error::config(
            "interface name length must be between 1 and 16 characters",
        ));
    }
    if name.contains(' ') {
        return Err(Error::config("interface name cannot contain spaces"));
    }
    if name.contains('/') {
        return Err(Error::config("interface name cannot contain '/' character"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_PUBLIC_KEY: &str = "NkEtSA6GosX40iZFNe9+byAkXweYKvQe3utnFYkQ+00=";

    #[test]
    fn peer_config_rejects_empty_public_key() {
        assert!(PeerConfig::new("", "", "", &[]).is_err());
    }

    #[test]
    fn peer_config_rejects_invalid_public_key() {
        assert!(PeerConfig::new("foobar", "", "", &[]).is_err());
    }

    #[test]
    fn peer_config_rejects_invalid_allowed_ips() {
        assert!(PeerConfig::new(VALID_PUBLIC_KEY, "", "", &["".to_string()]).is_err());
    }

    #[test]
    fn peer_config_rejects_invalid_preshared_key() {
        let allowed = vec!["1.1.1.1/32".to_string()];
        assert!(PeerConfig::new(VALID_PUBLIC_KEY, "foo", "", &allowed).is_err());
    }

    #[test]
    fn peer_config_rejects_invalid_endpoint() {
        let allowed = vec!["1.1.1.1/32".to_string()];
        assert!(PeerConfig::new(VALID_PUBLIC_KEY, VALID_PUBLIC_KEY, "foo", &allowed).is_err());
    }

    #[test]
    fn peer_config_builds_with_valid_input() {
        let allowed = vec!["1.1.1.1/32".to_string()];
        let peer = PeerConfig::new(VALID_PUBLIC_KEY, VALID_PUBLIC_KEY, "1.1.1.1:1111", &allowed)
            .expect("valid peer config");
        assert_eq!(peer.public_key_base64(), VALID_PUBLIC_KEY);
        assert_eq!(peer.endpoint().unwrap().to_string(), "1.1.1.1:1111");
        assert_eq!(peer.allowed_ips().len(), 1);
        assert_eq!(peer.persistent_keepalive, Duration::from_secs(25));
    }

    #[test]
    fn interface_name_boundaries() {
        assert!(verify_interface_name("").is_err());
        assert!(verify_interface_name("a-name-longer-than-sixteen").is_err());
        assert!(verify_interface_name("01234567890123456").is_err());
        assert!(verify_interface_name("a b").is_err());
        assert!(verify_interface_name("a/b").is_err());
        assert!(verify_interface_name("wireguard.foo").is_ok());
        assert!(verify_interface_name("0123456789012345").is_ok());
    }
}

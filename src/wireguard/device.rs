//! Kernel WireGuard link management.
//!
//! Owns one wireguard-kind netlink link: creation, MTU and queue tuning,
//! address flushing, bringing the link up and routing a remote subnet
//! through it. The device private key is persisted across restarts so the
//! far side keeps seeing the same public key.

use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::RouteScope;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, LinkUnspec, LinkWireguard, RouteMessageBuilder};
use tracing::{error, info};
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key};

use crate::config::DEFAULT_WG_DEVICE_MTU;
use crate::error::Error;

const TX_QUEUE_LEN: u32 = 1000;

fn dev_err(e: impl std::fmt::Display) -> Error {
    Error::device(e.to_string())
}

async fn netlink_handle() -> Result<Handle, Error> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(dev_err)?;
    tokio::spawn(connection);
    Ok(handle)
}

/// One kernel WireGuard device and the attributes needed to configure it
pub struct Device {
    name: String,
    key_filename: PathBuf,
    mtu: u32,
    listen_port: u16,
    public_key: Option<String>,
}

impl Device {
    /// Create a device manager for the named link.
    ///
    /// `key_filename` is where the private key is persisted; it is created
    /// on first run.
    pub fn new(name: impl Into<String>, key_filename: impl Into<PathBuf>, mtu: u32, listen_port: u16) -> Self {
        let mtu = if mtu == 0 { DEFAULT_WG_DEVICE_MTU } else { mtu };
        Self {
            name: name.into(),
            key_filename: key_filename.into(),
            mtu,
            listen_port,
            public_key: None,
        }
    }

    /// The device (interface) name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's public key, available after [`Device::configure`]
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// The configured WireGuard listen port
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    async fn link_index(&self, handle: &Handle) -> Result<Option<u32>, Error> {
        let mut links = handle
            .link()
            .get()
            .match_name(self.name.clone())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            // A lookup failure for a missing link surfaces as a netlink
            // error; the caller treats both the same way.
            Err(_) => Ok(None),
        }
    }

    async fn require_link_index(&self, handle: &Handle) -> Result<u32, Error> {
        self.link_index(handle)
            .await?
            .ok_or_else(|| Error::device(format!("link {} not found", self.name)))
    }

    /// Create the link, or reconcile MTU and tx queue length if it already
    /// exists.
    pub async fn run(&self) -> Result<(), Error> {
        let handle = netlink_handle().await?;
        match self.link_index(&handle).await? {
            Some(index) => {
                let mut msg = LinkUnspec::new_with_index(index).mtu(self.mtu).build();
                msg.attributes.push(LinkAttribute::TxQueueLen(TX_QUEUE_LEN));
                handle.link().set(msg).execute().await.map_err(dev_err)?;
            }
            None => {
                info!(
                    device = %self.name,
                    "Could not get wg device by name, will try creating"
                );
                let mut msg = LinkWireguard::new(&self.name).mtu(self.mtu).build();
                msg.attributes.push(LinkAttribute::TxQueueLen(TX_QUEUE_LEN));
                handle.link().add(msg).execute().await.map_err(dev_err)?;
            }
        }
        Ok(())
    }

    /// Apply the private key and listen port to the device.
    ///
    /// Loads the persisted private key, generating and persisting one on
    /// first run, and remembers the derived public key.
    pub fn configure(&mut self) -> Result<(), Error> {
        let key = self.private_key()?;
        let public = key.get_public();
        info!(
            device = %self.name,
            port = self.listen_port,
            pub_key = %public.to_base64(),
            "Configuring wireguard"
        );
        self.public_key = Some(public.to_base64());
        let iface: InterfaceName = self
            .name
            .parse()
            .map_err(|e| Error::device(format!("invalid device name {:?}: {e}", self.name)))?;
        DeviceUpdate::new()
            .set_private_key(key)
            .set_listen_port(self.listen_port)
            .apply(&iface, Backend::Kernel)
            .map_err(dev_err)
    }

    fn private_key(&self) -> Result<Key, Error> {
        match std::fs::read_to_string(&self.key_filename) {
            Ok(data) => Key::from_base64(data.trim())
                .map_err(|e| Error::device(format!("cannot parse private key: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    path = %self.key_filename.display(),
                    "No key found, generating a new private key"
                );
                if let Some(dir) = self.key_filename.parent() {
                    ensure_key_dir(dir)?;
                }
                let key = Key::generate_private();
                write_key_file(&self.key_filename, &key)?;
                Ok(key)
            }
            Err(e) => Err(Error::device(format!(
                "cannot read private key {}: {e}",
                self.key_filename.display()
            ))),
        }
    }

    /// Remove every IPv4 address assigned to the link
    pub async fn flush_addresses(&self) -> Result<(), Error> {
        let handle = netlink_handle().await?;
        let index = self.require_link_index(&handle).await?;
        let addresses: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(dev_err)?;
        for msg in addresses {
            if msg.header.family == AddressFamily::Inet {
                handle.address().del(msg).execute().await.map_err(dev_err)?;
            }
        }
        Ok(())
    }

    /// Flush the link and assign only the given address.
    ///
    /// Not on the peer sync path; used when the device should also carry a
    /// local address.
    pub async fn update_address(&self, address: &IpNet) -> Result<(), Error> {
        self.flush_addresses().await?;
        let handle = netlink_handle().await?;
        let index = self.require_link_index(&handle).await?;
        handle
            .address()
            .add(index, address.addr(), address.prefix_len())
            .execute()
            .await
            .map_err(dev_err)
    }

    /// Set the link administratively up
    pub async fn ensure_link_up(&self) -> Result<(), Error> {
        let handle = netlink_handle().await?;
        let index = self.require_link_index(&handle).await?;
        handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(dev_err)
    }

    /// Install (replace) a link-scoped route to the subnet via the device
    pub async fn add_route_to_net(&self, subnet: &IpNet) -> Result<(), Error> {
        let handle = netlink_handle().await?;
        let index = self.require_link_index(&handle).await?;
        let mut route = match subnet {
            IpNet::V4(net) => RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(index)
                .build(),
            IpNet::V6(net) => RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                .destination_prefix(net.addr(), net.prefix_len())
                .output_interface(index)
                .build(),
        };
        route.header.scope = RouteScope::Link;
        handle
            .route()
            .add(route)
            .replace()
            .execute()
            .await
            .map_err(dev_err)
    }
}

fn ensure_key_dir(dir: &Path) -> Result<(), Error> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .map_err(|e| {
            error!(dir = %dir.display(), error = %e, "Unable to create key directory");
            Error::device(format!("cannot create key directory {}: {e}", dir.display()))
        })
}

fn write_key_file(path: &Path, key: &Key) -> Result<(), Error> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::device(format!("cannot create key file {}: {e}", path.display())))?;
    file.write_all(key.to_base64().as_bytes())
        .map_err(|e| Error::device(format!("cannot write key file {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn private_key_is_generated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("keys").join("wireguard.test.key");
        let device = Device::new("wireguard.test", &key_path, 1420, 51820);

        let generated = device.private_key().unwrap();
        assert!(key_path.exists());
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(key_path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o755);

        // A second load parses the persisted file instead of regenerating.
        let loaded = device.private_key().unwrap();
        assert_eq!(generated.to_base64(), loaded.to_base64());
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("wireguard.test.key");
        std::fs::write(&key_path, "not a key").unwrap();
        let device = Device::new("wireguard.test", &key_path, 1420, 51820);
        assert!(device.private_key().is_err());
    }

    #[test]
    fn zero_mtu_falls_back_to_default() {
        let device = Device::new("wireguard.test", "/tmp/k", 0, 51820);
        assert_eq!(device.mtu, DEFAULT_WG_DEVICE_MTU);
    }
}

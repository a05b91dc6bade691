//! Cluster configuration parsing and validation.
//!
//! The configuration is a JSON document naming the local cluster and the set
//! of remote clusters to mesh with. Each remote needs either a kubeconfig
//! path or the `{remoteAPIURL, remoteCAURL, remoteSATokenPath}` triple so a
//! client can be constructed for its API server.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Default MTU for created WireGuard devices
pub const DEFAULT_WG_DEVICE_MTU: u32 = 1420;
/// Default WireGuard listen port
pub const DEFAULT_WG_LISTEN_PORT: u16 = 51820;
/// Default node watcher resync period, applied by the caller when the
/// configured value is the zero sentinel
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Duration that deserializes from either a JSON number (nanoseconds) or a
/// humantime string such as `"10s"` or `"1h"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    /// True when the duration is the zero sentinel
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<ConfigDuration> for Duration {
    fn from(d: ConfigDuration) -> Self {
        d.0
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

struct ConfigDurationVisitor;

impl Visitor<'_> for ConfigDurationVisitor {
    type Value = ConfigDuration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration string or a number of nanoseconds")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(ConfigDuration(Duration::from_nanos(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        if v < 0 {
            return Err(E::custom("duration cannot be negative"));
        }
        Ok(ConfigDuration(Duration::from_nanos(v as u64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if v < 0.0 {
            return Err(E::custom("duration cannot be negative"));
        }
        Ok(ConfigDuration(Duration::from_nanos(v as u64)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        humantime::parse_duration(v)
            .map(ConfigDuration)
            .map_err(|e| E::custom(format!("invalid duration {v:?}: {e}")))
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ConfigDurationVisitor)
    }
}

/// Local cluster settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalClusterConfig {
    /// Name used when constructing the watch annotation keys
    pub name: String,
    /// Kubeconfig path; empty means in-cluster configuration
    pub kube_config_path: String,
}

/// Settings for one remote cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteClusterConfig {
    /// Name used for the device name and the advertised annotation keys
    pub name: String,
    /// Kubeconfig path for the remote cluster client
    pub kube_config_path: String,
    /// Remote API server URL, used together with the CA URL and token path
    #[serde(rename = "remoteAPIURL")]
    pub remote_api_url: String,
    /// URL serving the remote cluster's CA bundle
    #[serde(rename = "remoteCAURL")]
    pub remote_ca_url: String,
    /// Path of a file containing a service account token for the remote
    #[serde(rename = "remoteSATokenPath")]
    pub remote_sa_token_path: String,
    /// MTU for the created device
    #[serde(rename = "wgDeviceMTU")]
    pub wg_device_mtu: u32,
    /// WireGuard listen port for the created device
    pub wg_listen_port: u16,
    /// Remote pod subnet routed via the created device
    pub pod_subnet: String,
    /// Node watcher relist period; zero means "use the default"
    pub resync_period: ConfigDuration,
}

/// Top level configuration document
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Local cluster settings
    pub local: LocalClusterConfig,
    /// Remote clusters to mesh with
    pub remotes: Vec<RemoteClusterConfig>,
}

/// Parse and validate the raw configuration document.
///
/// Missing device MTU and listen port are replaced with their defaults. The
/// resync period is left at the zero sentinel so the caller can distinguish
/// "unset" from an explicit value.
pub fn parse_config(raw: &[u8]) -> Result<Config, Error> {
    let mut config: Config = serde_json::from_slice(raw)
        .map_err(|e| Error::config(format!("error unmarshalling config: {e}")))?;
    if config.local.name.is_empty() {
        return Err(Error::config("configuration is missing local cluster name"));
    }
    if config.remotes.is_empty() {
        return Err(Error::config("no remote cluster configuration defined"));
    }
    for remote in &mut config.remotes {
        if remote.name.is_empty() {
            return Err(Error::config("configuration is missing remote cluster name"));
        }
        if remote.kube_config_path.is_empty()
            && (remote.remote_api_url.is_empty()
                || remote.remote_ca_url.is_empty()
                || remote.remote_sa_token_path.is_empty())
        {
            return Err(Error::config(
                "insufficient configuration to create remote cluster client, \
                 set kubeConfigPath or remoteAPIURL and remoteCAURL and remoteSATokenPath",
            ));
        }
        if remote.pod_subnet.is_empty() {
            return Err(Error::config("no pod subnet defined for remote cluster"));
        }
        remote
            .pod_subnet
            .parse::<ipnet::IpNet>()
            .map_err(|e| Error::config(format!("cannot parse pod subnet {:?}: {e}", remote.pod_subnet)))?;
        if remote.wg_device_mtu == 0 {
            remote.wg_device_mtu = DEFAULT_WG_DEVICE_MTU;
        }
        if remote.wg_listen_port == 0 {
            remote.wg_listen_port = DEFAULT_WG_LISTEN_PORT;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_string(raw: &str) -> String {
        parse_config(raw.as_bytes()).unwrap_err().to_string()
    }

    #[test]
    fn missing_local_name_fails() {
        let raw = r#"{"local": {}}"#;
        assert!(err_string(raw).contains("missing local cluster name"));
    }

    #[test]
    fn missing_remotes_fails() {
        let raw = r#"{"local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"}}"#;
        assert!(err_string(raw).contains("no remote cluster configuration defined"));
    }

    #[test]
    fn empty_remote_name_fails() {
        let raw = r#"{
          "local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"},
          "remotes": [{"name": ""}]
        }"#;
        assert!(err_string(raw).contains("missing remote cluster name"));
    }

    #[test]
    fn insufficient_remote_client_config_fails() {
        let raw = r#"{
          "local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"},
          "remotes": [{
            "name": "remote_cluster_1",
            "remoteCAURL": "remote_ca_url",
            "remoteAPIURL": "remote_api_url"
          }]
        }"#;
        assert!(err_string(raw).contains("insufficient configuration"));
    }

    #[test]
    fn missing_pod_subnet_fails() {
        let raw = r#"{
          "local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"},
          "remotes": [{"name": "remote_cluster_1", "kubeConfigPath": "/path/to/kube/config"}]
        }"#;
        assert!(err_string(raw).contains("no pod subnet defined"));
    }

    #[test]
    fn full_config_parses_with_defaults() {
        let raw = r#"{
          "local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"},
          "remotes": [
            {
              "name": "remote_cluster_1",
              "remoteCAURL": "remote_ca_url",
              "remoteAPIURL": "remote_api_url",
              "remoteSATokenPath": "/path/to/token",
              "podSubnet": "10.0.0.0/16",
              "wgDeviceMTU": 1500,
              "wgListenPort": 51821,
              "resyncPeriod": "10s"
            },
            {
              "name": "remote_cluster_2",
              "kubeConfigPath": "/path/to/kube/config",
              "podSubnet": "10.4.0.0/16"
            }
          ]
        }"#;
        let config = parse_config(raw.as_bytes()).unwrap();
        assert_eq!(config.local.name, "local_cluster");
        assert_eq!(config.local.kube_config_path, "/path/to/kube/config");
        assert_eq!(config.remotes.len(), 2);

        let first = &config.remotes[0];
        assert_eq!(first.name, "remote_cluster_1");
        assert_eq!(first.remote_ca_url, "remote_ca_url");
        assert_eq!(first.remote_api_url, "remote_api_url");
        assert_eq!(first.remote_sa_token_path, "/path/to/token");
        assert_eq!(first.kube_config_path, "");
        assert_eq!(first.pod_subnet, "10.0.0.0/16");
        assert_eq!(first.wg_device_mtu, 1500);
        assert_eq!(first.wg_listen_port, 51821);
        assert_eq!(first.resync_period, ConfigDuration(Duration::from_secs(10)));

        let second = &config.remotes[1];
        assert_eq!(second.name, "remote_cluster_2");
        assert_eq!(second.remote_ca_url, "");
        assert_eq!(second.pod_subnet, "10.4.0.0/16");
        assert_eq!(second.wg_device_mtu, DEFAULT_WG_DEVICE_MTU);
        assert_eq!(second.wg_listen_port, DEFAULT_WG_LISTEN_PORT);
        assert!(second.resync_period.is_zero());
    }

    #[test]
    fn duration_accepts_nanosecond_numbers() {
        let raw = r#"{
          "local": {"name": "local_cluster"},
          "remotes": [{
            "name": "remote",
            "kubeConfigPath": "/path",
            "podSubnet": "10.0.0.0/16",
            "resyncPeriod": 10000000000
          }]
        }"#;
        let config = parse_config(raw.as_bytes()).unwrap();
        assert_eq!(
            config.remotes[0].resync_period,
            ConfigDuration(Duration::from_secs(10))
        );
    }

    #[test]
    fn duration_round_trips_through_string_form() {
        let d: ConfigDuration = serde_json::from_str(r#""1h""#).unwrap();
        assert_eq!(d, ConfigDuration(Duration::from_secs(3600)));
        let s = serde_json::to_string(&d).unwrap();
        let back: ConfigDuration = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn config_round_trips_through_serialization() {
        let raw = r#"{
          "local": {"name": "local_cluster", "kubeConfigPath": "/path/to/kube/config"},
          "remotes": [{
            "name": "remote_cluster_1",
            "remoteCAURL": "remote_ca_url",
            "remoteAPIURL": "remote_api_url",
            "remoteSATokenPath": "/path/to/token",
            "podSubnet": "10.0.0.0/16",
            "resyncPeriod": "10s"
          }]
        }"#;
        let config = parse_config(raw.as_bytes()).unwrap();
        let serialized = serde_json::to_vec(&config).unwrap();
        let reparsed = parse_config(&serialized).unwrap();
        assert_eq!(config, reparsed);
        assert_eq!(
            reparsed.remotes[0].resync_period,
            ConfigDuration(Duration::from_secs(10))
        );
    }

    #[test]
    fn invalid_pod_subnet_fails() {
        let raw = r#"{
          "local": {"name": "local_cluster"},
          "remotes": [{"name": "remote", "kubeConfigPath": "/path", "podSubnet": "not-a-subnet"}]
        }"#;
        assert!(err_string(raw).contains("cannot parse pod subnet"));
    }
}

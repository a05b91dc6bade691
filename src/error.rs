//! Error types for semaphore-wireguard

use thiserror::Error;

/// Main error type for semaphore-wireguard operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration parsing or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubernetes client construction error
    #[error("client error: {0}")]
    Client(String),

    /// WireGuard device provisioning error (link, address, route or key setup)
    #[error("device error: {0}")]
    Device(String),

    /// Peer reconciliation error
    #[error("sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a client construction error with the given message
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    /// Create a device provisioning error with the given message
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a sync error with the given message
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }
}

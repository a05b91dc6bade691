//! Kubernetes plumbing: client construction, node watching and node
//! annotation patching.

pub mod client;
pub mod node_watcher;
pub mod patch;

pub use client::{client_from_kubeconfig, client_from_token};
pub use node_watcher::{NodeEventHandler, NodeWatcher, WatchEventType};
pub use patch::patch_node_annotations;

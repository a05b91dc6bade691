//! Node annotation patching.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::error::Error;

/// Merge the given annotations into the named node.
///
/// Nodes are continuously updated by their own kubelet, so a read-modify-
/// write update would race; a strategic-merge patch touches only the
/// annotation keys it carries.
pub async fn patch_node_annotations(
    client: &Client,
    node_name: &str,
    annotations: &HashMap<String, String>,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": annotations,
        }
    });
    nodes
        .patch(node_name, &PatchParams::default(), &Patch::Strategic(&patch))
        .await?;
    Ok(())
}

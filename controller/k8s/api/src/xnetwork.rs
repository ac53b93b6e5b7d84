use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Requests that one or more external IPs be announced on behalf of a
/// service. The leader records the node chosen for each EIP in the status.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "xnetwork.xmesh.io",
    version = "v1alpha1",
    kind = "EIPAdvertisement",
    status = "EIPAdvertisementStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EIPAdvertisementSpec {
    pub service: ServiceRef,

    #[serde(default)]
    pub eips: Vec<String>,

    /// Restricts placement to the named nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ServiceRef {
    pub name: String,

    /// Defaults to the advertisement's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct EIPAdvertisementStatus {
    /// EIP to the name of the node announcing it.
    #[serde(default)]
    pub announce: BTreeMap<String, String>,
}

/// Grants a verdict to the addresses backing a set of services.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "xnetwork.xmesh.io",
    version = "v1alpha1",
    kind = "AccessControl",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlSpec {
    #[serde(default)]
    pub services: Vec<AccessControlService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlService {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default = "default_true", rename = "withClusterIPs")]
    pub with_cluster_ips: bool,

    #[serde(default, rename = "withExternalIPs")]
    pub with_external_ips: bool,

    #[serde(default, rename = "withEndpointIPs")]
    pub with_endpoint_ips: bool,
}

// === impl EIPAdvertisement ===

impl EIPAdvertisement {
    pub fn announce(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.announce.clone())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

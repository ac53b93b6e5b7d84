//! Label and annotation keys shared by the injector and the data-path
//! controller.

pub const DOMAIN: &str = "xmesh.io";

/// Namespace label naming the mesh that monitors the namespace.
pub const MONITORED_BY: &str = "xmesh.io/monitored-by";

/// Namespace label that excludes the namespace from injection.
pub const IGNORE: &str = "xmesh.io/ignore";

/// Pod label carrying the proxy's unique identity.
pub const SIDECAR_UID: &str = "sidecar-uid";

pub const PROXY_UUID: &str = "xmesh.io/proxy-uuid";

pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const APP_VERSION: &str = "app.kubernetes.io/version";

/// Set on the webhook configuration when the reconciler owns it.
pub const RECONCILE: &str = "xmesh.io/reconcile";

/// Node label marking a node as able to terminate E4LB traffic.
pub const E4LB_ENABLED: &str = "xmesh.io/e4lb-enabled";

/// Service annotation opting a headless service into endpoint routing.
pub const E4LB_CLOUD_INHERITED: &str = "xmesh.io/e4lb-cloud-inherited";

/// Service annotation carrying the EIP for annotation-driven E4LB.
pub const E4LB_DESIRED_IP: &str = "xmesh.io/e4lb-desired-ip";

pub fn is_system_namespace(ns: &str) -> bool {
    matches!(ns, "kube-system" | "kube-public")
}

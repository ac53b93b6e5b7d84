use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use xmesh_controller_core::iptables;

/// Cluster-wide mesh configuration. Created by the bootstrap job and only
/// ever read by the controllers.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.xmesh.io",
    version = "v1alpha3",
    kind = "MeshConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub sidecar: SidecarSpec,

    #[serde(default)]
    pub traffic: TrafficSpec,

    #[serde(default)]
    pub repo_server: RepoServerSpec,

    #[serde(default)]
    pub certificate: CertificateSpec,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    #[serde(default)]
    pub sidecar_image: Option<String>,

    #[serde(default)]
    pub init_container_image: Option<String>,

    #[serde(default)]
    pub healthcheck_image: Option<String>,

    #[serde(default)]
    pub enable_privileged_init_container: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub local_proxy_mode: LocalProxyMode,

    #[serde(default, rename = "localDNSProxy")]
    pub local_dns_proxy: LocalDnsProxy,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub healthcheck_resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub hold_application_until_proxy_starts: bool,

    #[serde(default)]
    pub graceful_exit_until_downstream_ends: bool,

    /// Port of the repo server that serves proxy configuration.
    #[serde(default = "default_proxy_server_port")]
    pub proxy_server_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDnsProxy {
    #[serde(default)]
    pub enable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<DnsUpstream>,
}

/// A DNS server that the node data path forwards redirected queries to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DnsUpstream {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSpec {
    #[serde(default)]
    pub interception_mode: InterceptionMode,

    #[serde(default)]
    pub outbound_ip_range_exclusion_list: Vec<String>,

    #[serde(default)]
    pub outbound_ip_range_inclusion_list: Vec<String>,

    #[serde(default)]
    pub outbound_port_exclusion_list: Vec<u16>,

    #[serde(default)]
    pub inbound_port_exclusion_list: Vec<u16>,

    #[serde(default)]
    pub network_interface_exclusion_list: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoServerSpec {
    /// Address of the repo server. Loopback addresses are replaced by the
    /// controller service's in-cluster name.
    #[serde(default, rename = "ipaddr")]
    pub ip_addr: String,

    #[serde(default)]
    pub codebase: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    #[serde(default)]
    pub trust_domain: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum InterceptionMode {
    #[default]
    PodLevel,
    NodeLevel,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LocalProxyMode {
    #[default]
    Localhost,
    #[serde(rename = "PodIP")]
    PodIp,
}

// === impl SidecarSpec ===

impl Default for SidecarSpec {
    fn default() -> Self {
        Self {
            sidecar_image: None,
            init_container_image: None,
            healthcheck_image: None,
            enable_privileged_init_container: false,
            log_level: default_log_level(),
            local_proxy_mode: LocalProxyMode::default(),
            local_dns_proxy: LocalDnsProxy::default(),
            resources: None,
            healthcheck_resources: None,
            hold_application_until_proxy_starts: false,
            graceful_exit_until_downstream_ends: false,
            proxy_server_port: default_proxy_server_port(),
        }
    }
}

// === impl InterceptionMode ===

impl From<InterceptionMode> for iptables::InterceptionMode {
    fn from(mode: InterceptionMode) -> Self {
        match mode {
            InterceptionMode::PodLevel => Self::PodLevel,
            InterceptionMode::NodeLevel => Self::NodeLevel,
        }
    }
}

// === impl LocalProxyMode ===

impl From<LocalProxyMode> for iptables::LocalProxyMode {
    fn from(mode: LocalProxyMode) -> Self {
        match mode {
            LocalProxyMode::Localhost => Self::Localhost,
            LocalProxyMode::PodIp => Self::PodIp,
        }
    }
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_proxy_server_port() -> u16 {
    6060
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_spec() {
        let spec: MeshConfigSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.sidecar.proxy_server_port, 6060);
        assert_eq!(spec.sidecar.log_level, "error");
        assert_eq!(spec.traffic.interception_mode, InterceptionMode::PodLevel);
        assert!(!spec.sidecar.local_dns_proxy.enable);
    }

    #[test]
    fn parses_traffic_and_dns() {
        let spec: MeshConfigSpec = serde_yaml::from_str(
            r#"
sidecar:
  sidecarImage: xmesh/sidecar:1.0
  localProxyMode: PodIP
  localDNSProxy:
    enable: true
    upstreams:
      - ip: 10.96.0.10
traffic:
  interceptionMode: NodeLevel
  outboundPortExclusionList: [3306]
"#,
        )
        .unwrap();
        assert_eq!(
            iptables::LocalProxyMode::from(spec.sidecar.local_proxy_mode),
            iptables::LocalProxyMode::PodIp
        );
        assert_eq!(
            iptables::InterceptionMode::from(spec.traffic.interception_mode),
            iptables::InterceptionMode::NodeLevel
        );
        assert_eq!(spec.sidecar.local_dns_proxy.upstreams.len(), 1);
        assert_eq!(spec.traffic.outbound_port_exclusion_list, vec![3306]);
    }
}

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod iptables;
pub mod planner;

pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub const CONTROLLER_NAME: &str = "xmesh.io/controller";

/// The UID the sidecar proxy runs as. Traffic owned by this UID is never
/// redirected back into the proxy.
pub const SIDECAR_UID: u32 = 1500;

pub const PROXY_ADMIN_PORT: u16 = 15000;
pub const PROXY_OUTBOUND_PORT: u16 = 15001;
pub const PROXY_INBOUND_PORT: u16 = 15003;
pub const PROXY_PROMETHEUS_PORT: u16 = 15010;

pub const LIVENESS_PROBE_PORT: u16 = 15901;
pub const READINESS_PROBE_PORT: u16 = 15902;
pub const STARTUP_PROBE_PORT: u16 = 15903;

/// Served by the dedicated health-check container for rewritten TCP probes.
pub const HEALTHCHECK_PORT: u16 = 15904;

pub const DNS_PORT: u16 = 53;

/// Path of the sidecar-local health endpoint that rewritten probes target.
pub const HEALTH_PATH: &str = "/osm-healthcheck";

pub const PROMETHEUS_PATH: &str = "/stats/prometheus";

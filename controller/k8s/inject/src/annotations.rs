//! Resolves workload and namespace annotations into injection decisions.
//!
//! Every annotation is read by a dedicated function that returns a typed
//! value. Malformed values fail with an error naming the key, except where
//! noted.

use crate::{Error, Result};
use k8s_openapi::{
    api::core::v1::{Namespace, ResourceRequirements},
    apimachinery::pkg::api::resource::Quantity,
};
use regex::Regex;
use std::{collections::BTreeMap, num::NonZeroU16, sync::OnceLock};
use tracing::{debug, warn};
use xmesh_controller_core::{iptables::Exclusions, IpNet};
use xmesh_controller_k8s_api::{
    config::{MeshConfigSpec, TrafficSpec},
    labels, ResourceExt,
};

pub type Annotations = BTreeMap<String, String>;

pub const SIDECAR_INJECTION: &str = "xmesh.io/sidecar-injection";
pub const METRICS: &str = "xmesh.io/metrics";
pub const SIDECAR_IMAGE: &str = "xmesh.io/sidecar-image";

pub const OUTBOUND_PORT_EXCLUSION_LIST: &str = "xmesh.io/outbound-port-exclusion-list";
pub const INBOUND_PORT_EXCLUSION_LIST: &str = "xmesh.io/inbound-port-exclusion-list";
pub const OUTBOUND_IP_RANGE_EXCLUSION_LIST: &str = "xmesh.io/outbound-ip-range-exclusion-list";
pub const OUTBOUND_IP_RANGE_INCLUSION_LIST: &str = "xmesh.io/outbound-ip-range-inclusion-list";

pub const RESOURCE_LIMITS_PREFIX: &str = "xmesh.io/sidecar-resource-limits";
pub const RESOURCE_REQUESTS_PREFIX: &str = "xmesh.io/sidecar-resource-requests";

pub const HOLD_APPLICATION_UNTIL_PROXY_STARTS: &str =
    "xmesh.io/sidecar-hold-application-until-proxy-starts";
pub const GRACEFUL_EXIT_UNTIL_DOWNSTREAM_ENDS: &str =
    "xmesh.io/sidecar-graceful-exit-until-downstream-ends";

pub const PROMETHEUS_SCRAPE: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH: &str = "prometheus.io/path";

/// Resource names that may be overridden per workload.
pub const RESOURCE_NAMES: [&str; 4] = ["cpu", "memory", "storage", "ephemeral-storage"];

/// Identifies the mesh doing the injecting.
#[derive(Copy, Clone, Debug)]
pub struct Scope<'a> {
    pub mesh_name: &'a str,
    pub control_plane_namespace: &'a str,
}

/// Parses an enabled/disabled switch. The vocabulary is case-insensitive.
pub fn parse_enabled(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "enabled" | "yes" | "true" => Ok(true),
        "disabled" | "no" | "false" => Ok(false),
        _ => Err(Error::invalid_annotation(key, value)),
    }
}

/// Reads a switch annotation, returning `None` when it is absent.
pub fn switch(annotations: &Annotations, key: &str) -> Result<Option<bool>> {
    annotations
        .get(key)
        .map(|v| parse_enabled(key, v))
        .transpose()
}

/// Whether the namespace takes part in injection at all: it must not be a
/// system or control-plane namespace, must be monitored by this mesh and
/// must not be ignored.
pub fn is_injectable_namespace(scope: Scope<'_>, ns: &Namespace) -> bool {
    let name = ns.name_unchecked();
    if labels::is_system_namespace(&name) || name == scope.control_plane_namespace {
        return false;
    }
    let ns_labels = ns.labels();
    ns_labels.get(labels::MONITORED_BY).map(String::as_str) == Some(scope.mesh_name)
        && !ns_labels.contains_key(labels::IGNORE)
}

/// Decides whether a workload is injected.
///
/// A workload is injected when its namespace is injectable, it is not on
/// the host network, and either it is annotated as enabled or its namespace
/// is annotated as enabled and the workload does not opt out.
pub fn should_inject(
    scope: Scope<'_>,
    ns: &Namespace,
    annotations: &Annotations,
    host_network: bool,
) -> Result<bool> {
    if host_network {
        debug!("Workload uses the host network");
        return Ok(false);
    }
    if !is_injectable_namespace(scope, ns) {
        debug!(ns = %ns.name_unchecked(), "Namespace is not injectable");
        return Ok(false);
    }

    let workload = switch(annotations, SIDECAR_INJECTION)?;
    let namespace = switch(ns.annotations(), SIDECAR_INJECTION)?;
    Ok(match (workload, namespace) {
        (Some(true), _) => true,
        (None, Some(true)) => true,
        _ => false,
    })
}

/// Metrics are enabled per namespace.
pub fn metrics_enabled(ns: &Namespace) -> Result<bool> {
    Ok(switch(ns.annotations(), METRICS)?.unwrap_or(false))
}

/// Parses a comma-separated port list. Each element must be in 1..=65535.
pub fn port_list(annotations: &Annotations, key: &str) -> Result<Vec<NonZeroU16>> {
    let Some(value) = annotations.get(key) else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .map(|p| {
            p.parse::<NonZeroU16>()
                .map_err(|_| Error::invalid_annotation(key, value))
        })
        .collect()
}

/// Parses a comma-separated CIDR list.
pub fn ip_range_list(annotations: &Annotations, key: &str) -> Result<Vec<IpNet>> {
    let Some(value) = annotations.get(key) else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .map(|n| {
            n.parse::<IpNet>()
                .map_err(|_| Error::invalid_annotation(key, value))
        })
        .collect()
}

/// Appends `global` to `pod`, keeping the first occurrence of each element.
pub fn merge<T: PartialEq>(pod: Vec<T>, global: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut merged = Vec::with_capacity(pod.len());
    for item in pod.into_iter().chain(global) {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }
    merged
}

/// Builds the merged exclusion lists for a workload.
pub fn exclusions(annotations: &Annotations, traffic: &TrafficSpec) -> Result<Exclusions> {
    let global_nets = |list: &[String]| {
        list.iter()
            .filter_map(|n| match n.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(error) => {
                    warn!(%error, range = %n, "Ignoring invalid IP range in MeshConfig");
                    None
                }
            })
            .collect::<Vec<_>>()
    };
    let global_ports =
        |list: &[u16]| list.iter().filter_map(|p| NonZeroU16::new(*p)).collect::<Vec<_>>();

    Ok(Exclusions {
        outbound_ip_ranges: merge(
            ip_range_list(annotations, OUTBOUND_IP_RANGE_EXCLUSION_LIST)?,
            global_nets(&traffic.outbound_ip_range_exclusion_list),
        ),
        outbound_ip_range_inclusions: merge(
            ip_range_list(annotations, OUTBOUND_IP_RANGE_INCLUSION_LIST)?,
            global_nets(&traffic.outbound_ip_range_inclusion_list),
        ),
        outbound_ports: merge(
            port_list(annotations, OUTBOUND_PORT_EXCLUSION_LIST)?,
            global_ports(&traffic.outbound_port_exclusion_list),
        ),
        inbound_ports: merge(
            port_list(annotations, INBOUND_PORT_EXCLUSION_LIST)?,
            global_ports(&traffic.inbound_port_exclusion_list),
        ),
        network_interfaces: traffic.network_interface_exclusion_list.clone(),
    })
}

/// The sidecar image: workload annotation, then namespace annotation, then
/// the mesh config.
pub fn sidecar_image(
    annotations: &Annotations,
    ns_annotations: &Annotations,
    mesh: &MeshConfigSpec,
) -> Option<String> {
    [annotations, ns_annotations]
        .into_iter()
        .filter_map(|a| a.get(SIDECAR_IMAGE))
        .find(|image| !image.is_empty())
        .cloned()
        .or_else(|| {
            mesh.sidecar
                .sidecar_image
                .clone()
                .filter(|image| !image.is_empty())
        })
}

/// Sidecar resources: the mesh config is the base, namespace annotations
/// override it, and workload annotations override both. Unparseable
/// quantities are logged and ignored.
pub fn sidecar_resources(
    annotations: &Annotations,
    ns_annotations: &Annotations,
    base: Option<&ResourceRequirements>,
) -> ResourceRequirements {
    let mut resources = base.cloned().unwrap_or_default();
    for (prefix, list) in [
        (RESOURCE_LIMITS_PREFIX, &mut resources.limits),
        (RESOURCE_REQUESTS_PREFIX, &mut resources.requests),
    ] {
        for name in RESOURCE_NAMES {
            let key = format!("{prefix}-{name}");
            let quantity = [annotations, ns_annotations]
                .into_iter()
                .filter_map(|a| a.get(&key))
                .find_map(|v| match parse_quantity(v) {
                    Some(q) => Some(q),
                    None => {
                        warn!(%key, value = %v, "Ignoring invalid resource quantity");
                        None
                    }
                });
            if let Some(q) = quantity {
                list.get_or_insert_with(BTreeMap::new)
                    .insert(name.to_string(), q);
            }
        }
    }
    resources
}

/// Reads a lifecycle switch with workload, namespace, mesh-config precedence.
/// An invalid value is logged and treated as disabled.
pub fn lifecycle_flag(
    annotations: &Annotations,
    ns_annotations: &Annotations,
    key: &str,
    default: bool,
) -> bool {
    let Some(value) = annotations.get(key).or_else(|| ns_annotations.get(key)) else {
        return default;
    };
    match parse_enabled(key, value) {
        Ok(enabled) => enabled,
        Err(error) => {
            warn!(%error, "Treating lifecycle annotation as disabled");
            false
        }
    }
}

fn parse_quantity(s: &str) -> Option<Quantity> {
    static QUANTITY: OnceLock<Regex> = OnceLock::new();
    let re = QUANTITY.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+|Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E)?$")
            .expect("quantity pattern must compile")
    });
    let s = s.trim();
    re.is_match(s).then(|| Quantity(s.to_string()))
}

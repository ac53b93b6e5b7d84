//! A read-mostly view of the cluster state that admission and the node
//! reconcilers consult. Watches feed it through `kubert::index`; every
//! change wakes the broadcast loop.

use crate::{
    core::planner::{self, Advertisement, NodeInfo},
    k8s::{
        config::MeshConfigSpec, labels, xnetwork::AccessControlSpec, AccessControl,
        EIPAdvertisement, EndpointSlice, MeshConfig, Namespace, Node, ResourceExt, Service,
    },
};
use ahash::AHashMap as HashMap;
use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use tokio::sync::Notify;
use tracing::{debug, warn};
use xmesh_controller_k8s_inject::annotations;

pub type SharedIndex = Arc<RwLock<Index>>;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// A service that opts into E4LB through annotations rather than an
/// advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedEip {
    pub service: ResourceId,
    pub eip: Ipv4Addr,
}

#[derive(Debug)]
pub struct Index {
    control_plane_namespace: String,
    mesh_config_name: String,
    controller_service: String,

    mesh_config: Option<MeshConfigSpec>,
    namespaces: HashMap<String, Namespace>,
    nodes: BTreeMap<String, NodeInfo>,
    services: HashMap<ResourceId, Service>,
    /// Slices keyed by their own id, tagged with the service they back.
    slices: HashMap<ResourceId, (String, EndpointSlice)>,
    advertisements: BTreeMap<ResourceId, EIPAdvertisement>,
    access_controls: BTreeMap<ResourceId, AccessControlSpec>,

    changed: Arc<Notify>,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        control_plane_namespace: impl ToString,
        mesh_config_name: impl ToString,
        controller_service: impl ToString,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            control_plane_namespace: control_plane_namespace.to_string(),
            mesh_config_name: mesh_config_name.to_string(),
            controller_service: controller_service.to_string(),
            mesh_config: None,
            namespaces: HashMap::default(),
            nodes: BTreeMap::new(),
            services: HashMap::default(),
            slices: HashMap::default(),
            advertisements: BTreeMap::new(),
            access_controls: BTreeMap::new(),
            changed: Arc::new(Notify::new()),
        }))
    }

    pub fn control_plane_namespace(&self) -> &str {
        &self.control_plane_namespace
    }

    /// Signaled whenever any indexed resource changes.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// The latest mesh configuration snapshot, if it has been observed.
    pub fn mesh_config(&self) -> Option<&MeshConfigSpec> {
        self.mesh_config.as_ref()
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        self.services.get(&ResourceId::new(namespace, name))
    }

    pub fn cluster_ip(&self, namespace: &str, name: &str) -> Option<IpAddr> {
        self.service(namespace, name).and_then(cluster_ip)
    }

    /// The cluster IP of the controller service.
    pub fn controller_ip(&self) -> Option<IpAddr> {
        self.cluster_ip(&self.control_plane_namespace, &self.controller_service)
    }

    pub fn endpoint_slices(&self, namespace: &str, service: &str) -> Vec<&EndpointSlice> {
        self.slices
            .iter()
            .filter(|(id, (svc, _))| id.namespace == namespace && svc == service)
            .map(|(_, (_, slice))| slice)
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn eligible_nodes(&self) -> BTreeSet<String> {
        planner::eligible_nodes(self.nodes.values())
    }

    pub fn eip_advertisements(&self) -> impl Iterator<Item = (&ResourceId, &EIPAdvertisement)> {
        self.advertisements.iter()
    }

    /// Advertisements in the planner's input form.
    pub fn advertisements(&self) -> Vec<Advertisement> {
        self.advertisements
            .iter()
            .map(|(id, adv)| Advertisement {
                namespace: id.namespace.clone(),
                name: id.name.clone(),
                eips: adv.spec.eips.clone(),
                nodes: adv.spec.nodes.clone(),
                announce: adv.announce(),
            })
            .collect()
    }

    pub fn access_controls(&self) -> impl Iterator<Item = (&ResourceId, &AccessControlSpec)> {
        self.access_controls.iter()
    }

    /// Services that declare a desired EIP and are E4LB-enabled, either
    /// directly or through their namespace.
    pub fn annotated_eips(&self) -> Vec<AnnotatedEip> {
        let mut eips = self
            .services
            .iter()
            .filter_map(|(id, svc)| {
                let eip = desired_ip(svc)?;
                if !self.e4lb_enabled(id, svc) {
                    return None;
                }
                Some(AnnotatedEip {
                    service: id.clone(),
                    eip,
                })
            })
            .collect::<Vec<_>>();
        eips.sort_by(|a, b| a.service.cmp(&b.service));
        eips
    }

    fn e4lb_enabled(&self, id: &ResourceId, svc: &Service) -> bool {
        let parse = |annotations: &BTreeMap<String, String>| {
            annotations::switch(annotations, labels::E4LB_ENABLED).unwrap_or_else(|error| {
                warn!(%error, service = %id, "Ignoring E4LB switch");
                None
            })
        };
        parse(svc.annotations())
            .or_else(|| {
                self.namespaces
                    .get(&id.namespace)
                    .and_then(|ns| parse(ns.annotations()))
            })
            .unwrap_or(false)
    }

    fn notify(&self) {
        self.changed.notify_one();
    }
}

impl kubert::index::IndexClusterResource<Namespace> for Index {
    fn apply(&mut self, ns: Namespace) {
        self.namespaces.insert(ns.name_unchecked(), ns);
        self.notify();
    }

    fn delete(&mut self, name: String) {
        if self.namespaces.remove(&name).is_some() {
            self.notify();
        }
    }
}

impl kubert::index::IndexClusterResource<Node> for Index {
    fn apply(&mut self, node: Node) {
        let info = node_info(&node);
        if self.nodes.get(&info.name) == Some(&info) {
            return;
        }
        debug!(node = %info.name, ready = info.ready, e4lb = info.e4lb_enabled, "Node updated");
        self.nodes.insert(info.name.clone(), info);
        self.notify();
    }

    fn delete(&mut self, name: String) {
        if self.nodes.remove(&name).is_some() {
            self.notify();
        }
    }
}

impl IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, svc: Service) {
        let id = ResourceId::new(svc.namespace().unwrap_or_default(), svc.name_unchecked());
        self.services.insert(id, svc);
        self.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.services.remove(&ResourceId::new(namespace, name)).is_some() {
            self.notify();
        }
    }
}

impl IndexNamespacedResource<EndpointSlice> for Index {
    fn apply(&mut self, slice: EndpointSlice) {
        let id = ResourceId::new(
            slice.namespace().unwrap_or_default(),
            slice.name_unchecked(),
        );
        let Some(service) = slice.labels().get(SERVICE_NAME_LABEL).cloned() else {
            self.slices.remove(&id);
            return;
        };
        self.slices.insert(id, (service, slice));
        self.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.slices.remove(&ResourceId::new(namespace, name)).is_some() {
            self.notify();
        }
    }
}

impl IndexNamespacedResource<EIPAdvertisement> for Index {
    fn apply(&mut self, adv: EIPAdvertisement) {
        let id = ResourceId::new(adv.namespace().unwrap_or_default(), adv.name_unchecked());
        self.advertisements.insert(id, adv);
        self.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .advertisements
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

impl IndexNamespacedResource<AccessControl> for Index {
    fn apply(&mut self, acl: AccessControl) {
        let id = ResourceId::new(acl.namespace().unwrap_or_default(), acl.name_unchecked());
        self.access_controls.insert(id, acl.spec);
        self.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .access_controls
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

impl IndexNamespacedResource<MeshConfig> for Index {
    fn apply(&mut self, config: MeshConfig) {
        if config.namespace().as_deref() != Some(&*self.control_plane_namespace)
            || config.name_unchecked() != self.mesh_config_name
        {
            return;
        }
        self.mesh_config = Some(config.spec);
        self.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.control_plane_namespace && name == self.mesh_config_name {
            warn!(%namespace, %name, "MeshConfig deleted");
            self.mesh_config = None;
            self.notify();
        }
    }
}

pub(crate) fn cluster_ip(svc: &Service) -> Option<IpAddr> {
    cluster_ips(svc).into_iter().next()
}

/// All cluster IPs of a service. Empty for headless services.
pub(crate) fn cluster_ips(svc: &Service) -> Vec<IpAddr> {
    let Some(spec) = svc.spec.as_ref() else {
        return vec![];
    };
    let ips = match spec.cluster_ips.as_ref() {
        Some(ips) if !ips.is_empty() => ips.clone(),
        _ => spec.cluster_ip.iter().cloned().collect(),
    };
    ips.iter()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

fn desired_ip(svc: &Service) -> Option<Ipv4Addr> {
    let value = svc.annotations().get(labels::E4LB_DESIRED_IP)?;
    match value.parse::<Ipv4Addr>() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_multicast() && !ip.is_broadcast() => Some(ip),
        _ => {
            debug!(service = %svc.name_any(), %value, "Ignoring desired EIP");
            None
        }
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let is_true = |ty: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == ty && c.status == "True")
    };
    NodeInfo {
        name: node.name_unchecked(),
        ready: is_true("Ready"),
        network_unavailable: is_true("NetworkUnavailable"),
        e4lb_enabled: node
            .labels()
            .get(labels::E4LB_ENABLED)
            .is_some_and(|v| v == "true"),
    }
}

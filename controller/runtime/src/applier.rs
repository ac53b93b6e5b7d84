//! Programs the E4LB data path on this node.
//!
//! Each scheduling tick turns the EIPs owned by this node into NAT entries
//! (one per TCP service port and classifier direction), diffs them against
//! what has already been written, and keeps a neighbor entry for every owned
//! EIP. A faster tick re-announces owned EIPs with gratuitous ARP/NDP.
//!
//! An EIP is owned when an `EIPAdvertisement`'s status assigns it to this
//! node, or when an annotated service's desired IP hashes to this node.

use crate::{
    core::planner,
    index::{self, AnnotatedEip, Index, ResourceId, SharedIndex},
    k8s::{labels, IntOrString, ResourceExt, Service, ServicePort},
    maps::NodeMaps,
    metrics::DataPathMetrics,
    probe::Prober,
    xnet::{
        iface, Announcer, Gateway, IfaceVal, Mac, NatKey, NatVal, Neighbors, Proto, SysId, TcDir,
        Upstream, F_EGRESS, F_INGRESS,
    },
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

pub struct Applier {
    node_name: String,
    bridge: String,
    index: SharedIndex,
    maps: NodeMaps,
    neighbors: Arc<dyn Neighbors>,
    announcer: Arc<dyn Announcer>,
    prober: Arc<dyn Prober>,
    metrics: DataPathMetrics,

    /// E4LB NAT entries known to be programmed. `None` until hydrated from
    /// the NAT map.
    xnat: tokio::sync::Mutex<Option<HashMap<NatKey, NatVal>>>,
    owned: Mutex<Owned>,
}

/// What the advertise tick needs from the last scheduling tick.
#[derive(Debug, Default)]
struct Owned {
    gateway: Option<Gateway>,
    /// EIPs with a neighbor entry that are announced.
    eips: BTreeSet<IpAddr>,
    /// EIPs whose neighbor entry may still exist.
    neighbors: BTreeSet<IpAddr>,
}

#[derive(Debug)]
struct Target {
    eip: IpAddr,
    service: ResourceId,
    route: Route,
    /// EIP port to upstream addresses.
    ports: BTreeMap<u16, Vec<SocketAddr>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    /// Cluster IPs, delivered through the CNI bridge.
    Bridge,
    /// Endpoint addresses, sent out of the gateway interface.
    Gateway,
}

// === impl Applier ===

impl Applier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl ToString,
        bridge: impl ToString,
        index: SharedIndex,
        maps: NodeMaps,
        neighbors: Arc<dyn Neighbors>,
        announcer: Arc<dyn Announcer>,
        prober: Arc<dyn Prober>,
        metrics: DataPathMetrics,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            bridge: bridge.to_string(),
            index,
            maps,
            neighbors,
            announcer,
            prober,
            metrics,
            xnat: tokio::sync::Mutex::new(None),
            owned: Mutex::new(Owned::default()),
        }
    }

    /// The EIPs currently announced by this node.
    pub fn announced(&self) -> BTreeSet<IpAddr> {
        self.owned.lock().eips.clone()
    }

    /// Converges the NAT map and neighbor table on the EIPs this node owns.
    ///
    /// Individual map and neighbor failures are logged and retried on the
    /// next tick; they are reported as a single error once the pass
    /// completes. Gateway or bridge discovery failures abort the pass.
    pub async fn reconcile(&self) -> Result<()> {
        let gw = self
            .neighbors
            .default_gateway()
            .await
            .context("failed to discover the default gateway")?;
        let bridge = iface::lookup(&*self.maps.iface, &self.bridge)?
            .ok_or_else(|| anyhow!("interface {} not found in the iface map", self.bridge))?;

        let targets = self.targets();
        let health = self.probe(&targets).await;

        let mut desired = HashMap::<NatKey, NatVal>::default();
        let mut eips = BTreeSet::new();
        let mut next_hops = HashMap::<IpAddr, Option<Mac>>::default();
        for target in &targets {
            for (port, upstreams) in &target.ports {
                let mut val = NatVal::default();
                for addr in upstreams {
                    if addr.is_ipv4() != target.eip.is_ipv4() {
                        continue;
                    }
                    let up = match target.route {
                        Route::Bridge => bridge_upstream(*addr, &bridge),
                        Route::Gateway => {
                            let hop = gw.via.unwrap_or(addr.ip());
                            let mac = match next_hops.get(&hop) {
                                Some(mac) => *mac,
                                None => {
                                    let mac = self.next_hop_mac(&gw, hop).await;
                                    next_hops.insert(hop, mac);
                                    mac
                                }
                            };
                            let Some(mac) = mac else {
                                warn!(%hop, upstream = %addr, "Next hop unresolved");
                                continue;
                            };
                            Upstream {
                                addr: addr.ip(),
                                port: addr.port(),
                                mac,
                                ofi: gw.ifindex,
                                oflags: F_EGRESS,
                                omac: None,
                                active: health.get(addr).copied().unwrap_or(true),
                            }
                        }
                    };
                    if !val.add_endpoint(&up) {
                        warn!(eip = %target.eip, %port, "Upstream set is full");
                        break;
                    }
                }

                if val.endpoints().is_empty() {
                    debug!(eip = %target.eip, %port, service = %target.service, "No upstreams");
                    continue;
                }
                for dir in TcDir::ALL {
                    let key = NatKey::new(SysId::E4lb, target.eip, *port, Proto::Tcp, dir);
                    desired.insert(key, val);
                }
                eips.insert(target.eip);
            }
        }

        let mut failures = self.sync_nat(desired).await?;
        failures += self.sync_neighbors(&gw, &eips).await;
        self.owned.lock().gateway = Some(gw);

        if failures > 0 {
            bail!("{failures} data path operations failed");
        }
        Ok(())
    }

    /// Sends a gratuitous advertisement for every announced EIP.
    pub async fn advertise(&self) -> Result<()> {
        let (gw, eips) = {
            let owned = self.owned.lock();
            (owned.gateway.clone(), owned.eips.clone())
        };
        let Some(gw) = gw else {
            return Ok(());
        };

        let mut failures = 0;
        for eip in eips {
            match self.announcer.announce(&gw, eip).await {
                Ok(()) => self.metrics.advertised(eip),
                Err(error) => {
                    warn!(%eip, iface = %gw.ifname, %error, "Failed to advertise EIP");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            bail!("{failures} advertisements failed");
        }
        Ok(())
    }

    fn targets(&self) -> Vec<Target> {
        let index = self.index.read();

        let mut owned = BTreeMap::<IpAddr, ResourceId>::new();
        for (id, adv) in index.eip_advertisements() {
            let ns = adv.spec.service.namespace.as_deref().unwrap_or(&id.namespace);
            for (eip, node) in adv.announce() {
                if node != self.node_name || !adv.spec.eips.contains(&eip) {
                    continue;
                }
                match eip.parse::<IpAddr>() {
                    Ok(eip) => {
                        owned.insert(eip, ResourceId::new(ns, &adv.spec.service.name));
                    }
                    Err(_) => debug!(advertisement = %id, %eip, "Ignoring invalid EIP"),
                }
            }
        }

        let eligible = index.eligible_nodes();
        for AnnotatedEip { service, eip } in index.annotated_eips() {
            let owner = planner::hashed_owner(&eligible, &eip.to_string());
            if owner.map(String::as_str) == Some(self.node_name.as_str()) {
                owned.entry(IpAddr::V4(eip)).or_insert(service);
            }
        }

        owned
            .into_iter()
            .filter_map(|(eip, service)| target(&index, eip, service))
            .collect()
    }

    /// Probes every endpoint-routed upstream concurrently.
    async fn probe(&self, targets: &[Target]) -> HashMap<SocketAddr, bool> {
        let addrs = targets
            .iter()
            .filter(|t| t.route == Route::Gateway)
            .flat_map(|t| t.ports.values().flatten().copied())
            .collect::<BTreeSet<_>>();
        let probes = addrs.into_iter().map(|addr| {
            let prober = self.prober.clone();
            async move { (addr, prober.probe(addr, false).await) }
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    async fn next_hop_mac(&self, gw: &Gateway, hop: IpAddr) -> Option<Mac> {
        match self.neighbors.lookup_neighbor(gw.ifindex, hop).await {
            Ok(Some(mac)) => return Some(mac),
            Ok(None) => {}
            Err(error) => warn!(%hop, %error, "Neighbor lookup failed"),
        }
        let IpAddr::V4(hop) = hop else {
            return None;
        };
        match self.announcer.arping(gw, hop).await {
            Ok(mac) => mac,
            Err(error) => {
                warn!(%hop, %error, "ARP probe failed");
                None
            }
        }
    }

    /// Deletes obsolete entries, then writes new and changed ones. Returns
    /// the number of failed operations.
    async fn sync_nat(&self, desired: HashMap<NatKey, NatVal>) -> Result<usize> {
        let mut xnat = self.xnat.lock().await;
        let cache = match &mut *xnat {
            Some(cache) => cache,
            none => none.insert(self.hydrate()?),
        };

        let mut failures = 0;
        let obsolete = cache
            .keys()
            .filter(|key| !desired.contains_key(key))
            .copied()
            .collect::<Vec<_>>();
        for key in obsolete {
            match self.maps.nat.delete(&key) {
                Ok(()) => {
                    debug!(%key, "Deleted NAT entry");
                    self.metrics.nat("delete", true);
                    cache.remove(&key);
                }
                Err(error) => {
                    error!(%key, %error, "Failed to delete NAT entry");
                    self.metrics.nat("delete", false);
                    failures += 1;
                }
            }
        }

        for (key, val) in desired {
            let op = match cache.get(&key) {
                Some(current) if current.endpoints() == val.endpoints() => continue,
                Some(_) => "update",
                None => "insert",
            };
            match self.maps.nat.put(key, val) {
                Ok(()) => {
                    debug!(%key, endpoints = val.endpoints().len(), "Wrote NAT entry");
                    self.metrics.nat(op, true);
                    cache.insert(key, val);
                }
                Err(error) => {
                    error!(%key, %error, "Failed to write NAT entry");
                    self.metrics.nat(op, false);
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    fn hydrate(&self) -> Result<HashMap<NatKey, NatVal>> {
        let entries = self.maps.nat.list()?;
        let cache = entries
            .into_iter()
            .filter(|(key, _)| key.sys == u32::from(SysId::E4lb))
            .collect::<HashMap<_, _>>();
        debug!(entries = cache.len(), "Hydrated E4LB NAT entries");
        Ok(cache)
    }

    async fn sync_neighbors(&self, gw: &Gateway, eips: &BTreeSet<IpAddr>) -> usize {
        let (previous, prev_ifindex) = {
            let owned = self.owned.lock();
            let ifindex = owned.gateway.as_ref().map_or(gw.ifindex, |g| g.ifindex);
            (owned.neighbors.clone(), ifindex)
        };
        // Entries installed on a previous gateway interface are all stale.
        let moved = prev_ifindex != gw.ifindex;

        let mut failures = 0;
        let mut announced = BTreeSet::new();
        let mut neighbors = BTreeSet::new();
        for eip in eips {
            neighbors.insert(*eip);
            match self.neighbors.ensure_neighbor(gw.ifindex, *eip, gw.mac).await {
                Ok(()) => {
                    if !previous.contains(eip) {
                        info!(%eip, iface = %gw.ifname, "Claimed EIP");
                    }
                    announced.insert(*eip);
                }
                Err(error) => {
                    error!(%eip, %error, "Failed to install neighbor entry");
                    failures += 1;
                }
            }
        }
        for eip in previous.iter().filter(|eip| moved || !eips.contains(eip)) {
            match self.neighbors.delete_neighbor(prev_ifindex, *eip).await {
                Ok(()) if eips.contains(eip) => {
                    debug!(%eip, ifindex = prev_ifindex, "Moved EIP")
                }
                Ok(()) => info!(%eip, "Released EIP"),
                Err(error) => {
                    error!(
                        %eip,
                        %error,
                        ifindex = prev_ifindex,
                        "Failed to remove neighbor entry"
                    );
                    neighbors.insert(*eip);
                    failures += 1;
                }
            }
        }

        let mut owned = self.owned.lock();
        owned.eips = announced;
        owned.neighbors = neighbors;
        failures
    }
}

/// Resolves the upstreams for an owned EIP. Headless services are only
/// routed when they opt in with the cloud-inherited marker.
fn target(index: &Index, eip: IpAddr, service: ResourceId) -> Option<Target> {
    let Some(svc) = index.service(&service.namespace, &service.name) else {
        debug!(%eip, %service, "Service not found");
        return None;
    };
    let ports = tcp_ports(svc);
    if ports.is_empty() {
        debug!(%eip, %service, "Service has no TCP ports");
        return None;
    }

    let cluster_ips = index::cluster_ips(svc);
    if !cluster_ips.is_empty() {
        let ports = ports
            .iter()
            .map(|(port, _)| {
                let ups = cluster_ips
                    .iter()
                    .map(|ip| SocketAddr::new(*ip, *port))
                    .collect();
                (*port, ups)
            })
            .collect();
        return Some(Target {
            eip,
            service,
            route: Route::Bridge,
            ports,
        });
    }

    let inherited = svc
        .annotations()
        .get(labels::E4LB_CLOUD_INHERITED)
        .is_some_and(|v| v == "true");
    if !inherited {
        debug!(%eip, %service, "Headless service is not cloud-inherited");
        return None;
    }

    let slices = index.endpoint_slices(&service.namespace, &service.name);
    let ports = ports
        .iter()
        .map(|(port, sp)| {
            let mut ups = Vec::new();
            for slice in &slices {
                let target_port = slice
                    .ports
                    .iter()
                    .flatten()
                    .find(|p| p.name == sp.name)
                    .and_then(|p| p.port)
                    .or(match &sp.target_port {
                        Some(IntOrString::Int(p)) => Some(*p),
                        _ => None,
                    })
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0)
                    .unwrap_or(*port);
                let ready = slice.endpoints.iter().filter(|ep| {
                    ep.conditions.as_ref().and_then(|c| c.ready) != Some(false)
                });
                for ep in ready {
                    ups.extend(
                        ep.addresses
                            .iter()
                            .filter_map(|a| a.parse::<IpAddr>().ok())
                            .map(|ip| SocketAddr::new(ip, target_port)),
                    );
                }
            }
            (*port, ups)
        })
        .collect();
    Some(Target {
        eip,
        service,
        route: Route::Gateway,
        ports,
    })
}

fn tcp_ports(svc: &Service) -> Vec<(u16, &ServicePort)> {
    svc.spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok().filter(|p| *p != 0)?;
            Some((port, p))
        })
        .collect()
}

fn bridge_upstream(addr: SocketAddr, bridge: &IfaceVal) -> Upstream {
    Upstream {
        addr: addr.ip(),
        port: addr.port(),
        mac: bridge.mac,
        ofi: bridge.ifi,
        oflags: F_INGRESS,
        omac: None,
        active: true,
    }
}

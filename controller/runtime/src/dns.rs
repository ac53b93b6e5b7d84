//! Redirects pod DNS to the mesh's upstreams while the local DNS proxy is
//! enabled.
//!
//! The redirect is a single `MESH` NAT entry for UDP/53 (programmed for
//! both classifier directions) plus three CFG flags. Disabling performs the
//! inverse.

use crate::{
    core::DNS_PORT,
    index::{Index, SharedIndex},
    k8s::config::LocalDnsProxy,
    maps::NodeMaps,
    metrics::DataPathMetrics,
    xnet::{cfg, iface, CfgFlag, CfgVal, NatKey, NatVal, Proto, SysId, TcDir, Upstream},
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, error, info, warn};

pub struct DnsSync {
    index: SharedIndex,
    maps: NodeMaps,
    bridge: String,
    metrics: DataPathMetrics,
    /// Entries this process believes are programmed. `None` until hydrated
    /// from the NAT map.
    cache: Mutex<Option<HashMap<NatKey, NatVal>>>,
}

// === impl DnsSync ===

impl DnsSync {
    pub fn new(
        index: SharedIndex,
        maps: NodeMaps,
        bridge: impl ToString,
        metrics: DataPathMetrics,
    ) -> Self {
        Self {
            index,
            maps,
            bridge: bridge.to_string(),
            metrics,
            cache: Mutex::new(None),
        }
    }

    pub fn reconcile(&self) -> Result<()> {
        let (enabled, upstreams) = {
            let index = self.index.read();
            let Some(config) = index.mesh_config() else {
                debug!("Mesh config not yet observed");
                return Ok(());
            };
            let dns = &config.sidecar.local_dns_proxy;
            (dns.enable, upstreams(&index, dns))
        };

        let mut cache = self.cache.lock();
        let cache = match &mut *cache {
            Some(cache) => cache,
            none => none.insert(self.hydrate()?),
        };

        if !enabled {
            return self.disable(cache);
        }

        let bridge = iface::lookup(&*self.maps.iface, &self.bridge)?
            .ok_or_else(|| anyhow!("interface {} not found in the iface map", self.bridge))?;
        let mut val = NatVal::default();
        for addr in upstreams.iter().filter(|a| a.is_ipv4()) {
            let added = val.add_endpoint(&Upstream {
                addr: addr.ip(),
                port: addr.port(),
                mac: bridge.mac,
                ofi: 0,
                oflags: 0,
                omac: None,
                active: true,
            });
            if !added {
                warn!(%addr, "DNS upstream set is full");
                break;
            }
        }
        if val.endpoints().is_empty() {
            warn!("No DNS upstream could be resolved");
            return self.disable(cache);
        }

        self.enable(cache, val)
    }

    fn hydrate(&self) -> Result<HashMap<NatKey, NatVal>> {
        let entries = self.maps.nat.list()?;
        Ok(entries
            .into_iter()
            .filter(|(key, _)| is_dns_key(key))
            .collect())
    }

    // NAT entries are installed before the flags route traffic to them.
    fn enable(&self, cache: &mut HashMap<NatKey, NatVal>, val: NatVal) -> Result<()> {
        for dir in TcDir::ALL {
            let key = dns_key(dir);
            let op = match cache.get(&key) {
                Some(current) if current.endpoints() == val.endpoints() => continue,
                Some(_) => "update",
                None => "insert",
            };
            if let Err(error) = self.maps.nat.put(key, val) {
                error!(%key, %error, "Failed to program DNS redirect");
                self.metrics.nat(op, false);
                return Err(error.into());
            }
            self.metrics.nat(op, true);
            cache.insert(key, val);
        }

        if cfg::update(&*self.maps.cfg, SysId::Mesh, redirect)? {
            info!(upstreams = val.endpoints().len(), "Local DNS redirect enabled");
        }
        Ok(())
    }

    fn disable(&self, cache: &mut HashMap<NatKey, NatVal>) -> Result<()> {
        if cfg::update(&*self.maps.cfg, SysId::Mesh, passthrough)? {
            info!("Local DNS redirect disabled");
        }

        let keys = cache.keys().copied().collect::<Vec<_>>();
        for key in keys {
            if let Err(error) = self.maps.nat.delete(&key) {
                error!(%key, %error, "Failed to remove DNS redirect");
                self.metrics.nat("delete", false);
                return Err(error.into());
            }
            self.metrics.nat("delete", true);
            cache.remove(&key);
        }
        Ok(())
    }
}

fn dns_key(dir: TcDir) -> NatKey {
    NatKey::new(
        SysId::Mesh,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        DNS_PORT,
        Proto::Udp,
        dir,
    )
}

fn is_dns_key(key: &NatKey) -> bool {
    key.sys == u32::from(SysId::Mesh) && key.proto == Proto::Udp as u8 && key.dport() == DNS_PORT
}

fn redirect(cfg: &mut CfgVal) {
    cfg.ipv4.clear(CfgFlag::UdpAllowAll);
    cfg.ipv4.set(CfgFlag::UdpAllowNatEscape);
    cfg.ipv4.set(CfgFlag::UdpNatByPortOn);
}

fn passthrough(cfg: &mut CfgVal) {
    cfg.ipv4.set(CfgFlag::UdpAllowAll);
    cfg.ipv4.clear(CfgFlag::UdpAllowNatEscape);
    cfg.ipv4.clear(CfgFlag::UdpNatByPortOn);
}

/// Resolves the configured upstreams. An empty list means the controller
/// service answers DNS itself.
fn upstreams(index: &Index, dns: &LocalDnsProxy) -> Vec<SocketAddr> {
    if dns.upstreams.is_empty() {
        return index
            .controller_ip()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .into_iter()
            .collect();
    }

    dns.upstreams
        .iter()
        .filter_map(|up| {
            let port = up.port.unwrap_or(DNS_PORT);
            if let Some(ip) = up.ip.as_deref() {
                return match ip.parse::<IpAddr>() {
                    Ok(ip) => Some(SocketAddr::new(ip, port)),
                    Err(_) => {
                        warn!(%ip, "Ignoring invalid DNS upstream address");
                        None
                    }
                };
            }
            let name = up.name.as_deref()?;
            let ns = up
                .namespace
                .as_deref()
                .unwrap_or(index.control_plane_namespace());
            let ip = index.cluster_ip(ns, name);
            if ip.is_none() {
                debug!(service = %name, %ns, "DNS upstream service has no cluster IP");
            }
            ip.map(|ip| SocketAddr::new(ip, port))
        })
        .collect()
}

//! Derives the trusted address set from `AccessControl` resources and keeps
//! the node's ACL map in sync with it.

use crate::{
    index::{self, Index, SharedIndex},
    metrics::DataPathMetrics,
    xnet::{AclKey, AclReconciler, AclVal, AclVerdict, KernelMap},
};
use anyhow::Result;
use std::{collections::BTreeMap, net::IpAddr};
use tracing::{debug, error};

pub struct AclSync<M> {
    index: SharedIndex,
    reconciler: AclReconciler<M>,
    metrics: DataPathMetrics,
}

impl<M: KernelMap<AclKey, AclVal>> AclSync<M> {
    pub fn new(index: SharedIndex, map: M, metrics: DataPathMetrics) -> Self {
        Self {
            index,
            reconciler: AclReconciler::new(map),
            metrics,
        }
    }

    pub fn reconcile(&self) -> Result<()> {
        let desired = desired(&self.index.read());
        match self.reconciler.reconcile(&desired) {
            Ok(outcome) => {
                if outcome.deleted > 0 {
                    self.metrics.acl("delete", true);
                }
                if outcome.upserted > 0 {
                    self.metrics.acl("upsert", true);
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to reconcile ACL map");
                self.metrics.acl("reconcile", false);
                Err(e.into())
            }
        }
    }
}

/// Every address named by an `AccessControl` resource is trusted. Only IPv4
/// addresses are programmed.
pub fn desired(index: &Index) -> BTreeMap<IpAddr, AclVerdict> {
    let mut addrs = BTreeMap::new();
    for (id, spec) in index.access_controls() {
        for target in &spec.services {
            let ns = target.namespace.as_deref().unwrap_or(&id.namespace);
            let Some(svc) = index.service(ns, &target.name) else {
                debug!(acl = %id, service = %target.name, %ns, "Service not found");
                continue;
            };

            let mut found = Vec::new();
            if target.with_cluster_ips {
                found.extend(index::cluster_ips(svc));
            }
            if target.with_external_ips {
                found.extend(external_ips(svc));
            }
            if target.with_endpoint_ips {
                for slice in index.endpoint_slices(ns, &target.name) {
                    found.extend(
                        slice
                            .endpoints
                            .iter()
                            .flat_map(|ep| ep.addresses.iter())
                            .filter_map(|a| a.parse::<IpAddr>().ok()),
                    );
                }
            }

            for addr in found.into_iter().filter(IpAddr::is_ipv4) {
                addrs.insert(addr, AclVerdict::Trusted);
            }
        }
    }
    addrs
}

fn external_ips(svc: &crate::k8s::Service) -> Vec<IpAddr> {
    let spec_ips = svc
        .spec
        .iter()
        .flat_map(|s| s.external_ips.iter().flatten());
    let lb_ips = svc
        .status
        .iter()
        .filter_map(|s| s.load_balancer.as_ref())
        .flat_map(|lb| lb.ingress.iter().flatten())
        .filter_map(|i| i.ip.as_ref());
    spec_ips
        .chain(lb_ips)
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::tests::{mk_index, mk_service},
        k8s::{
            api::discovery::v1::Endpoint,
            xnetwork::{AccessControlService, AccessControlSpec},
            AccessControl, EndpointSlice, ObjectMeta,
        },
        xnet::maps::InMemoryMap,
    };
    use kubert::index::IndexNamespacedResource;
    use maplit::btreemap;
    use std::sync::Arc;

    fn mk_acl(ns: &str, services: Vec<AccessControlService>) -> AccessControl {
        let mut acl = AccessControl::new("trust", AccessControlSpec { services });
        acl.metadata.namespace = Some(ns.to_string());
        acl
    }

    fn target(name: &str, endpoints: bool) -> AccessControlService {
        AccessControlService {
            name: name.to_string(),
            namespace: None,
            with_cluster_ips: true,
            with_external_ips: true,
            with_endpoint_ips: endpoints,
        }
    }

    fn mk_slice(ns: &str, service: &str, addrs: &[&str]) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(format!("{service}-abcde")),
                labels: Some(btreemap! {
                    "kubernetes.io/service-name".to_string() => service.to_string(),
                }),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![Endpoint {
                addresses: addrs.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            }],
            ports: None,
        }
    }

    #[test]
    fn collects_trusted_addresses() {
        let index = mk_index();
        let mut svc = mk_service("demo", "db", Some("10.96.0.5"), &[5432]);
        svc.spec.as_mut().unwrap().external_ips = Some(vec!["192.0.2.10".to_string()]);
        index.write().apply(svc);
        index
            .write()
            .apply(mk_slice("demo", "db", &["10.244.1.7", "fd00::7"]));
        index.write().apply(mk_acl("demo", vec![target("db", true)]));

        let desired = desired(&index.read());
        assert_eq!(
            desired.keys().map(|a| a.to_string()).collect::<Vec<_>>(),
            vec!["10.96.0.5", "10.244.1.7", "192.0.2.10"]
        );
        assert!(desired.values().all(|v| *v == AclVerdict::Trusted));
    }

    #[test]
    fn missing_services_are_skipped() {
        let index = mk_index();
        index.write().apply(mk_acl("demo", vec![target("absent", false)]));
        assert!(desired(&index.read()).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let index = mk_index();
        index
            .write()
            .apply(mk_service("demo", "db", Some("10.96.0.5"), &[5432]));
        index.write().apply(mk_acl("demo", vec![target("db", false)]));

        let map = Arc::new(InMemoryMap::new());
        let metrics = DataPathMetrics::default();
        let sync = AclSync::new(index.clone(), map.clone(), metrics.clone());
        sync.reconcile().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(metrics.acl_ops("upsert", true), 1);

        let (writes, deletes) = (map.writes(), map.deletes());
        sync.reconcile().unwrap();
        assert_eq!((map.writes(), map.deletes()), (writes, deletes));

        IndexNamespacedResource::<AccessControl>::delete(
            &mut *index.write(),
            "demo".to_string(),
            "trust".to_string(),
        );
        sync.reconcile().unwrap();
        assert!(map.is_empty());
        assert_eq!(metrics.acl_ops("delete", true), 1);
    }

    #[test]
    fn failures_surface() {
        let index = mk_index();
        index
            .write()
            .apply(mk_service("demo", "db", Some("10.96.0.5"), &[5432]));
        index.write().apply(mk_acl("demo", vec![target("db", false)]));
        let map = Arc::new(InMemoryMap::new());
        map.set_failing(true);
        let metrics = DataPathMetrics::default();
        let sync = AclSync::new(index, map, metrics.clone());
        assert!(sync.reconcile().is_err());
        assert_eq!(metrics.acl_ops("reconcile", false), 1);
    }
}

use super::*;
use crate::{
    index::tests::{apply_node, mk_adv, mk_index, mk_node, mk_service},
    k8s::{
        api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort},
        EIPAdvertisement, EndpointSlice, Namespace, ObjectMeta,
    },
    maps::test_util::TestMaps,
    xnet::{arp::RecordingAnnouncer, route::FakeNeighbors, IfaceKey, KernelMap},
};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;

const EIP: &str = "203.0.113.7";
const BRIDGE_MAC: Mac = [0x0a, 0x58, 0x0a, 0xf4, 0x00, 0x01];
const GW_MAC: Mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
const ROUTER_MAC: Mac = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

#[derive(Default)]
struct FakeProber {
    down: Mutex<BTreeSet<SocketAddr>>,
}

#[async_trait::async_trait]
impl Prober for FakeProber {
    async fn probe(&self, addr: SocketAddr, _: bool) -> bool {
        !self.down.lock().contains(&addr)
    }
}

struct Harness {
    maps: TestMaps,
    neighbors: Arc<FakeNeighbors>,
    announcer: Arc<RecordingAnnouncer>,
    prober: Arc<FakeProber>,
    metrics: DataPathMetrics,
    applier: Applier,
}

fn gateway() -> Gateway {
    Gateway {
        ifindex: 2,
        ifname: "eth0".to_string(),
        mac: GW_MAC,
        via: Some("192.0.2.1".parse().unwrap()),
        addr: Some("192.0.2.10".parse().unwrap()),
    }
}

fn harness(node: &str, index: &SharedIndex) -> Harness {
    let maps = TestMaps::default();
    maps.iface.seed(
        IfaceKey::new("cni0"),
        IfaceVal {
            ifi: 4,
            mac: BRIDGE_MAC,
            ..Default::default()
        },
    );
    let neighbors = Arc::new(FakeNeighbors::new(Some(gateway())));
    let announcer = Arc::new(RecordingAnnouncer::new());
    let prober = Arc::new(FakeProber::default());
    let metrics = DataPathMetrics::default();
    let applier = Applier::new(
        node,
        "cni0",
        index.clone(),
        maps.node_maps(),
        neighbors.clone(),
        announcer.clone(),
        prober.clone(),
        metrics.clone(),
    );
    Harness {
        maps,
        neighbors,
        announcer,
        prober,
        metrics,
        applier,
    }
}

/// Two ready nodes and a cluster-IP service advertised on node `a`.
fn cluster() -> SharedIndex {
    let index = mk_index();
    apply_node(&index, mk_node("a", true, false));
    apply_node(&index, mk_node("b", true, false));
    index
        .write()
        .apply(mk_service("demo", "web", Some("10.96.0.9"), &[80, 443]));
    index.write().apply(mk_adv(
        "demo",
        "web",
        "web",
        &[EIP],
        btreemap! { EIP.to_string() => "a".to_string() },
    ));
    index
}

fn eip() -> IpAddr {
    EIP.parse().unwrap()
}

fn key(port: u16, dir: TcDir) -> NatKey {
    NatKey::new(SysId::E4lb, eip(), port, Proto::Tcp, dir)
}

fn headless(index: &SharedIndex, inherited: bool) {
    let mut svc = mk_service("demo", "web", None, &[80]);
    svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].target_port =
        Some(IntOrString::Int(8080));
    if inherited {
        svc.metadata.annotations = Some(btreemap! {
            labels::E4LB_CLOUD_INHERITED.to_string() => "true".to_string(),
        });
    }
    index.write().apply(svc);
    index.write().apply(EndpointSlice {
        metadata: ObjectMeta {
            namespace: Some("demo".to_string()),
            name: Some("web-x7k2p".to_string()),
            labels: Some(btreemap! {
                "kubernetes.io/service-name".to_string() => "web".to_string(),
            }),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: vec![
            Endpoint {
                addresses: vec!["10.244.1.5".to_string()],
                ..Default::default()
            },
            Endpoint {
                addresses: vec!["10.244.2.6".to_string()],
                ..Default::default()
            },
            Endpoint {
                addresses: vec!["10.244.3.7".to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ],
        ports: Some(vec![EndpointPort {
            port: Some(8080),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    });
}

#[tokio::test]
async fn programs_cluster_ip_services() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();

    let nat = h.maps.nat.snapshot();
    assert_eq!(nat.len(), 4, "two ports in two directions");
    for port in [80, 443] {
        for dir in TcDir::ALL {
            let val = nat.get(&key(port, dir)).expect("entry must exist");
            let eps = val.endpoints();
            assert_eq!(eps.len(), 1);
            assert_eq!(eps[0].raddr(false), "10.96.0.9".parse::<IpAddr>().unwrap());
            assert_eq!(eps[0].rport(), port);
            assert_eq!(eps[0].rmac, BRIDGE_MAC);
            assert_eq!(eps[0].ofi, 4);
            assert_eq!(eps[0].oflags, F_INGRESS);
            assert_eq!(eps[0].active, 1);
        }
    }
    assert_eq!(h.metrics.nat_ops("insert", true), 4);

    assert_eq!(h.neighbors.entries(), BTreeMap::from([((2, eip()), GW_MAC)]));
    assert_eq!(h.applier.announced(), BTreeSet::from([eip()]));
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();
    let (writes, deletes) = (h.maps.nat.writes(), h.maps.nat.deletes());

    h.applier.reconcile().await.unwrap();
    assert_eq!((h.maps.nat.writes(), h.maps.nat.deletes()), (writes, deletes));
}

#[tokio::test]
async fn other_nodes_do_not_program() {
    let index = cluster();
    let h = harness("b", &index);
    h.applier.reconcile().await.unwrap();
    assert!(h.maps.nat.is_empty());
    assert!(h.neighbors.entries().is_empty());
    assert!(h.applier.announced().is_empty());
}

#[tokio::test]
async fn advertises_owned_eips() {
    let index = cluster();
    let h = harness("a", &index);

    // Nothing is announced before the first scheduling pass.
    h.applier.advertise().await.unwrap();
    assert!(h.announcer.announced().is_empty());

    h.applier.reconcile().await.unwrap();
    h.applier.advertise().await.unwrap();
    h.applier.advertise().await.unwrap();
    assert_eq!(
        h.announcer.announced(),
        vec![("eth0".to_string(), eip()), ("eth0".to_string(), eip())]
    );
}

#[tokio::test]
async fn releases_rehomed_eips() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();
    assert_eq!(h.maps.nat.len(), 4);

    index.write().apply(mk_adv(
        "demo",
        "web",
        "web",
        &[EIP],
        btreemap! { EIP.to_string() => "b".to_string() },
    ));
    h.applier.reconcile().await.unwrap();

    assert!(h.maps.nat.is_empty());
    assert_eq!(h.metrics.nat_ops("delete", true), 4);
    assert!(h.neighbors.entries().is_empty());
    assert!(h.applier.announced().is_empty());

    h.applier.advertise().await.unwrap();
    assert!(h.announcer.announced().is_empty());
}

#[tokio::test]
async fn neighbors_follow_the_gateway_interface() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();
    assert_eq!(h.neighbors.entries(), btreemap! { (2, eip()) => GW_MAC });

    let moved = Gateway {
        ifindex: 3,
        ifname: "eth1".to_string(),
        ..gateway()
    };
    h.neighbors.set_gateway(Some(moved));
    h.applier.reconcile().await.unwrap();
    assert_eq!(h.neighbors.entries(), btreemap! { (3, eip()) => GW_MAC });

    index.write().apply(mk_adv(
        "demo",
        "web",
        "web",
        &[EIP],
        btreemap! { EIP.to_string() => "b".to_string() },
    ));
    h.neighbors.set_gateway(Some(gateway()));
    h.applier.reconcile().await.unwrap();
    assert!(h.neighbors.entries().is_empty());
}

#[tokio::test]
async fn deleted_advertisements_are_released() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();

    IndexNamespacedResource::<EIPAdvertisement>::delete(
        &mut *index.write(),
        "demo".to_string(),
        "web".to_string(),
    );
    h.applier.reconcile().await.unwrap();
    assert!(h.maps.nat.is_empty());
    assert!(h.neighbors.entries().is_empty());
}

#[tokio::test]
async fn routes_cloud_inherited_endpoints() {
    let index = cluster();
    headless(&index, true);
    let h = harness("a", &index);
    h.announcer
        .reply(Ipv4Addr::new(192, 0, 2, 1), ROUTER_MAC);
    h.prober
        .down
        .lock()
        .insert("10.244.2.6:8080".parse().unwrap());

    h.applier.reconcile().await.unwrap();

    let nat = h.maps.nat.snapshot();
    assert_eq!(nat.len(), 2);
    let val = nat[&key(80, TcDir::Egress)];
    let eps = val
        .endpoints()
        .iter()
        .map(|ep| {
            (
                SocketAddr::new(ep.raddr(false), ep.rport()).to_string(),
                ep.rmac,
                ep.ofi,
                ep.oflags,
                ep.active,
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        eps,
        vec![
            ("10.244.1.5:8080".to_string(), ROUTER_MAC, 2, F_EGRESS, 1),
            ("10.244.2.6:8080".to_string(), ROUTER_MAC, 2, F_EGRESS, 0),
        ]
    );
}

#[tokio::test]
async fn unresolved_next_hops_are_skipped() {
    let index = cluster();
    headless(&index, true);
    let h = harness("a", &index);

    h.applier.reconcile().await.unwrap();
    assert!(h.maps.nat.is_empty());
    assert!(h.applier.announced().is_empty());
}

#[tokio::test]
async fn plain_headless_services_are_ignored() {
    let index = cluster();
    headless(&index, false);
    let h = harness("a", &index);
    h.announcer
        .reply(Ipv4Addr::new(192, 0, 2, 1), ROUTER_MAC);

    h.applier.reconcile().await.unwrap();
    assert!(h.maps.nat.is_empty());
}

#[tokio::test]
async fn gateway_failure_aborts_the_pass() {
    let index = cluster();
    let h = harness("a", &index);
    h.neighbors.set_gateway(None);
    assert!(h.applier.reconcile().await.is_err());
    assert_eq!(h.maps.nat.writes(), 0);

    h.neighbors.set_gateway(Some(gateway()));
    h.applier.reconcile().await.unwrap();
    assert_eq!(h.maps.nat.len(), 4);
}

#[tokio::test]
async fn missing_bridge_aborts_the_pass() {
    let index = cluster();
    let h = harness("a", &index);
    h.maps.iface.delete(&IfaceKey::new("cni0")).unwrap();
    assert!(h.applier.reconcile().await.is_err());
    assert_eq!(h.maps.nat.writes(), 0);
    assert!(h.neighbors.entries().is_empty());
}

#[tokio::test]
async fn map_failures_retry_next_pass() {
    let index = cluster();
    let h = harness("a", &index);
    h.applier.reconcile().await.unwrap();

    // Move the EIP away while the map rejects writes.
    index.write().apply(mk_adv(
        "demo",
        "web",
        "web",
        &[EIP],
        btreemap! { EIP.to_string() => "b".to_string() },
    ));
    h.maps.nat.set_failing(true);
    assert!(h.applier.reconcile().await.is_err());
    assert_eq!(h.maps.nat.len(), 4);
    assert_eq!(h.metrics.nat_ops("delete", false), 4);

    h.maps.nat.set_failing(false);
    h.applier.reconcile().await.unwrap();
    assert!(h.maps.nat.is_empty());
}

#[tokio::test]
async fn stale_entries_are_hydrated_and_removed() {
    let index = cluster();
    let h = harness("a", &index);
    let stale = NatKey::new(
        SysId::E4lb,
        "198.51.100.1".parse().unwrap(),
        80,
        Proto::Tcp,
        TcDir::Ingress,
    );
    let mesh = NatKey::new(
        SysId::Mesh,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        53,
        Proto::Udp,
        TcDir::Ingress,
    );
    h.maps.nat.seed(stale, NatVal::default());
    h.maps.nat.seed(mesh, NatVal::default());

    h.applier.reconcile().await.unwrap();
    let nat = h.maps.nat.snapshot();
    assert!(!nat.contains_key(&stale));
    assert!(nat.contains_key(&mesh), "entries of other systems are untouched");
    assert_eq!(nat.len(), 5);
}

#[tokio::test]
async fn annotated_services_are_owned_by_hash() {
    let index = mk_index();
    for node in ["a", "b", "c"] {
        apply_node(&index, mk_node(node, true, false));
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            annotations: Some(btreemap! {
                labels::E4LB_ENABLED.to_string() => "enabled".to_string(),
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    kubert::index::IndexClusterResource::apply(&mut *index.write(), ns);
    let mut svc = mk_service("demo", "api", Some("10.96.0.30"), &[8443]);
    svc.metadata.annotations = Some(btreemap! {
        labels::E4LB_DESIRED_IP.to_string() => "198.51.100.4".to_string(),
    });
    index.write().apply(svc);

    let eligible = index.read().eligible_nodes();
    let owner = planner::hashed_owner(&eligible, "198.51.100.4")
        .cloned()
        .unwrap();

    for node in ["a", "b", "c"] {
        let h = harness(node, &index);
        h.applier.reconcile().await.unwrap();
        let programmed = !h.maps.nat.is_empty();
        assert_eq!(programmed, node == owner, "node {node}");
    }
}

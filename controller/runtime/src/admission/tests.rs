use super::*;
use crate::{
    index::tests::{mk_index, mk_service},
    inject::{annotations::SIDECAR_INJECTION, Certificate, Config},
    k8s::{config::MeshConfigSpec, labels, MeshConfig, Namespace, ObjectMeta, ResourceExt, Secret},
};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Default)]
struct FakeCerts {
    issued: Mutex<Vec<String>>,
}

#[derive(Default)]
struct FakeStore {
    secrets: Mutex<BTreeMap<String, Secret>>,
}

#[async_trait::async_trait]
impl CertificateProvider for FakeCerts {
    async fn issue(&self, cn_prefix: &str) -> anyhow::Result<Certificate> {
        self.issued.lock().push(cn_prefix.to_string());
        Ok(Certificate {
            ca_pem: "CA".to_string(),
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        })
    }
}

#[async_trait::async_trait]
impl BootstrapStore for FakeStore {
    async fn get(&self, _: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        Ok(self.secrets.lock().get(name).cloned())
    }

    async fn create(&self, secret: Secret) -> anyhow::Result<()> {
        self.secrets.lock().insert(secret.name_any(), secret);
        Ok(())
    }
}

fn mk_admission(index: SharedIndex, metrics: AdmissionMetrics) -> Admission<FakeCerts, FakeStore> {
    let injector = Injector::new(
        Config {
            mesh_name: "xmesh".to_string(),
            control_plane_namespace: "xmesh-system".to_string(),
            controller_service: "xmesh-controller".to_string(),
            trust_domain: "cluster.local".to_string(),
            pull_policy: None,
        },
        FakeCerts::default(),
        FakeStore::default(),
    );
    Admission::new(injector, index, metrics)
}

/// A monitored namespace with injection enabled, the mesh config and the
/// controller service.
fn mk_cluster(monitored: bool) -> SharedIndex {
    let index = mk_index();
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            labels: monitored.then(|| {
                btreemap! { labels::MONITORED_BY.to_string() => "xmesh".to_string() }
            }),
            annotations: Some(btreemap! {
                SIDECAR_INJECTION.to_string() => "enabled".to_string(),
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    kubert::index::IndexClusterResource::apply(&mut *index.write(), ns);

    let mut spec = MeshConfigSpec::default();
    spec.sidecar.sidecar_image = Some("xmesh/sidecar:1.0".to_string());
    spec.sidecar.init_container_image = Some("xmesh/init:1.0".to_string());
    spec.sidecar.healthcheck_image = Some("xmesh/healthcheck:1.0".to_string());
    let mut config = MeshConfig::new("xmesh-mesh-config", spec);
    config.metadata.namespace = Some("xmesh-system".to_string());
    index.write().apply(config);

    index.write().apply(mk_service(
        "xmesh-system",
        "xmesh-controller",
        Some("10.96.0.20"),
        &[53, 6060],
    ));
    index
}

fn pod(annotations: impl serde::Serialize) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "web-0",
            "namespace": "demo",
            "annotations": annotations,
        },
        "spec": {
            "containers": [{"name": "app", "image": "web:1"}],
        },
    })
}

fn request(kind: Value, operation: &str, object: Value) -> AdmissionRequest {
    let review: Review = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "5c3e8a46-1f2b-4d7e-9a57-0b9d2c4e6f81",
            "kind": kind,
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": operation,
            "namespace": "demo",
            "name": "web-0",
            "userInfo": {},
            "object": object,
            "dryRun": false,
        },
    }))
    .expect("review must parse");
    review.try_into().expect("review must carry a request")
}

fn pod_kind() -> Value {
    json!({"group": "", "version": "v1", "kind": "Pod"})
}

fn patch_ops(rsp: &AdmissionResponse) -> Vec<Value> {
    let bytes = rsp.patch.as_ref().expect("response must carry a patch");
    serde_json::from_slice(bytes).expect("patch must be JSON")
}

#[tokio::test]
async fn injects_pods() {
    let metrics = AdmissionMetrics::default();
    let admission = mk_admission(mk_cluster(true), metrics.clone());
    let rsp = admission
        .admit(request(pod_kind(), "CREATE", pod(json!({}))))
        .await;
    assert!(rsp.allowed);
    let ops = patch_ops(&rsp);
    assert!(!ops.is_empty());
    let added_containers = ops
        .iter()
        .filter(|op| op["op"] == "add")
        .any(|op| op["path"].as_str().unwrap_or_default().starts_with("/spec/containers"));
    assert!(added_containers, "{ops:?}");
    assert_eq!(metrics.requests("pod", "injected"), 1);
}

#[tokio::test]
async fn unmonitored_namespaces_are_skipped() {
    let metrics = AdmissionMetrics::default();
    let admission = mk_admission(mk_cluster(false), metrics.clone());
    let rsp = admission
        .admit(request(pod_kind(), "CREATE", pod(json!({}))))
        .await;
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());
    assert_eq!(metrics.requests("pod", "skipped"), 1);
}

#[tokio::test]
async fn invalid_annotations_are_denied() {
    let metrics = AdmissionMetrics::default();
    let admission = mk_admission(mk_cluster(true), metrics.clone());
    let rsp = admission
        .admit(request(
            pod_kind(),
            "CREATE",
            pod(json!(btreemap! { SIDECAR_INJECTION => "maybe" })),
        ))
        .await;
    assert!(!rsp.allowed);
    assert_eq!(metrics.requests("pod", "denied"), 1);
    assert_eq!(metrics.errors("annotation"), 1);
}

#[tokio::test]
async fn unknown_namespaces_are_denied() {
    let metrics = AdmissionMetrics::default();
    let index = mk_cluster(true);
    kubert::index::IndexClusterResource::<Namespace>::delete(
        &mut *index.write(),
        "demo".to_string(),
    );
    let admission = mk_admission(index, metrics.clone());
    let rsp = admission
        .admit(request(pod_kind(), "CREATE", pod(json!({}))))
        .await;
    assert!(!rsp.allowed);
    assert_eq!(metrics.requests("pod", "denied"), 1);
}

#[tokio::test]
async fn missing_mesh_config_is_denied() {
    let index = mk_cluster(true);
    IndexNamespacedResource::<MeshConfig>::delete(
        &mut *index.write(),
        "xmesh-system".to_string(),
        "xmesh-mesh-config".to_string(),
    );
    let admission = mk_admission(index, AdmissionMetrics::default());
    let rsp = admission
        .admit(request(pod_kind(), "CREATE", pod(json!({}))))
        .await;
    assert!(!rsp.allowed);
}

#[tokio::test]
async fn updates_are_allowed_untouched() {
    let metrics = AdmissionMetrics::default();
    let admission = mk_admission(mk_cluster(true), metrics.clone());
    let rsp = admission
        .admit(request(pod_kind(), "UPDATE", pod(json!({}))))
        .await;
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());
}

#[tokio::test]
async fn virtual_machines_are_labeled() {
    let metrics = AdmissionMetrics::default();
    let admission = mk_admission(mk_cluster(true), metrics.clone());
    let vm = json!({
        "apiVersion": "machine.xmesh.io/v1alpha1",
        "kind": "VirtualMachine",
        "metadata": {"name": "vm-0", "namespace": "demo"},
        "spec": {},
    });
    let rsp = admission
        .admit(request(
            json!({"group": "machine.xmesh.io", "version": "v1alpha1", "kind": "VirtualMachine"}),
            "CREATE",
            vm,
        ))
        .await;
    assert!(rsp.allowed);
    let ops = patch_ops(&rsp);
    assert_eq!(ops.len(), 1, "{ops:?}");
    assert_eq!(ops[0]["path"], "/metadata/labels");
    assert!(ops[0]["value"][labels::SIDECAR_UID].is_string());
    assert_eq!(metrics.requests("vm", "injected"), 1);
}

#[tokio::test]
async fn unsupported_kinds_are_invalid() {
    let admission = mk_admission(mk_cluster(true), AdmissionMetrics::default());
    let rsp = admission
        .admit(request(
            json!({"group": "apps", "version": "v1", "kind": "Deployment"}),
            "CREATE",
            json!({}),
        ))
        .await;
    assert!(!rsp.allowed);
}

#[tokio::test]
async fn malformed_bodies_are_invalid() {
    let admission = mk_admission(mk_cluster(true), AdmissionMetrics::default());
    let review = admission.review(bytes::Bytes::from_static(b"{not json")).await;
    let rsp = review.response.expect("review must carry a response");
    assert!(!rsp.allowed);
}

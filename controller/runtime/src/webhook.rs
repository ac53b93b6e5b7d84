//! Keeps the injector's `MutatingWebhookConfiguration` in the shape the
//! admission server expects.

use crate::{
    admission::MUTATE_PATH,
    k8s::{
        self,
        api::admissionregistration::v1::{
            MutatingWebhook, RuleWithOperations, ServiceReference, WebhookClientConfig,
        },
        apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
        labels, MutatingWebhookConfiguration, ObjectMeta, Resource,
    },
};
use anyhow::{Context, Result};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use tracing::info;

pub const WEBHOOK_NAME: &str = "xmesh-inject.k8s.io";
pub const SERVICE_PORT: i32 = 9090;
const FIELD_MANAGER: &str = "xmesh-injector";
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

#[derive(Clone, Debug)]
pub struct Params {
    pub name: String,
    pub mesh_name: String,
    pub control_plane_namespace: String,
    pub service: String,
    pub timeout_seconds: i32,
    pub ca_bundle: Vec<u8>,
    pub reconcile: bool,
}

/// Server-side applies the webhook configuration, taking ownership of the
/// fields it sets.
pub async fn apply(client: k8s::Client, params: &Params) -> Result<()> {
    let api = k8s::Api::<MutatingWebhookConfiguration>::all(client);
    let config = build(params);
    api.patch(
        &params.name,
        &k8s::PatchParams::apply(FIELD_MANAGER).force(),
        &k8s::Patch::Apply(config),
    )
    .await
    .with_context(|| format!("failed to apply webhook configuration {}", params.name))?;
    info!(name = %params.name, "Applied mutating webhook configuration");
    Ok(())
}

pub fn build(params: &Params) -> MutatingWebhookConfiguration {
    let mut meta_labels: BTreeMap<String, String> = [
        (labels::APP_NAME, "xmesh-injector".to_string()),
        (labels::APP_INSTANCE, params.mesh_name.clone()),
        (labels::APP_VERSION, env!("CARGO_PKG_VERSION").to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    if params.reconcile {
        meta_labels.insert(labels::RECONCILE.to_string(), "true".to_string());
    }

    let dt = Default::default();
    let vm_group = k8s::VirtualMachine::group(&dt).to_string();
    let vm_version = k8s::VirtualMachine::version(&dt).to_string();
    let vm_plural = k8s::VirtualMachine::plural(&dt).to_string();

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            labels: Some(meta_labels),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: WEBHOOK_NAME.to_string(),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: params.service.clone(),
                    namespace: params.control_plane_namespace.clone(),
                    path: Some(MUTATE_PATH.to_string()),
                    port: Some(SERVICE_PORT),
                }),
                ca_bundle: Some(ByteString(params.ca_bundle.clone())),
                url: None,
            },
            failure_policy: Some("Fail".to_string()),
            match_policy: Some("Exact".to_string()),
            namespace_selector: Some(namespace_selector(params)),
            rules: Some(vec![
                create_rule("", "v1", "pods"),
                create_rule(&vm_group, &vm_version, &vm_plural),
            ]),
            side_effects: "NoneOnDryRun".to_string(),
            timeout_seconds: Some(params.timeout_seconds),
            admission_review_versions: vec!["v1".to_string()],
            ..Default::default()
        }]),
    }
}

/// Monitored by this mesh, not ignored, and never the control plane itself.
fn namespace_selector(params: &Params) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            [(labels::MONITORED_BY.to_string(), params.mesh_name.clone())]
                .into_iter()
                .collect(),
        ),
        match_expressions: Some(vec![
            LabelSelectorRequirement {
                key: labels::IGNORE.to_string(),
                operator: "DoesNotExist".to_string(),
                values: None,
            },
            LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "NotIn".to_string(),
                values: Some(vec![params.control_plane_namespace.clone()]),
            },
        ]),
    }
}

fn create_rule(group: &str, version: &str, resource: &str) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![group.to_string()]),
        api_versions: Some(vec![version.to_string()]),
        operations: Some(vec!["CREATE".to_string()]),
        resources: Some(vec![resource.to_string()]),
        scope: None,
    }
}

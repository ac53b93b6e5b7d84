use crate::k8s::{self, labels, ObjectMeta};
use anyhow::{Context, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
pub const LEASE_NAME: &str = "xmesh-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Ensures the planner lease exists and starts competing for it. The
/// returned watch reflects the current holder.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    mesh_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease when it does
            // not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [
                    (labels::APP_NAME.to_string(), "xmesh-controller".to_string()),
                    (labels::APP_INSTANCE.to_string(), mesh_name.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &k8s::PatchParams {
                field_manager: Some(crate::status::FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &k8s::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error).context("failed to create lease"),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

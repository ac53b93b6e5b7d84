//! Writes planner results back to `EIPAdvertisement` status.

use crate::{
    core::planner::Announce,
    index::ResourceId,
    k8s::{self, EIPAdvertisement},
    metrics::StatusMetrics,
};
use serde_json::{json, Map, Value};
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info};

pub const FIELD_MANAGER: &str = "xmesh-controller";

pub struct Controller {
    client: k8s::Client,
    updates: mpsc::Receiver<Update>,
    patch_timeout: time::Duration,
    metrics: StatusMetrics,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<Value>,
}

impl Controller {
    pub fn new(
        client: k8s::Client,
        updates: mpsc::Receiver<Update>,
        patch_timeout: time::Duration,
        metrics: StatusMetrics,
    ) -> Self {
        Self {
            client,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Applies updates until every sender is dropped. Failures are logged;
    /// the next planning pass recomputes and resends.
    pub async fn run(mut self) {
        let params = k8s::PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        while let Some(Update { id, patch }) = self.updates.recv().await {
            let api = k8s::Api::<EIPAdvertisement>::namespaced(self.client.clone(), &id.namespace);
            let patched = time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &params, &patch),
            )
            .await;
            match patched {
                Ok(Ok(_)) => {
                    info!(advertisement = %id, "Updated announce status");
                    self.metrics.update("ok");
                }
                Ok(Err(k8s::Error::Api(rsp))) if rsp.code == 409 => {
                    debug!(advertisement = %id, "Status conflict; retrying on the next tick");
                    self.metrics.update("error");
                }
                Ok(Err(error)) => {
                    error!(advertisement = %id, %error, "Failed to patch status");
                    self.metrics.update("error");
                }
                Err(_) => {
                    error!(
                        advertisement = %id,
                        timeout = ?self.patch_timeout,
                        "Timed out patching status"
                    );
                    self.metrics.update("timeout");
                }
            }
        }
    }
}

/// Builds a merge patch that moves `status.announce` from `current` to
/// `next`. EIPs that are no longer assigned are written as `null` so the
/// merge removes them.
pub fn announce_patch(current: &Announce, next: &Announce) -> k8s::Patch<Value> {
    let mut announce = Map::new();
    for (eip, node) in next {
        announce.insert(eip.clone(), Value::String(node.clone()));
    }
    for eip in current.keys().filter(|eip| !next.contains_key(*eip)) {
        announce.insert(eip.clone(), Value::Null);
    }
    k8s::Patch::Merge(json!({ "status": { "announce": announce } }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn patch_nulls_removed_eips() {
        let current = btreemap! {
            "203.0.113.7".to_string() => "a".to_string(),
            "203.0.113.8".to_string() => "b".to_string(),
        };
        let next = btreemap! {
            "203.0.113.7".to_string() => "c".to_string(),
        };
        let k8s::Patch::Merge(patch) = announce_patch(&current, &next) else {
            panic!("expected a merge patch");
        };
        assert_eq!(
            patch,
            json!({"status": {"announce": {"203.0.113.7": "c", "203.0.113.8": null}}})
        );
    }

    #[test]
    fn patch_from_empty_status() {
        let next = btreemap! { "198.51.100.1".to_string() => "a".to_string() };
        let k8s::Patch::Merge(patch) = announce_patch(&Announce::new(), &next) else {
            panic!("expected a merge patch");
        };
        assert_eq!(patch, json!({"status": {"announce": {"198.51.100.1": "a"}}}));
    }
}

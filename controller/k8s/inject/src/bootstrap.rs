//! The per-proxy bootstrap secret.

use crate::{containers::bootstrap_secret_name, probes::HealthProbes, Certificate, Error, Result};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xmesh_controller_k8s_api::{labels, ObjectMeta, ResourceExt};

pub const BOOTSTRAP_KEY: &str = "bootstrap.yaml";
pub const CA_CERT_KEY: &str = "cacert.pem";
pub const REPO_CERT_KEY: &str = "repo_cert.pem";
pub const REPO_KEY_KEY: &str = "repo_key.pem";

const APP_NAME: &str = "xmesh";

/// The document the sidecar reads at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub cn_prefix: String,
    pub mesh_name: String,
    pub repo_url: String,
    #[serde(default)]
    pub probes: HealthProbes,
}

/// Builds the bootstrap secret for a freshly issued certificate.
pub fn build_secret(
    namespace: &str,
    proxy_uuid: &str,
    config: &BootstrapConfig,
    cert: &Certificate,
) -> Result<Secret> {
    let mut data = BTreeMap::new();
    data.insert(
        BOOTSTRAP_KEY.to_string(),
        ByteString(serde_yaml::to_string(config)?.into_bytes()),
    );
    data.insert(
        CA_CERT_KEY.to_string(),
        ByteString(cert.ca_pem.clone().into_bytes()),
    );
    data.insert(
        REPO_CERT_KEY.to_string(),
        ByteString(cert.cert_pem.clone().into_bytes()),
    );
    data.insert(
        REPO_KEY_KEY.to_string(),
        ByteString(cert.key_pem.clone().into_bytes()),
    );
    Ok(mk_secret(namespace, proxy_uuid, data))
}

/// Copies an existing bootstrap secret under a new proxy identity. The
/// credentials are kept; the bootstrap document is re-stamped with the new
/// CN prefix and repo URL.
pub fn restamp(
    existing: &Secret,
    namespace: &str,
    proxy_uuid: &str,
    cn_prefix: &str,
    repo_url: &str,
) -> Result<Secret> {
    let mut config = read_config(existing)?;
    let mut data = existing.data.clone().unwrap_or_default();
    config.cn_prefix = cn_prefix.to_string();
    config.repo_url = repo_url.to_string();
    data.insert(
        BOOTSTRAP_KEY.to_string(),
        ByteString(serde_yaml::to_string(&config)?.into_bytes()),
    );
    Ok(mk_secret(namespace, proxy_uuid, data))
}

/// Reads the bootstrap document from a secret.
pub(crate) fn read_config(secret: &Secret) -> Result<BootstrapConfig> {
    let name = secret.name_any();
    let doc = secret
        .data
        .as_ref()
        .and_then(|d| d.get(BOOTSTRAP_KEY))
        .ok_or_else(|| Error::MalformedBootstrap {
            name: name.clone(),
            reason: format!("missing key {BOOTSTRAP_KEY}"),
        })?;
    serde_yaml::from_slice(&doc.0).map_err(|e| Error::MalformedBootstrap {
        name,
        reason: e.to_string(),
    })
}

fn mk_secret(namespace: &str, proxy_uuid: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(bootstrap_secret_name(proxy_uuid)),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [
                    (labels::PROXY_UUID.to_string(), proxy_uuid.to_string()),
                    (labels::APP_NAME.to_string(), APP_NAME.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cert() -> Certificate {
        Certificate {
            ca_pem: "CA".to_string(),
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        }
    }

    fn config(cn: &str) -> BootstrapConfig {
        BootstrapConfig {
            cn_prefix: cn.to_string(),
            mesh_name: "xmesh".to_string(),
            repo_url: format!("http://repo:6060/repo/xmesh-sidecar/{cn}/"),
            probes: HealthProbes::default(),
        }
    }

    #[test]
    fn builds_secret() {
        let secret = build_secret("demo", "u1", &config("u1.sidecar.sa.demo"), &cert()).unwrap();
        assert_eq!(secret.name_any(), "sidecar-bootstrap-config-u1");
        assert_eq!(secret.namespace().as_deref(), Some("demo"));
        assert_eq!(secret.labels()[labels::PROXY_UUID], "u1");
        assert_eq!(secret.labels()[labels::APP_NAME], "xmesh");

        let data = secret.data.as_ref().unwrap();
        assert_eq!(data[REPO_CERT_KEY].0, b"CERT".to_vec());
        assert_eq!(read_config(&secret).unwrap(), config("u1.sidecar.sa.demo"));
    }

    #[test]
    fn restamps_copy() {
        let old = build_secret("demo", "u1", &config("u1.sidecar.sa.demo"), &cert()).unwrap();
        let new = restamp(
            &old,
            "demo",
            "u2",
            "u2.sidecar.sa.demo",
            "http://repo:6060/repo/xmesh-sidecar/u2.sidecar.sa.demo/",
        )
        .unwrap();

        assert_eq!(new.name_any(), "sidecar-bootstrap-config-u2");
        assert_eq!(new.labels()[labels::PROXY_UUID], "u2");
        let data = new.data.as_ref().unwrap();
        assert_eq!(data[CA_CERT_KEY].0, b"CA".to_vec());
        assert_eq!(data[REPO_KEY_KEY].0, b"KEY".to_vec());
        assert_eq!(read_config(&new).unwrap(), config("u2.sidecar.sa.demo"));
    }

    #[test]
    fn restamp_rejects_missing_document() {
        let mut old = build_secret("demo", "u1", &config("u1"), &cert()).unwrap();
        old.data.as_mut().unwrap().remove(BOOTSTRAP_KEY);
        assert!(matches!(
            restamp(&old, "demo", "u2", "u2", "url"),
            Err(Error::MalformedBootstrap { .. })
        ));
    }
}

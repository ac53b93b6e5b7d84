//! Kubernetes-backed implementations of the injector's external effects.

use crate::{
    inject::{BootstrapStore, Certificate, CertificateProvider},
    k8s::{self, Secret},
    metrics::AdmissionMetrics,
};
use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;

const CA_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const KEY_KEY: &str = "tls.key";

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Serves a credential provisioned in a Secret.
    Secret,
}

/// Reads a provisioned credential from a Secret in the control-plane
/// namespace. The requested CN is carried by the bootstrap document.
pub struct SecretCertificateProvider {
    api: k8s::Api<Secret>,
    name: String,
    metrics: AdmissionMetrics,
}

pub struct KubeBootstrapStore {
    client: k8s::Client,
}

// === impl SecretCertificateProvider ===

impl SecretCertificateProvider {
    pub fn new(
        client: k8s::Client,
        namespace: &str,
        name: impl ToString,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            api: k8s::Api::namespaced(client, namespace),
            name: name.to_string(),
            metrics,
        }
    }
}

#[async_trait::async_trait]
impl CertificateProvider for SecretCertificateProvider {
    async fn issue(&self, cn_prefix: &str) -> Result<Certificate> {
        let secret = self
            .api
            .get(&self.name)
            .await
            .with_context(|| format!("failed to read secret {}", self.name))?;
        let cert = certificate_from(&secret)?;
        tracing::debug!(%cn_prefix, secret = %self.name, "Issued bootstrap certificate");
        self.metrics.certificate_issued();
        Ok(cert)
    }
}

fn certificate_from(secret: &Secret) -> Result<Certificate> {
    let field = |key: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or_else(|| anyhow!("secret has no {key} entry"))?;
        String::from_utf8(bytes.0.clone()).with_context(|| format!("{key} is not valid UTF-8"))
    };
    Ok(Certificate {
        ca_pem: field(CA_KEY)?,
        cert_pem: field(CERT_KEY)?,
        key_pem: field(KEY_KEY)?,
    })
}

// === impl KubeBootstrapStore ===

impl KubeBootstrapStore {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl BootstrapStore for KubeBootstrapStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api = k8s::Api::<Secret>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, secret: Secret) -> Result<()> {
        let namespace = secret
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| anyhow!("bootstrap secret has no namespace"))?;
        let api = k8s::Api::<Secret>::namespaced(self.client.clone(), &namespace);
        match api.create(&k8s::PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            // A concurrent admission of the same workload created it first.
            Err(k8s::Error::Api(rsp)) if rsp.code == 409 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use maplit::btreemap;

    fn mk_secret(keys: &[&str]) -> Secret {
        Secret {
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(format!("PEM {k}").into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn reads_credential_keys() {
        let cert = certificate_from(&mk_secret(&[CA_KEY, CERT_KEY, KEY_KEY])).unwrap();
        assert_eq!(
            cert,
            Certificate {
                ca_pem: "PEM ca.crt".to_string(),
                cert_pem: "PEM tls.crt".to_string(),
                key_pem: "PEM tls.key".to_string(),
            }
        );
    }

    #[test]
    fn missing_keys_fail() {
        let error = certificate_from(&mk_secret(&[CA_KEY, CERT_KEY])).unwrap_err();
        assert!(error.to_string().contains("tls.key"), "{error}");
        assert!(certificate_from(&Secret::default()).is_err());
    }

    #[test]
    fn rejects_non_utf8() {
        let secret = Secret {
            data: Some(btreemap! {
                CA_KEY.to_string() => ByteString(vec![0xff, 0xfe]),
                CERT_KEY.to_string() => ByteString(b"cert".to_vec()),
                KEY_KEY.to_string() => ByteString(b"key".to_vec()),
            }),
            ..Default::default()
        };
        assert!(certificate_from(&secret).is_err());
    }
}

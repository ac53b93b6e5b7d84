#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Composes the admission-time mutation that injects the sidecar proxy into
//! a workload.

pub mod annotations;
pub mod bootstrap;
pub mod containers;
mod error;
pub mod probes;

pub use self::error::{Error, Result};

use self::{
    annotations::{Annotations, Scope},
    bootstrap::BootstrapConfig,
    containers::SidecarParams,
};
use k8s_openapi::{
    api::core::v1::{HostAlias, Namespace, Pod, PodDNSConfig, PodDNSConfigOption, Secret},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use tracing::{debug, info};
use xmesh_controller_core::iptables::RuleProgram;
use xmesh_controller_k8s_api::{
    config::{InterceptionMode, MeshConfigSpec},
    labels, ResourceExt, VirtualMachine,
};

const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";
const PROXY_KIND: &str = "sidecar";

/// Credentials for a sidecar's bootstrap identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Certificate {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issues bootstrap certificates.
#[async_trait::async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn issue(&self, cn_prefix: &str) -> anyhow::Result<Certificate>;
}

/// Persists bootstrap secrets.
#[async_trait::async_trait]
pub trait BootstrapStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>>;

    async fn create(&self, secret: Secret) -> anyhow::Result<()>;
}

/// Static injector settings.
#[derive(Clone, Debug)]
pub struct Config {
    pub mesh_name: String,
    pub control_plane_namespace: String,
    pub controller_service: String,
    pub trust_domain: String,
    pub pull_policy: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Workload {
    Pod(Box<Pod>),
    VirtualMachine(Box<VirtualMachine>),
}

/// The workload attributes that drive injection, independent of kind.
#[derive(Clone, Debug, Default)]
pub struct InjectionContext {
    pub namespace: String,
    pub name: String,
    pub service_account: String,
    pub annotations: Annotations,
    pub host_network: bool,
    pub owner_references: Vec<OwnerReference>,
}

pub struct Request<'a> {
    pub workload: Workload,
    pub namespace: &'a Namespace,
    pub mesh: &'a MeshConfigSpec,
    /// Cluster IP of the controller service, when known.
    pub controller_ip: Option<String>,
    pub proxy_uuid: String,
    pub dry_run: bool,
}

pub struct Injector<C, S> {
    config: Config,
    certs: C,
    store: S,
}

// === impl Workload ===

impl Workload {
    pub fn context(&self, namespace: &str) -> InjectionContext {
        match self {
            Self::Pod(pod) => {
                let spec = pod.spec.as_ref();
                InjectionContext {
                    namespace: pod.namespace().unwrap_or_else(|| namespace.to_string()),
                    name: pod.name_any(),
                    service_account: spec
                        .and_then(|s| s.service_account_name.clone())
                        .filter(|sa| !sa.is_empty())
                        .unwrap_or_else(|| "default".to_string()),
                    annotations: pod.annotations().clone(),
                    host_network: spec.and_then(|s| s.host_network).unwrap_or(false),
                    owner_references: pod.owner_references().to_vec(),
                }
            }
            Self::VirtualMachine(vm) => InjectionContext {
                namespace: vm.namespace().unwrap_or_else(|| namespace.to_string()),
                name: vm.name_any(),
                service_account: vm
                    .spec
                    .service_account_name
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
                annotations: vm.annotations().clone(),
                host_network: false,
                owner_references: vm.owner_references().to_vec(),
            },
        }
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Pod(pod) => serde_json::to_value(pod)?,
            Self::VirtualMachine(vm) => serde_json::to_value(vm)?,
        };
        Ok(value)
    }

    fn set_proxy_label(&mut self, proxy_uuid: &str) {
        let labels = match self {
            Self::Pod(pod) => pod.labels_mut(),
            Self::VirtualMachine(vm) => vm.labels_mut(),
        };
        labels.insert(labels::SIDECAR_UID.to_string(), proxy_uuid.to_string());
    }
}

// === impl Injector ===

impl<C: CertificateProvider, S: BootstrapStore> Injector<C, S> {
    pub fn new(config: Config, certs: C, store: S) -> Self {
        Self {
            config,
            certs,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Computes the JSON patch that injects the workload, or `None` when the
    /// workload is not injected.
    pub async fn mutate(&self, req: Request<'_>) -> Result<Option<json_patch::Patch>> {
        let Request {
            mut workload,
            namespace,
            mesh,
            controller_ip,
            proxy_uuid,
            dry_run,
        } = req;

        let ctx = workload.context(&namespace.name_any());
        let scope = Scope {
            mesh_name: &self.config.mesh_name,
            control_plane_namespace: &self.config.control_plane_namespace,
        };
        if !annotations::should_inject(scope, namespace, &ctx.annotations, ctx.host_network)? {
            debug!(ns = %ctx.namespace, name = %ctx.name, "Skipping injection");
            return Ok(None);
        }

        let original = workload.to_value()?;

        // Virtual machines, and pods under node-level interception, only
        // receive the proxy label.
        if let Workload::Pod(pod) = &mut workload {
            if mesh.traffic.interception_mode == InterceptionMode::PodLevel {
                self.inject_pod(pod, &ctx, namespace, mesh, controller_ip, &proxy_uuid, dry_run)
                    .await?;
            }
        }
        workload.set_proxy_label(&proxy_uuid);

        let mutated = workload.to_value()?;
        info!(ns = %ctx.namespace, name = %ctx.name, %proxy_uuid, "Injecting sidecar");
        Ok(Some(json_patch::diff(&original, &mutated)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn inject_pod(
        &self,
        pod: &mut Pod,
        ctx: &InjectionContext,
        namespace: &Namespace,
        mesh: &MeshConfigSpec,
        controller_ip: Option<String>,
        proxy_uuid: &str,
        dry_run: bool,
    ) -> Result<()> {
        let ns_annotations = namespace.annotations();
        let cn_prefix = self.cn_prefix(proxy_uuid, ctx);
        let repo_url = containers::repo_url(
            &mesh.repo_server,
            mesh.sidecar.proxy_server_port,
            &self.config.controller_service,
            &self.config.control_plane_namespace,
            &cn_prefix,
        );
        let spec = pod.spec.get_or_insert_with(Default::default);

        // A copied pod already carries a bootstrap volume; give it a fresh
        // identity backed by a copy of the original secret.
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if let Some(existing) = volumes
            .iter_mut()
            .find(|v| v.name == containers::BOOTSTRAP_VOLUME)
        {
            let old_name = existing
                .secret
                .as_ref()
                .and_then(|s| s.secret_name.clone())
                .unwrap_or_default();
            let Some(old_uuid) = containers::uuid_from_secret_name(&old_name) else {
                return Err(Error::MalformedBootstrap {
                    name: old_name,
                    reason: "volume does not reference a bootstrap secret".to_string(),
                });
            };
            debug!(%old_uuid, "Workload was already injected");
            if !dry_run {
                let old = self
                    .store
                    .get(&ctx.namespace, &old_name)
                    .await
                    .map_err(|e| Error::Secret {
                        name: old_name.clone(),
                        source: e.into(),
                    })?
                    .ok_or_else(|| Error::MissingBootstrap(old_name.clone()))?;
                let secret =
                    bootstrap::restamp(&old, &ctx.namespace, proxy_uuid, &cn_prefix, &repo_url)?;
                self.persist(secret).await?;
            }
            *existing = containers::bootstrap_volume(&containers::bootstrap_secret_name(proxy_uuid));
            return Ok(());
        }

        let sidecar_image = annotations::sidecar_image(&ctx.annotations, ns_annotations, mesh)
            .ok_or(Error::MissingImage("sidecarImage"))?;
        let init_image = mesh
            .sidecar
            .init_container_image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or(Error::MissingImage("initContainerImage"))?;

        let exclusions = annotations::exclusions(&ctx.annotations, &mesh.traffic)?;
        let metrics = annotations::metrics_enabled(namespace)?;
        let probes = probes::rewrite(&mut spec.containers);
        let healthcheck_image = if probes.uses_tcp() {
            let image = mesh
                .sidecar
                .healthcheck_image
                .clone()
                .filter(|i| !i.is_empty())
                .ok_or(Error::MissingImage("healthcheckImage"))?;
            Some(image)
        } else {
            None
        };

        if !dry_run {
            let cert = self
                .certs
                .issue(&cn_prefix)
                .await
                .map_err(|e| Error::Certificate {
                    cn_prefix: cn_prefix.clone(),
                    source: e.into(),
                })?;
            let config = BootstrapConfig {
                cn_prefix: cn_prefix.clone(),
                mesh_name: self.config.mesh_name.clone(),
                repo_url: repo_url.clone(),
                probes: probes.clone(),
            };
            let secret = bootstrap::build_secret(&ctx.namespace, proxy_uuid, &config, &cert)?;
            self.persist(secret).await?;
        }

        let pull_policy = self.config.pull_policy.as_deref();
        let dns_proxy = mesh.sidecar.local_dns_proxy.enable;

        spec.volumes
            .get_or_insert_with(Vec::new)
            .push(containers::bootstrap_volume(&containers::bootstrap_secret_name(
                proxy_uuid,
            )));

        let program = RuleProgram::new(
            mesh.traffic.interception_mode.into(),
            mesh.sidecar.local_proxy_mode.into(),
            exclusions,
        )
        .with_dns_proxy(dns_proxy);
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .push(containers::init_container(
                init_image,
                &program,
                mesh.sidecar.enable_privileged_init_container,
                pull_policy,
            ));

        if let Some(image) = healthcheck_image {
            spec.containers.push(containers::healthcheck_container(
                image,
                mesh.sidecar.healthcheck_resources.clone(),
                pull_policy,
            ));
        }

        let hold_application = annotations::lifecycle_flag(
            &ctx.annotations,
            ns_annotations,
            annotations::HOLD_APPLICATION_UNTIL_PROXY_STARTS,
            mesh.sidecar.hold_application_until_proxy_starts,
        );
        let graceful_exit = annotations::lifecycle_flag(
            &ctx.annotations,
            ns_annotations,
            annotations::GRACEFUL_EXIT_UNTIL_DOWNSTREAM_ENDS,
            mesh.sidecar.graceful_exit_until_downstream_ends,
        );
        let sidecar = containers::sidecar_container(
            SidecarParams {
                image: sidecar_image,
                mesh_name: &self.config.mesh_name,
                repo_url,
                resources: annotations::sidecar_resources(
                    &ctx.annotations,
                    ns_annotations,
                    mesh.sidecar.resources.as_ref(),
                ),
                probes: &probes,
                owner: containers::controller_ref(&ctx.owner_references),
                hold_application,
                graceful_exit,
            },
            mesh,
            pull_policy,
        );
        // The application must not start before the proxy is ready.
        if hold_application {
            spec.containers.insert(0, sidecar);
        } else {
            spec.containers.push(sidecar);
        }

        if dns_proxy {
            match controller_ip {
                Some(ip) => {
                    let td = self.trust_domain(mesh);
                    spec.host_aliases.get_or_insert_with(Vec::new).push(HostAlias {
                        ip: ip.clone(),
                        hostnames: Some(vec![format!(
                            "{}.{}",
                            self.config.controller_service, self.config.control_plane_namespace
                        )]),
                    });
                    spec.dns_policy = Some("None".to_string());
                    spec.dns_config = Some(dns_config(&ip, &ctx.namespace, td));
                }
                None => debug!("Controller address unknown; leaving DNS settings unchanged"),
            }
        }

        if metrics {
            let annotations = pod.annotations_mut();
            annotations.insert(annotations::PROMETHEUS_SCRAPE.to_string(), "true".to_string());
            annotations.insert(
                annotations::PROMETHEUS_PORT.to_string(),
                xmesh_controller_core::PROXY_PROMETHEUS_PORT.to_string(),
            );
            annotations.insert(
                annotations::PROMETHEUS_PATH.to_string(),
                xmesh_controller_core::PROMETHEUS_PATH.to_string(),
            );
        }

        Ok(())
    }

    async fn persist(&self, secret: Secret) -> Result<()> {
        let name = secret.name_any();
        self.store
            .create(secret)
            .await
            .map_err(|e| Error::Secret {
                name,
                source: e.into(),
            })
    }

    fn cn_prefix(&self, proxy_uuid: &str, ctx: &InjectionContext) -> String {
        format!(
            "{proxy_uuid}.{PROXY_KIND}.{}.{}",
            ctx.service_account, ctx.namespace
        )
    }

    fn trust_domain<'m>(&'m self, mesh: &'m MeshConfigSpec) -> &'m str {
        mesh.certificate
            .trust_domain
            .as_deref()
            .filter(|td| !td.is_empty())
            .unwrap_or(if self.config.trust_domain.is_empty() {
                DEFAULT_TRUST_DOMAIN
            } else {
                self.config.trust_domain.as_str()
            })
    }
}

fn dns_config(nameserver: &str, namespace: &str, trust_domain: &str) -> PodDNSConfig {
    let td = trust_domain.trim_matches('.');
    let ndots = td.split('.').filter(|l| !l.is_empty()).count() + 3;
    PodDNSConfig {
        nameservers: Some(vec![nameserver.to_string()]),
        searches: Some(vec![
            format!("{namespace}.svc.{td}"),
            format!("svc.{td}"),
            td.to_string(),
        ]),
        options: Some(vec![PodDNSConfigOption {
            name: Some("ndots".to_string()),
            value: Some(ndots.to_string()),
        }]),
    }
}

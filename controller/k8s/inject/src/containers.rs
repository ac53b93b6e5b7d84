//! Builders for the containers and volume added to injected workloads.

use crate::probes::{HealthProbes, ProbeKind};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, Lifecycle,
    LifecycleHandler, ObjectFieldSelector, ResourceRequirements, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use xmesh_controller_core::{
    iptables::RuleProgram, HEALTHCHECK_PORT, PROXY_ADMIN_PORT, PROXY_INBOUND_PORT,
    PROXY_PROMETHEUS_PORT, SIDECAR_UID,
};
use xmesh_controller_k8s_api::config::{MeshConfigSpec, RepoServerSpec};

pub const SIDECAR_CONTAINER: &str = "sidecar";
pub const INIT_CONTAINER: &str = "xmesh-init";
pub const HEALTHCHECK_CONTAINER: &str = "xmesh-healthcheck";

pub const BOOTSTRAP_VOLUME: &str = "sidecar-bootstrap-config-volume";
pub const BOOTSTRAP_MOUNT_PATH: &str = "/etc/pipy";
pub const BOOTSTRAP_SECRET_PREFIX: &str = "sidecar-bootstrap-config-";

const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

const HOLD_APPLICATION_SCRIPT: &str = r#"until [ $(curl -s -o /dev/null -I -w "%{http_code}" http://127.0.0.1:15000/config_dump) -eq 200 ]; do sleep 5; done;"#;
const GRACEFUL_EXIT_SCRIPT: &str = "kill -SIGTERM 1";

/// Inputs for the sidecar container that vary per workload.
#[derive(Clone, Debug)]
pub struct SidecarParams<'a> {
    pub image: String,
    pub mesh_name: &'a str,
    pub repo_url: String,
    pub resources: ResourceRequirements,
    pub probes: &'a HealthProbes,
    pub owner: Option<(String, String)>,
    pub hold_application: bool,
    pub graceful_exit: bool,
}

pub fn bootstrap_secret_name(uuid: &str) -> String {
    format!("{BOOTSTRAP_SECRET_PREFIX}{uuid}")
}

/// Recovers the proxy UUID from a bootstrap secret name.
pub fn uuid_from_secret_name(name: &str) -> Option<&str> {
    name.strip_prefix(BOOTSTRAP_SECRET_PREFIX)
        .filter(|uuid| !uuid.is_empty())
}

pub fn bootstrap_volume(secret_name: &str) -> Volume {
    Volume {
        name: BOOTSTRAP_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The init container that installs the interception rules.
pub fn init_container(
    image: String,
    program: &RuleProgram,
    privileged: bool,
    pull_policy: Option<&str>,
) -> Container {
    Container {
        name: INIT_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy.unwrap_or(DEFAULT_PULL_POLICY).to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            program.restore_script(),
        ]),
        env: Some(vec![field_env("POD_IP", "status.podIP")]),
        security_context: Some(SecurityContext {
            privileged: Some(privileged),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn healthcheck_container(
    image: String,
    resources: Option<ResourceRequirements>,
    pull_policy: Option<&str>,
) -> Container {
    Container {
        name: HEALTHCHECK_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy.unwrap_or(DEFAULT_PULL_POLICY).to_string()),
        command: Some(vec!["/xmesh-healthcheck".to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some("healthcheck".to_string()),
            container_port: HEALTHCHECK_PORT.into(),
            ..Default::default()
        }]),
        resources,
        ..Default::default()
    }
}

pub fn sidecar_container(
    params: SidecarParams<'_>,
    mesh: &MeshConfigSpec,
    pull_policy: Option<&str>,
) -> Container {
    let SidecarParams {
        image,
        mesh_name,
        repo_url,
        resources,
        probes,
        owner,
        hold_application,
        graceful_exit,
    } = params;

    let mut ports = vec![
        port("proxy-admin", PROXY_ADMIN_PORT),
        port("proxy-inbound", PROXY_INBOUND_PORT),
        port("proxy-metrics", PROXY_PROMETHEUS_PORT),
    ];
    for kind in ProbeKind::ALL {
        if probes.get(kind).is_some() {
            ports.push(port(kind.port_name(), kind.port()));
        }
    }

    let mut env = vec![
        EnvVar {
            name: "MESH_NAME".to_string(),
            value: Some(mesh_name.to_string()),
            ..Default::default()
        },
        field_env("POD_UID", "metadata.uid"),
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        field_env("POD_IP", "status.podIP"),
        field_env("SERVICE_ACCOUNT", "spec.serviceAccountName"),
    ];
    if let Some((kind, name)) = owner {
        env.push(EnvVar {
            name: "POD_CONTROLLER_KIND".to_string(),
            value: Some(kind),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "POD_CONTROLLER_NAME".to_string(),
            value: Some(name),
            ..Default::default()
        });
    }

    let lifecycle = (hold_application || graceful_exit).then(|| Lifecycle {
        post_start: hold_application.then(|| shell_hook(HOLD_APPLICATION_SCRIPT)),
        pre_stop: graceful_exit.then(|| shell_hook(GRACEFUL_EXIT_SCRIPT)),
        ..Default::default()
    });

    Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy.unwrap_or(DEFAULT_PULL_POLICY).to_string()),
        args: Some(vec![
            format!("--log-level={}", mesh.sidecar.log_level),
            format!("--admin-port={PROXY_ADMIN_PORT}"),
            repo_url,
        ]),
        ports: Some(ports),
        env: Some(env),
        resources: Some(resources),
        lifecycle,
        volume_mounts: Some(vec![VolumeMount {
            name: BOOTSTRAP_VOLUME.to_string(),
            mount_path: BOOTSTRAP_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_user: Some(SIDECAR_UID.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The URL the sidecar fetches its configuration from.
///
/// Loopback and empty repo addresses are replaced by the controller service's
/// in-cluster name.
pub fn repo_url(
    repo: &RepoServerSpec,
    port: u16,
    controller_service: &str,
    control_plane_namespace: &str,
    cn_prefix: &str,
) -> String {
    let host = match repo.ip_addr.as_str() {
        "" | "localhost" => format!("{controller_service}.{control_plane_namespace}"),
        ip if ip.starts_with("127.") => format!("{controller_service}.{control_plane_namespace}"),
        ip => ip.to_string(),
    };
    let codebase = repo.codebase.trim_matches('/');
    if codebase.is_empty() {
        format!("http://{host}:{port}/repo/xmesh-sidecar/{cn_prefix}/")
    } else {
        format!("http://{host}:{port}/repo/{codebase}/xmesh-sidecar/{cn_prefix}/")
    }
}

/// The controlling owner of a workload, reported as `(kind, name)`.
///
/// ReplicaSets are assumed to belong to a Deployment whose name is the
/// ReplicaSet's name without its final `-<hash>` segment.
pub fn controller_ref(owners: &[OwnerReference]) -> Option<(String, String)> {
    let owner = owners.iter().find(|o| o.controller == Some(true))?;
    if owner.kind == "ReplicaSet" {
        if let Some((deployment, _)) = owner.name.rsplit_once('-') {
            return Some(("Deployment".to_string(), deployment.to_string()));
        }
    }
    Some((owner.kind.clone(), owner.name.clone()))
}

fn port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port.into(),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn shell_hook(script: &str) -> LifecycleHandler {
    LifecycleHandler {
        exec: Some(ExecAction {
            command: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmesh_controller_core::iptables::{Exclusions, InterceptionMode, LocalProxyMode};

    fn owner(kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            controller: Some(controller),
            ..Default::default()
        }
    }

    #[test]
    fn replica_set_owner_is_deployment() {
        assert_eq!(
            controller_ref(&[owner("ReplicaSet", "web-7d9c8f6b4", true)]),
            Some(("Deployment".to_string(), "web".to_string()))
        );
        assert_eq!(
            controller_ref(&[
                owner("Node", "n1", false),
                owner("StatefulSet", "db", true)
            ]),
            Some(("StatefulSet".to_string(), "db".to_string()))
        );
        assert_eq!(controller_ref(&[]), None);
    }

    #[test]
    fn repo_url_host() {
        let mut repo = RepoServerSpec::default();
        assert_eq!(
            repo_url(&repo, 6060, "xmesh-controller", "xmesh-system", "u.sidecar.sa.ns"),
            "http://xmesh-controller.xmesh-system:6060/repo/xmesh-sidecar/u.sidecar.sa.ns/"
        );

        repo.ip_addr = "127.0.0.1".to_string();
        assert!(repo_url(&repo, 6060, "c", "ns", "cn").starts_with("http://c.ns:6060/"));

        repo.ip_addr = "10.0.0.5".to_string();
        repo.codebase = "/mesh/".to_string();
        assert_eq!(
            repo_url(&repo, 6060, "c", "ns", "cn"),
            "http://10.0.0.5:6060/repo/mesh/xmesh-sidecar/cn/"
        );
    }

    #[test]
    fn secret_name_round_trip() {
        let name = bootstrap_secret_name("abc");
        assert_eq!(name, "sidecar-bootstrap-config-abc");
        assert_eq!(uuid_from_secret_name(&name), Some("abc"));
        assert_eq!(uuid_from_secret_name("sidecar-bootstrap-config-"), None);
        assert_eq!(uuid_from_secret_name("other"), None);
    }

    #[test]
    fn init_container_runs_rules() {
        let program = RuleProgram::new(
            InterceptionMode::PodLevel,
            LocalProxyMode::Localhost,
            Exclusions::default(),
        );
        let c = init_container("xmesh/init:1".to_string(), &program, true, None);
        let command = c.command.unwrap();
        assert_eq!(command[..2], ["/bin/sh".to_string(), "-c".to_string()]);
        assert!(command[2].contains("-A OUT -j OUT_REDIRECT"));
        let sc = c.security_context.unwrap();
        assert_eq!(sc.privileged, Some(true));
        assert_eq!(sc.run_as_user, Some(0));
        assert_eq!(
            sc.capabilities.unwrap().add,
            Some(vec!["NET_ADMIN".to_string()])
        );
        assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
    }

    #[test]
    fn sidecar_lifecycle_and_ports() {
        let probes = HealthProbes {
            readiness: Some(Default::default()),
            ..Default::default()
        };
        let mesh = MeshConfigSpec::default();
        let c = sidecar_container(
            SidecarParams {
                image: "xmesh/sidecar:1".to_string(),
                mesh_name: "xmesh",
                repo_url: "http://repo/".to_string(),
                resources: Default::default(),
                probes: &probes,
                owner: None,
                hold_application: true,
                graceful_exit: false,
            },
            &mesh,
            Some("Always"),
        );

        let names = c
            .ports
            .unwrap()
            .into_iter()
            .filter_map(|p| p.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            ["proxy-admin", "proxy-inbound", "proxy-metrics", "readiness-port"]
        );
        let lifecycle = c.lifecycle.unwrap();
        assert!(lifecycle.post_start.is_some());
        assert!(lifecycle.pre_stop.is_none());
        assert_eq!(c.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            c.args.unwrap(),
            ["--log-level=error", "--admin-port=15000", "http://repo/"]
        );
        assert_eq!(c.security_context.unwrap().run_as_user, Some(1500));
    }
}

//! Rewrites workload health probes so they terminate at the sidecar.
//!
//! The original target travels in request headers so the sidecar can
//! dispatch the check to the application.

use k8s_openapi::{
    api::core::v1::{Container, HTTPGetAction, HTTPHeader, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use xmesh_controller_core::{
    HEALTHCHECK_PORT, HEALTH_PATH, LIVENESS_PROBE_PORT, READINESS_PROBE_PORT, STARTUP_PROBE_PORT,
};

pub const ORIGINAL_HTTP_PORT: &str = "Original-Http-Port";
pub const ORIGINAL_HTTP_PATH: &str = "Original-Http-Path";
pub const ORIGINAL_TCP_PORT: &str = "Original-Tcp-Port";

const DEFAULT_HTTP_PORT: i32 = 80;
const DEFAULT_HTTPS_PORT: i32 = 443;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    Liveness,
    Readiness,
    Startup,
}

/// What a rewritten probe originally looked like.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    pub path: String,
    pub port: i32,
    pub is_http: bool,
    #[serde(default)]
    pub is_tcp_socket: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

/// The probes found across all of a workload's containers. When several
/// containers declare the same kind of probe, the last one wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<HealthProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<HealthProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<HealthProbe>,
}

// === impl ProbeKind ===

impl ProbeKind {
    pub const ALL: [Self; 3] = [Self::Liveness, Self::Readiness, Self::Startup];

    /// The sidecar port that serves rewritten probes of this kind.
    pub fn port(self) -> u16 {
        match self {
            Self::Liveness => LIVENESS_PROBE_PORT,
            Self::Readiness => READINESS_PROBE_PORT,
            Self::Startup => STARTUP_PROBE_PORT,
        }
    }

    /// The sidecar container port name for this kind.
    pub fn port_name(self) -> &'static str {
        match self {
            Self::Liveness => "liveness-port",
            Self::Readiness => "readiness-port",
            Self::Startup => "startup-port",
        }
    }

    fn probe_mut(self, container: &mut Container) -> Option<&mut Probe> {
        match self {
            Self::Liveness => container.liveness_probe.as_mut(),
            Self::Readiness => container.readiness_probe.as_mut(),
            Self::Startup => container.startup_probe.as_mut(),
        }
    }
}

// === impl HealthProbes ===

impl HealthProbes {
    pub fn get(&self, kind: ProbeKind) -> Option<&HealthProbe> {
        match kind {
            ProbeKind::Liveness => self.liveness.as_ref(),
            ProbeKind::Readiness => self.readiness.as_ref(),
            ProbeKind::Startup => self.startup.as_ref(),
        }
    }

    fn set(&mut self, kind: ProbeKind, probe: HealthProbe) {
        let slot = match kind {
            ProbeKind::Liveness => &mut self.liveness,
            ProbeKind::Readiness => &mut self.readiness,
            ProbeKind::Startup => &mut self.startup,
        };
        *slot = Some(probe);
    }

    /// A dedicated health-check container is needed only when a probe was
    /// originally a raw TCP connect.
    pub fn uses_tcp(&self) -> bool {
        ProbeKind::ALL
            .into_iter()
            .filter_map(|k| self.get(k))
            .any(|p| p.is_tcp_socket)
    }

    pub fn is_empty(&self) -> bool {
        ProbeKind::ALL.into_iter().all(|k| self.get(k).is_none())
    }
}

/// Rewrites the probes of every container in place and returns a summary of
/// the original probes.
pub fn rewrite(containers: &mut [Container]) -> HealthProbes {
    let mut probes = HealthProbes::default();
    for container in containers.iter_mut() {
        let declared = container.ports.clone().unwrap_or_default();
        for kind in ProbeKind::ALL {
            let name = container.name.clone();
            if let Some(probe) = kind.probe_mut(container) {
                if let Some(original) = rewrite_probe(kind, probe, &name, &declared) {
                    probes.set(kind, original);
                }
            }
        }
    }
    probes
}

fn rewrite_probe(
    kind: ProbeKind,
    probe: &mut Probe,
    container: &str,
    declared: &[k8s_openapi::api::core::v1::ContainerPort],
) -> Option<HealthProbe> {
    if let Some(get) = probe.http_get.as_mut() {
        let https = get
            .scheme
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("HTTPS"));
        let default = if https {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        let port = resolve_port(&get.port, declared, default, container);
        let path = get
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let headers = get.http_headers.get_or_insert_with(Vec::new);
        if https {
            get.scheme = Some("HTTP".to_string());
            headers.push(header(ORIGINAL_TCP_PORT, port));
        } else {
            headers.push(header(ORIGINAL_HTTP_PORT, port));
            headers.push(header(ORIGINAL_HTTP_PATH, &path));
        }
        get.path = Some(HEALTH_PATH.to_string());
        get.port = IntOrString::Int(kind.port().into());

        return Some(HealthProbe {
            path,
            port,
            is_http: !https,
            is_tcp_socket: false,
            timeout_seconds: probe.timeout_seconds,
        });
    }

    if let Some(tcp) = probe.tcp_socket.take() {
        // A raw TCP probe has no scheme default; an unresolved name stays 0.
        let port = resolve_port(&tcp.port, declared, 0, container);
        probe.http_get = Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(HEALTHCHECK_PORT.into()),
            http_headers: Some(vec![header(ORIGINAL_TCP_PORT, port)]),
            ..Default::default()
        });
        return Some(HealthProbe {
            path: String::new(),
            port,
            is_http: false,
            is_tcp_socket: true,
            timeout_seconds: probe.timeout_seconds,
        });
    }

    None
}

/// Resolves a probe port against the container's declared ports.
fn resolve_port(
    port: &IntOrString,
    declared: &[k8s_openapi::api::core::v1::ContainerPort],
    default: i32,
    container: &str,
) -> i32 {
    match port {
        IntOrString::Int(p) => *p,
        IntOrString::String(s) => {
            if let Ok(p) = s.parse::<i32>() {
                return p;
            }
            match declared
                .iter()
                .find(|p| p.name.as_deref() == Some(s.as_str()))
            {
                Some(p) => p.container_port,
                None => {
                    warn!(%container, port = %s, default, "Probe references an undeclared named port");
                    default
                }
            }
        }
    }
}

fn header(name: &str, value: impl ToString) -> HTTPHeader {
    HTTPHeader {
        name: name.to_string(),
        value: value.to_string(),
    }
}

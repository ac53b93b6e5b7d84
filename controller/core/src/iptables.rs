//! Synthesizes the `nat` table program that an injected pod's init container
//! applies to redirect TCP traffic through the sidecar.

use crate::{
    IpNet, LIVENESS_PROBE_PORT, PROXY_ADMIN_PORT, PROXY_INBOUND_PORT, PROXY_OUTBOUND_PORT,
    PROXY_PROMETHEUS_PORT, READINESS_PROBE_PORT, SIDECAR_UID, STARTUP_PROBE_PORT,
    HEALTHCHECK_PORT,
};
use anyhow::{anyhow, Error, Result};
use std::{fmt, num::NonZeroU16};

const INBOUND: &str = "IN";
const INBOUND_REDIRECT: &str = "IN_REDIRECT";
const OUTBOUND: &str = "OUT";
const OUTBOUND_REDIRECT: &str = "OUT_REDIRECT";

const LOOPBACK: &str = "127.0.0.1/32";

/// Where traffic interception happens.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum InterceptionMode {
    /// Each pod's init container installs its own rules.
    #[default]
    PodLevel,
    /// Interception is handled on the node; pods get no rules.
    NodeLevel,
}

/// The address the sidecar uses to reach the application.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LocalProxyMode {
    #[default]
    Localhost,
    /// Loopback traffic from the sidecar is DNAT'd to the pod IP, which must
    /// be exported to the init container as `POD_IP`.
    PodIp,
}

/// The merged exclusion and inclusion lists for a single pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub outbound_ip_ranges: Vec<IpNet>,
    pub outbound_ip_range_inclusions: Vec<IpNet>,
    pub outbound_ports: Vec<NonZeroU16>,
    pub inbound_ports: Vec<NonZeroU16>,
    pub network_interfaces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleProgram {
    mode: InterceptionMode,
    proxy_mode: LocalProxyMode,
    dns_proxy: bool,
    exclusions: Exclusions,
}

// === impl InterceptionMode ===

impl std::str::FromStr for InterceptionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PodLevel" | "pod-level" | "iptables" => Ok(Self::PodLevel),
            "NodeLevel" | "node-level" | "ebpf" => Ok(Self::NodeLevel),
            s => Err(anyhow!("invalid interception mode: {}", s)),
        }
    }
}

impl fmt::Display for InterceptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PodLevel => "PodLevel".fmt(f),
            Self::NodeLevel => "NodeLevel".fmt(f),
        }
    }
}

// === impl LocalProxyMode ===

impl std::str::FromStr for LocalProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Localhost" => Ok(Self::Localhost),
            "PodIP" | "PodIp" => Ok(Self::PodIp),
            s => Err(anyhow!("invalid local proxy mode: {}", s)),
        }
    }
}

impl fmt::Display for LocalProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Localhost => "Localhost".fmt(f),
            Self::PodIp => "PodIP".fmt(f),
        }
    }
}

// === impl RuleProgram ===

impl RuleProgram {
    pub fn new(mode: InterceptionMode, proxy_mode: LocalProxyMode, exclusions: Exclusions) -> Self {
        Self {
            mode,
            proxy_mode,
            dns_proxy: false,
            exclusions,
        }
    }

    /// Records whether the local DNS proxy is enabled.
    ///
    /// DNS traffic is currently redirected by the node data path, so this
    /// does not contribute any rules.
    pub fn with_dns_proxy(mut self, enabled: bool) -> Self {
        self.dns_proxy = enabled;
        self
    }

    pub fn mode(&self) -> InterceptionMode {
        self.mode
    }

    pub fn dns_proxy(&self) -> bool {
        self.dns_proxy
    }

    /// Returns the ordered rules, without the table preamble.
    pub fn rules(&self) -> Vec<String> {
        if self.mode == InterceptionMode::NodeLevel {
            return Vec::new();
        }

        let Exclusions {
            outbound_ip_ranges,
            outbound_ip_range_inclusions,
            outbound_ports,
            inbound_ports,
            network_interfaces,
        } = &self.exclusions;

        let mut rules = inbound_rules();

        // Inserted at the head of the inbound chain so that they are evaluated
        // before the redirect.
        for iface in network_interfaces {
            rules.push(format!("-I {INBOUND} -i {iface} -j RETURN"));
        }
        if !inbound_ports.is_empty() {
            rules.push(format!(
                "-I {INBOUND} -p tcp --match multiport --dports {} -j RETURN",
                join_ports(inbound_ports)
            ));
        }

        rules.extend(outbound_rules());

        if self.proxy_mode == LocalProxyMode::PodIp {
            rules.push(format!(
                "-I OUTPUT -p tcp -o lo -d {LOOPBACK} -m owner --uid-owner {SIDECAR_UID} -j DNAT --to-destination $POD_IP"
            ));
        }

        for iface in network_interfaces {
            rules.push(format!("-A {OUTBOUND} -o {iface} -j RETURN"));
        }
        for net in outbound_ip_ranges {
            rules.push(format!("-A {OUTBOUND} -d {net} -j RETURN"));
        }
        if !outbound_ports.is_empty() {
            rules.push(format!(
                "-A {OUTBOUND} -p tcp --match multiport --dports {} -j RETURN",
                join_ports(outbound_ports)
            ));
        }

        if outbound_ip_range_inclusions.is_empty() {
            rules.push(format!("-A {OUTBOUND} -j {OUTBOUND_REDIRECT}"));
        } else {
            for net in outbound_ip_range_inclusions {
                rules.push(format!("-A {OUTBOUND} -d {net} -j {OUTBOUND_REDIRECT}"));
            }
            rules.push(format!("-A {OUTBOUND} -j RETURN"));
        }

        rules
    }

    /// Renders the program in `iptables-restore` format. Node-level
    /// interception renders nothing.
    pub fn render(&self) -> String {
        if self.mode == InterceptionMode::NodeLevel {
            return String::new();
        }

        let mut out = String::from("# xmesh sidecar interception rules\n*nat\n");
        for chain in [INBOUND, INBOUND_REDIRECT, OUTBOUND, OUTBOUND_REDIRECT] {
            out.push_str(&format!(":{chain} - [0:0]\n"));
        }
        for rule in self.rules() {
            out.push_str(&rule);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out
    }

    /// Wraps the rendered program in a shell script that applies it
    /// atomically. The heredoc is unquoted so that `$POD_IP` expands.
    pub fn restore_script(&self) -> String {
        format!("iptables-restore --noflush <<EOF\n{}EOF\n", self.render())
    }
}

fn inbound_rules() -> Vec<String> {
    let mut rules = vec![
        format!("-A {INBOUND_REDIRECT} -p tcp -j REDIRECT --to-port {PROXY_INBOUND_PORT}"),
        format!("-A PREROUTING -p tcp -j {INBOUND}"),
    ];
    for port in [
        PROXY_PROMETHEUS_PORT,
        LIVENESS_PROBE_PORT,
        READINESS_PROBE_PORT,
        STARTUP_PROBE_PORT,
        HEALTHCHECK_PORT,
    ] {
        rules.push(format!("-A {INBOUND} -p tcp --dport {port} -j RETURN"));
    }
    rules.push(format!("-A {INBOUND} -p tcp -j {INBOUND_REDIRECT}"));
    rules
}

fn outbound_rules() -> Vec<String> {
    vec![
        format!("-A {OUTBOUND_REDIRECT} -p tcp -j REDIRECT --to-port {PROXY_OUTBOUND_PORT}"),
        format!("-A {OUTBOUND_REDIRECT} -p tcp --dport {PROXY_ADMIN_PORT} -j ACCEPT"),
        format!("-A OUTPUT -p tcp -j {OUTBOUND}"),
        // Hairpin: the sidecar talking to the pod's own non-loopback address
        // over lo is treated as inbound.
        format!(
            "-A {OUTBOUND} -o lo ! -d {LOOPBACK} -m owner --uid-owner {SIDECAR_UID} -j {INBOUND_REDIRECT}"
        ),
        format!("-A {OUTBOUND} -o lo -m owner ! --uid-owner {SIDECAR_UID} -j RETURN"),
        format!("-A {OUTBOUND} -m owner --uid-owner {SIDECAR_UID} -j RETURN"),
        format!("-A {OUTBOUND} -d {LOOPBACK} -j RETURN"),
    ]
}

fn join_ports(ports: &[NonZeroU16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn port(p: u16) -> NonZeroU16 {
        NonZeroU16::new(p).unwrap()
    }

    fn position(rules: &[String], rule: &str) -> usize {
        rules
            .iter()
            .position(|r| r == rule)
            .unwrap_or_else(|| panic!("missing rule: {rule}"))
    }

    #[test]
    fn default_program_redirects_all_outbound() {
        let rules =
            RuleProgram::new(Default::default(), Default::default(), Default::default()).rules();
        assert_eq!(rules.last().unwrap(), "-A OUT -j OUT_REDIRECT");
        assert!(rules.contains(&"-A IN -p tcp --dport 15010 -j RETURN".to_string()));
        assert!(rules.contains(&"-A OUT -m owner --uid-owner 1500 -j RETURN".to_string()));
        assert!(!rules.iter().any(|r| r.contains("DNAT")));
    }

    #[test]
    fn inclusions_fall_through() {
        let exclusions = Exclusions {
            outbound_ip_range_inclusions: vec!["10.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        let rules =
            RuleProgram::new(InterceptionMode::PodLevel, LocalProxyMode::Localhost, exclusions)
                .rules();
        let n = rules.len();
        assert_eq!(
            rules[n - 2..],
            [
                "-A OUT -d 10.0.0.0/8 -j OUT_REDIRECT".to_string(),
                "-A OUT -j RETURN".to_string(),
            ]
        );
        assert!(!rules.contains(&"-A OUT -j OUT_REDIRECT".to_string()));
    }

    #[test]
    fn excludes_precede_redirects() {
        let exclusions = Exclusions {
            outbound_ip_ranges: vec!["169.254.169.254/32".parse().unwrap()],
            outbound_ports: vec![port(3306), port(6379)],
            inbound_ports: vec![port(8443)],
            network_interfaces: vec!["eth1".to_string()],
            ..Default::default()
        };
        let rules =
            RuleProgram::new(InterceptionMode::PodLevel, LocalProxyMode::Localhost, exclusions)
                .rules();

        let redirect = position(&rules, "-A OUT -j OUT_REDIRECT");
        for rule in [
            "-A OUT -o eth1 -j RETURN",
            "-A OUT -d 169.254.169.254/32 -j RETURN",
            "-A OUT -p tcp --match multiport --dports 3306,6379 -j RETURN",
        ] {
            assert!(position(&rules, rule) < redirect, "{rule}");
        }

        // Outbound excludes are appended in interface, range, port order.
        assert!(
            position(&rules, "-A OUT -o eth1 -j RETURN")
                < position(&rules, "-A OUT -d 169.254.169.254/32 -j RETURN")
        );

        // Inbound excludes are inserted at the head of the chain, interfaces
        // first, so the port rule ends up evaluated first.
        assert!(
            position(&rules, "-I IN -i eth1 -j RETURN")
                < position(
                    &rules,
                    "-I IN -p tcp --match multiport --dports 8443 -j RETURN"
                )
        );
    }

    #[test]
    fn pod_ip_mode_adds_hairpin_dnat() {
        let program =
            RuleProgram::new(InterceptionMode::PodLevel, LocalProxyMode::PodIp, Default::default());
        let rules = program.rules();
        let dnat = position(
            &rules,
            "-I OUTPUT -p tcp -o lo -d 127.0.0.1/32 -m owner --uid-owner 1500 -j DNAT --to-destination $POD_IP",
        );
        assert!(dnat > position(&rules, "-A OUT -d 127.0.0.1/32 -j RETURN"));
    }

    #[test]
    fn node_level_is_empty() {
        let program = RuleProgram::new(
            InterceptionMode::NodeLevel,
            LocalProxyMode::PodIp,
            Exclusions {
                inbound_ports: vec![port(80)],
                ..Default::default()
            },
        );
        assert!(program.rules().is_empty());
        assert_eq!(program.render(), "");
    }

    #[test]
    fn render_declares_chains_and_commits() {
        let program =
            RuleProgram::new(Default::default(), Default::default(), Default::default());
        let text = program.render();
        assert!(text.starts_with(
            "# xmesh sidecar interception rules\n*nat\n:IN - [0:0]\n:IN_REDIRECT - [0:0]\n:OUT - [0:0]\n:OUT_REDIRECT - [0:0]\n"
        ));
        assert!(text.ends_with("-A OUT -j OUT_REDIRECT\nCOMMIT\n"));

        let script = program.restore_script();
        assert!(script.starts_with("iptables-restore --noflush <<EOF\n# xmesh"));
        assert!(script.ends_with("COMMIT\nEOF\n"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let exclusions = Exclusions {
            outbound_ports: vec![port(9000)],
            ..Default::default()
        };
        let a = RuleProgram::new(Default::default(), Default::default(), exclusions.clone());
        let b = RuleProgram::new(Default::default(), Default::default(), exclusions);
        assert_eq!(a.render(), b.render());
    }

    #[rstest]
    #[case("PodLevel", InterceptionMode::PodLevel)]
    #[case("pod-level", InterceptionMode::PodLevel)]
    #[case("iptables", InterceptionMode::PodLevel)]
    #[case("NodeLevel", InterceptionMode::NodeLevel)]
    #[case("ebpf", InterceptionMode::NodeLevel)]
    fn parses_interception_modes(#[case] input: &str, #[case] mode: InterceptionMode) {
        assert_eq!(input.parse::<InterceptionMode>().unwrap(), mode);
    }

    #[test]
    fn rejects_unknown_modes() {
        assert_eq!("PodIP".parse::<LocalProxyMode>().unwrap(), LocalProxyMode::PodIp);
        assert!("sideways".parse::<InterceptionMode>().is_err());
        assert!("sideways".parse::<LocalProxyMode>().is_err());
    }
}

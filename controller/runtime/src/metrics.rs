use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    requests: Family<RequestLabels, Counter>,
    errors: Family<KindLabels, Counter>,
    certificates: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct StatusMetrics {
    updates: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct DataPathMetrics {
    nat: Family<OpLabels, Counter>,
    acl: Family<OpLabels, Counter>,
    advertisements: Family<FamilyLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct BroadcastMetrics {
    jobs: Family<PhaseLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    kind: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OpLabels {
    op: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct FamilyLabels {
    family: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PhaseLabels {
    phase: &'static str,
    result: &'static str,
}

fn result(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "admission_requests",
            "Total number of admission reviews handled, by workload kind and outcome",
            requests.clone(),
        );

        let errors = Family::<KindLabels, Counter>::default();
        reg.register(
            "admission_errors",
            "Total number of admission reviews denied, by error kind",
            errors.clone(),
        );

        let certificates = Counter::default();
        reg.register(
            "certificates_issued",
            "Total number of bootstrap certificates issued",
            certificates.clone(),
        );

        Self {
            requests,
            errors,
            certificates,
        }
    }

    /// `outcome` is one of `injected`, `skipped` or `denied`.
    pub fn request(&self, kind: &'static str, outcome: &'static str) {
        self.requests
            .get_or_create(&RequestLabels { kind, outcome })
            .inc();
    }

    pub fn error(&self, kind: &'static str) {
        self.errors.get_or_create(&KindLabels { kind }).inc();
    }

    pub fn certificate_issued(&self) {
        self.certificates.inc();
    }

    #[cfg(test)]
    pub fn requests(&self, kind: &'static str, outcome: &'static str) -> u64 {
        self.requests
            .get_or_create(&RequestLabels { kind, outcome })
            .get()
    }

    #[cfg(test)]
    pub fn errors(&self, kind: &'static str) -> u64 {
        self.errors.get_or_create(&KindLabels { kind }).get()
    }

    #[cfg(test)]
    pub fn certificates(&self) -> u64 {
        self.certificates.get()
    }
}

// === impl StatusMetrics ===

impl StatusMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let updates = Family::<ResultLabels, Counter>::default();
        reg.register(
            "planner_status_updates",
            "Total number of EIPAdvertisement status patches, by result",
            updates.clone(),
        );
        Self { updates }
    }

    /// `result` is one of `ok`, `error` or `timeout`.
    pub fn update(&self, result: &'static str) {
        self.updates.get_or_create(&ResultLabels { result }).inc();
    }

    #[cfg(test)]
    pub fn updates(&self, result: &'static str) -> u64 {
        self.updates.get_or_create(&ResultLabels { result }).get()
    }
}

// === impl DataPathMetrics ===

impl DataPathMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let nat = Family::<OpLabels, Counter>::default();
        reg.register(
            "nat_operations",
            "Total number of NAT map operations, by operation and result",
            nat.clone(),
        );

        let acl = Family::<OpLabels, Counter>::default();
        reg.register(
            "acl_operations",
            "Total number of ACL map batches, by operation and result",
            acl.clone(),
        );

        let advertisements = Family::<FamilyLabels, Counter>::default();
        reg.register(
            "gratuitous_advertisements",
            "Total number of gratuitous ARP and unsolicited NA frames sent",
            advertisements.clone(),
        );

        Self {
            nat,
            acl,
            advertisements,
        }
    }

    pub fn nat(&self, op: &'static str, ok: bool) {
        self.nat
            .get_or_create(&OpLabels {
                op,
                result: result(ok),
            })
            .inc();
    }

    pub fn acl(&self, op: &'static str, ok: bool) {
        self.acl
            .get_or_create(&OpLabels {
                op,
                result: result(ok),
            })
            .inc();
    }

    pub fn advertised(&self, addr: std::net::IpAddr) {
        let family = if addr.is_ipv4() { "ipv4" } else { "ipv6" };
        self.advertisements
            .get_or_create(&FamilyLabels { family })
            .inc();
    }

    #[cfg(test)]
    pub fn nat_ops(&self, op: &'static str, ok: bool) -> u64 {
        self.nat
            .get_or_create(&OpLabels {
                op,
                result: result(ok),
            })
            .get()
    }

    #[cfg(test)]
    pub fn acl_ops(&self, op: &'static str, ok: bool) -> u64 {
        self.acl
            .get_or_create(&OpLabels {
                op,
                result: result(ok),
            })
            .get()
    }
}

// === impl BroadcastMetrics ===

impl BroadcastMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let jobs = Family::<PhaseLabels, Counter>::default();
        reg.register(
            "broadcast_jobs",
            "Total number of reconciliation jobs run, by phase and result",
            jobs.clone(),
        );
        Self { jobs }
    }

    /// `result` is one of `ok`, `error` or `skipped`.
    pub fn job(&self, phase: &'static str, result: &'static str) {
        self.jobs
            .get_or_create(&PhaseLabels { phase, result })
            .inc();
    }

    #[cfg(test)]
    pub fn jobs(&self, phase: &'static str, result: &'static str) -> u64 {
        self.jobs.get_or_create(&PhaseLabels { phase, result }).get()
    }
}

//! The node event loop.
//!
//! Three tickers and the index change notification decide when a phase
//! should run. The loop only submits jobs; jobs run on a bounded pool of
//! workers and a phase never runs twice concurrently. A tick that finds its
//! phase still running is skipped.

use crate::{
    acl::AclSync,
    applier::Applier,
    dns::DnsSync,
    index::SharedIndex,
    metrics::BroadcastMetrics,
    scheduler::Scheduler,
    xnet::{AclKey, AclVal, KernelMap},
};
use anyhow::Result;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, Semaphore},
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument};

/// One reconciliation phase, run end-to-end by a single job.
#[async_trait::async_trait]
pub trait Phase: Send + Sync + 'static {
    async fn run(&self) -> Result<()>;
}

#[derive(Copy, Clone, Debug)]
pub struct Intervals {
    pub mesh_config: Duration,
    pub e4lb: Duration,
    pub eip: Duration,
}

pub struct Broadcast {
    index: SharedIndex,
    intervals: Intervals,
    workers: Arc<Semaphore>,
    metrics: BroadcastMetrics,
    mesh_config: Job,
    e4lb: Job,
    eip: Job,
}

#[derive(Clone)]
struct Job {
    name: &'static str,
    phase: Arc<dyn Phase>,
    running: Arc<Mutex<()>>,
}

/// Plans (on the leader), then converges the NAT map, the neighbor table
/// and the ACL map.
pub struct E4lbPhase<M> {
    pub scheduler: Scheduler,
    pub applier: Arc<Applier>,
    pub acl: AclSync<M>,
}

/// Re-announces owned EIPs.
pub struct EipPhase(pub Arc<Applier>);

// === impl Broadcast ===

impl Broadcast {
    pub fn new(
        index: SharedIndex,
        intervals: Intervals,
        workers: usize,
        metrics: BroadcastMetrics,
        mesh_config: Arc<dyn Phase>,
        e4lb: Arc<dyn Phase>,
        eip: Arc<dyn Phase>,
    ) -> Self {
        Self {
            index,
            intervals,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            metrics,
            mesh_config: Job::new("mesh-config", mesh_config),
            e4lb: Job::new("e4lb", e4lb),
            eip: Job::new("eip", eip),
        }
    }

    /// Runs until shutdown is signaled. In-flight jobs observe the same
    /// signal and stop between phases.
    pub async fn run(self, drain: drain::Watch) {
        let mut mesh_config = interval(self.intervals.mesh_config);
        let mut e4lb = interval(self.intervals.e4lb);
        let mut eip = interval(self.intervals.eip);
        let changed = self.index.read().changed();

        tokio::pin! {
            let shutdown = drain.clone().signaled();
        }

        info!(intervals = ?self.intervals, "Broadcast loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Broadcast loop stopped");
                    return;
                }
                _ = mesh_config.tick() => self.submit(&self.mesh_config, &drain),
                _ = e4lb.tick() => self.submit(&self.e4lb, &drain),
                _ = eip.tick() => self.submit(&self.eip, &drain),
                _ = changed.notified() => {
                    debug!("Cluster state changed");
                    self.submit(&self.mesh_config, &drain);
                    self.submit(&self.e4lb, &drain);
                }
            }
        }
    }

    fn submit(&self, job: &Job, drain: &drain::Watch) {
        let Ok(running) = job.running.clone().try_lock_owned() else {
            debug!(phase = job.name, "Phase still running; skipping");
            self.metrics.job(job.name, "skipped");
            return;
        };

        let Job { name, phase, .. } = job.clone();
        let workers = self.workers.clone();
        let metrics = self.metrics.clone();
        let shutdown = drain.clone().signaled();
        tokio::spawn(
            async move {
                let _running = running;
                let Ok(_permit) = workers.acquire_owned().await else {
                    return;
                };
                tokio::select! {
                    res = phase.run() => match res {
                        Ok(()) => metrics.job(name, "ok"),
                        Err(error) => {
                            warn!(%error, "Phase failed");
                            metrics.job(name, "error");
                        }
                    },
                    _ = shutdown => debug!("Aborted by shutdown"),
                }
            }
            .instrument(info_span!("broadcast", phase = name)),
        );
    }
}

fn interval(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

// === impl Job ===

impl Job {
    fn new(name: &'static str, phase: Arc<dyn Phase>) -> Self {
        Self {
            name,
            phase,
            running: Arc::new(Mutex::new(())),
        }
    }
}

// === impl Phases ===

#[async_trait::async_trait]
impl Phase for DnsSync {
    async fn run(&self) -> Result<()> {
        self.reconcile()
    }
}

#[async_trait::async_trait]
impl<M> Phase for E4lbPhase<M>
where
    M: KernelMap<AclKey, AclVal> + 'static,
{
    async fn run(&self) -> Result<()> {
        let queued = self.scheduler.schedule();
        if queued > 0 {
            debug!(queued, "Queued status updates");
        }
        let applied = self.applier.reconcile().await;
        // The ACL map is independent of the NAT map, so it converges even
        // when the applier could not.
        let acl = self.acl.reconcile();
        applied.and(acl)
    }
}

#[async_trait::async_trait]
impl Phase for EipPhase {
    async fn run(&self) -> Result<()> {
        self.0.advertise().await
    }
}

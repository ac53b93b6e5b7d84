//! Runs the EIP planner on the lease holder and queues status updates for
//! advertisements whose assignment changed.

use crate::{
    core::planner,
    index::{ResourceId, SharedIndex},
    status::{announce_patch, Update},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

pub struct Scheduler {
    index: SharedIndex,
    hostname: String,
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    updates: mpsc::Sender<Update>,
}

impl Scheduler {
    pub fn new(
        index: SharedIndex,
        hostname: impl ToString,
        claims: watch::Receiver<Arc<kubert::lease::Claim>>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        Self {
            index,
            hostname: hostname.to_string(),
            claims,
            updates,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }

    /// Computes a plan and queues a patch for every advertisement whose
    /// assignment differs from its persisted status. Returns the number of
    /// queued updates. Followers never write.
    pub fn schedule(&self) -> usize {
        if !self.is_leader() {
            trace!("Not the leader; skipping planning");
            return 0;
        }

        let (advertisements, eligible) = {
            let index = self.index.read();
            (index.advertisements(), index.eligible_nodes())
        };
        let plan = planner::plan(&advertisements, &eligible);

        let mut queued = 0;
        for assignment in plan.assignments.iter().filter(|a| a.changed) {
            let current = advertisements
                .iter()
                .find(|adv| adv.namespace == assignment.namespace && adv.name == assignment.name)
                .map(|adv| adv.announce.clone())
                .unwrap_or_default();
            let id = ResourceId::new(&assignment.namespace, &assignment.name);
            debug!(advertisement = %id, announce = ?assignment.announce, "Assignment changed");
            let update = Update {
                id,
                patch: announce_patch(&current, &assignment.announce),
            };
            match self.updates.try_send(update) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(update)) => {
                    warn!(advertisement = %update.id, "Status update queue full");
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Status controller stopped");
                    break;
                }
            }
        }
        queued
    }
}

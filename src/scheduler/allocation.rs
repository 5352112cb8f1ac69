//! Overflow allocation
//!
//! After every job has received up to its `max_agents`, leftover idle agents
//! are spread across the equal-priority jobs that still have undispatched
//! work. FIFO hands everything to the oldest job; round-robin deals agents
//! out one at a time in created-at order. Either way an agent falls through
//! to the next job when the preferred one cannot use it.

use crate::config::OverflowMode;
use crate::types::JobId;

/// Rotation over one equal-priority group of jobs (created-at order).
#[derive(Debug)]
pub struct OverflowRotation {
    mode: OverflowMode,
    order: Vec<JobId>,
    next: usize,
}

impl OverflowRotation {
    pub fn new(mode: OverflowMode, jobs_in_created_order: Vec<JobId>) -> Self {
        Self {
            mode,
            order: jobs_in_created_order,
            next: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Jobs in the order the next leftover agent should try them.
    pub fn try_order(&self) -> Vec<JobId> {
        match self.mode {
            OverflowMode::Fifo => self.order.clone(),
            OverflowMode::RoundRobin => {
                let cursor = if self.next < self.order.len() { self.next } else { 0 };
                let mut order = Vec::with_capacity(self.order.len());
                order.extend_from_slice(&self.order[cursor..]);
                order.extend_from_slice(&self.order[..cursor]);
                order
            }
        }
    }

    /// Record a successful hand-out so round-robin moves on to the next job.
    pub fn note_assigned(&mut self, job_id: JobId) {
        if self.mode == OverflowMode::RoundRobin {
            if let Some(pos) = self.order.iter().position(|j| *j == job_id) {
                self.next = (pos + 1) % self.order.len().max(1);
            }
        }
    }

    /// Drop a job whose keyspace ran dry.
    pub fn remove(&mut self, job_id: JobId) {
        if let Some(pos) = self.order.iter().position(|j| *j == job_id) {
            self.order.remove(pos);
            if pos < self.next {
                self.next -= 1;
            }
            if self.next >= self.order.len() {
                self.next = 0;
            }
        }
    }
}

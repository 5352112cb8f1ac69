//! Progress reconciler
//!
//! Periodically rebuilds every job's processed/dispatched aggregates from
//! task ground truth. This is the sole writer of those aggregates — the
//! scheduler and transport never touch them, which is what rules out drift
//! from lost decrements. The loop is single-flight: a tick that finds the
//! previous one still running skips (logged at debug), and the driving loop
//! bounds each tick with a hard deadline so a slow tick can never produce a
//! partial write — the batch update is one transaction at the very end.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::store::{JobAggregate, JobStore, TaskStore};
use crate::types::StoreError;

/// Configuration for the progress reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub tick_interval: Duration,
    /// Hard deadline per tick; an overrunning tick is abandoned unwritten.
    pub tick_deadline: Duration,
    /// Recently completed jobs stay reconcilable this long so the last
    /// progress flush still lands.
    pub completed_window: Duration,
    /// Smallest percent change worth writing.
    pub percent_epsilon: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            tick_deadline: Duration::from_millis(1_500),
            completed_window: Duration::from_secs(15),
            percent_epsilon: 0.01,
        }
    }
}

/// Counters for reconciler health output.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerMetrics {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub ticks_timed_out: u64,
    pub jobs_updated: u64,
    pub over_100_anomalies: u64,
}

/// Rebuilds job aggregates from tasks.
pub struct ProgressReconciler {
    jobs: Arc<JobStore>,
    tasks: Arc<TaskStore>,
    config: ReconcilerConfig,
    tick_lock: tokio::sync::Mutex<()>,
    metrics: RwLock<ReconcilerMetrics>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl ProgressReconciler {
    pub fn new(jobs: Arc<JobStore>, tasks: Arc<TaskStore>, config: ReconcilerConfig) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            tasks,
            config,
            tick_lock: tokio::sync::Mutex::new(()),
            metrics: RwLock::new(ReconcilerMetrics::default()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
        })
    }

    /// Start the background tick loop.
    pub fn start(self: &Arc<Self>) {
        let reconciler = self.clone();
        let shutdown = self.shutdown_notify.clone();
        let tick = self.config.tick_interval;
        let deadline = self.config.tick_deadline;

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*reconciler.is_running.read() {
                            break;
                        }
                        match tokio::time::timeout(deadline, reconciler.run_once()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                tracing::error!("reconciler tick failed: {}", e);
                            }
                            Err(_) => {
                                reconciler.metrics.write().ticks_timed_out += 1;
                                tracing::warn!(
                                    "reconciler tick exceeded {:?}; skipped, next tick catches up",
                                    deadline
                                );
                            }
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }

    pub fn metrics(&self) -> ReconcilerMetrics {
        self.metrics.read().clone()
    }

    /// One reconciliation pass. Returns the number of jobs whose aggregates
    /// changed. Running it twice without intervening task updates changes
    /// nothing the second time.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let _guard = match self.tick_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics.write().ticks_skipped += 1;
                tracing::debug!("reconciler tick skipped: previous tick still running");
                return Ok(0);
            }
        };
        self.metrics.write().ticks += 1;

        let jobs = self.jobs.reconcilable(self.config.completed_window).await?;
        let mut aggregates = Vec::new();

        for job in jobs {
            let tasks = self.tasks.tasks_for_job(job.id).await?;

            let mut processed: i64 = 0;
            let mut dispatched: i64 = 0;
            for task in &tasks {
                processed = processed.saturating_add(task.processed_contribution());
                // Dispatched is coverage allocated, not completed: every task
                // with a defined range counts, terminal ones included.
                dispatched = dispatched.saturating_add(task.coverage());
            }

            let percent = if job.effective_keyspace > 0 {
                let raw = processed as f64 / job.effective_keyspace as f64 * 100.0;
                if raw > 100.0 {
                    self.metrics.write().over_100_anomalies += 1;
                    tracing::warn!(
                        "job {} reports {:.2}% raw progress; capping at 100",
                        job.id,
                        raw
                    );
                }
                raw.min(100.0)
            } else {
                0.0
            };

            let changed = processed != job.processed_keyspace
                || dispatched != job.dispatched_keyspace
                || (percent - job.progress_percent).abs() > self.config.percent_epsilon;
            if changed {
                aggregates.push(JobAggregate {
                    job_id: job.id,
                    processed,
                    dispatched,
                    percent,
                });
            }
        }

        let updated = aggregates.len();
        self.jobs.update_aggregates(&aggregates).await?;
        if updated > 0 {
            self.metrics.write().jobs_updated += updated as u64;
            tracing::debug!("reconciled {} jobs", updated);
        }
        Ok(updated)
    }
}

//! Recovery manager
//!
//! Two single-flight sweeps keep the task set honest on an unreliable fleet:
//! the stall sweep reclaims slices whose agent stopped reporting and is not
//! heartbeating, and the disconnect sweep reclaims everything an agent held
//! once its reconnect grace expires. Reclaimed residuals come back as
//! pending tasks (via the task store) unless the retry budget is exhausted,
//! in which case the owning job fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::config::SettingsStore;
use crate::registry::AgentRegistry;
use crate::services::{NotificationEvent, NotificationService};
use crate::store::{JobStore, RequeueOutcome, TaskStore};
use crate::types::{AgentId, AgentStatus, Job, JobId, JobStatus, RecoveryError, Task};

/// Configuration for the recovery sweeps.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub stall_sweep_interval: Duration,
    pub disconnect_sweep_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stall_sweep_interval: Duration::from_secs(30),
            disconnect_sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Counters for recovery health output.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub stall_sweeps: u64,
    pub disconnect_sweeps: u64,
    pub tasks_reclaimed: u64,
    pub jobs_failed: u64,
}

/// Sweeps stalled and orphaned tasks back into the pending pool.
pub struct RecoveryManager {
    tasks: Arc<TaskStore>,
    jobs: Arc<JobStore>,
    registry: Arc<AgentRegistry>,
    notifier: Arc<dyn NotificationService>,
    settings: Arc<SettingsStore>,
    stall_lock: tokio::sync::Mutex<()>,
    disconnect_lock: tokio::sync::Mutex<()>,
    metrics: RwLock<RecoveryMetrics>,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        tasks: Arc<TaskStore>,
        jobs: Arc<JobStore>,
        registry: Arc<AgentRegistry>,
        notifier: Arc<dyn NotificationService>,
        settings: Arc<SettingsStore>,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            jobs,
            registry,
            notifier,
            settings,
            stall_lock: tokio::sync::Mutex::new(()),
            disconnect_lock: tokio::sync::Mutex::new(()),
            metrics: RwLock::new(RecoveryMetrics::default()),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
            config,
        })
    }

    /// Start both sweep loops.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = self.shutdown_notify.clone();
        let tick = self.config.stall_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*manager.is_running.read() {
                            break;
                        }
                        if let Err(e) = manager.stall_sweep_once().await {
                            tracing::error!("stall sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });

        let manager = self.clone();
        let shutdown = self.shutdown_notify.clone();
        let tick = self.config.disconnect_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*manager.is_running.read() {
                            break;
                        }
                        if let Err(e) = manager.disconnect_sweep_once().await {
                            tracing::error!("disconnect sweep failed: {}", e);
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

    pub fn metrics(&self) -> RecoveryMetrics {
        self.metrics.read().clone()
    }

    /// Reclaim active slices whose progress went quiet and whose agent is
    /// not heartbeating. The stall threshold is twice the expected chunk
    /// duration plus a grace of two reporting intervals.
    pub async fn stall_sweep_once(&self) -> Result<usize, RecoveryError> {
        let _guard = match self.stall_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("stall sweep skipped: previous sweep still running");
                return Ok(0);
            }
        };
        self.metrics.write().stall_sweeps += 1;

        let settings = self.settings.snapshot();
        let grace = settings.progress_reporting_interval * 2;
        let heartbeat_staleness = settings.progress_reporting_interval * 3;
        let now = Utc::now();

        let active = self.tasks.active_tasks().await?;
        let mut job_cache: HashMap<JobId, Job> = HashMap::new();
        let mut reclaimed = 0usize;

        for task in active {
            let agent_id = match task.agent_id {
                Some(id) => id,
                None => continue,
            };

            let job = match job_cache.get(&task.job_id) {
                Some(job) => job.clone(),
                None => {
                    let job = self.jobs.get(task.job_id).await?;
                    job_cache.insert(task.job_id, job.clone());
                    job
                }
            };

            let expected = job.chunk_duration(settings.default_chunk_duration.as_secs());
            let threshold = expected * 2 + grace;
            let reference = task
                .last_progress_at
                .or(task.started_at)
                .unwrap_or(task.created_at);
            let silent_for = (now - reference).to_std().unwrap_or(Duration::ZERO);

            if silent_for <= threshold {
                continue;
            }
            if self.registry.is_heartbeating(agent_id, heartbeat_staleness) {
                // Agent is alive, just slow; leave the slice alone.
                continue;
            }

            tracing::warn!(
                "task {} stalled for {:?} on silent agent {}; reclaiming",
                task.id,
                silent_for,
                agent_id
            );
            self.reclaim_one(&task, settings.max_chunk_retry_attempts)
                .await?;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Reclaim every slice held by agents whose reconnect grace has expired.
    pub async fn disconnect_sweep_once(&self) -> Result<usize, RecoveryError> {
        let _guard = match self.disconnect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("disconnect sweep skipped: previous sweep still running");
                return Ok(0);
            }
        };
        self.metrics.write().disconnect_sweeps += 1;

        let settings = self.settings.snapshot();
        let expired = self
            .registry
            .expired_disconnects(settings.reconnect_grace_period);
        let mut reclaimed = 0usize;

        for agent_id in expired {
            let held = self.tasks.active_tasks_for_agent(agent_id).await?;
            tracing::warn!(
                "agent {} exceeded reconnect grace; reclaiming {} tasks",
                agent_id,
                held.len()
            );
            for task in held {
                self.reclaim_one(&task, settings.max_chunk_retry_attempts)
                    .await?;
                reclaimed += 1;
            }
            self.registry.mark_disconnect_handled(agent_id);
            if let Err(e) = self.registry.set_status(agent_id, AgentStatus::Inactive).await {
                tracing::debug!("agent {} status not updated: {}", agent_id, e);
            }
            let _ = self
                .notifier
                .notify("operators", NotificationEvent::AgentOffline { agent_id })
                .await;
        }

        Ok(reclaimed)
    }

    /// Reclaim all active slices of one agent immediately (used when an
    /// agent is quarantined or force-removed).
    pub async fn reclaim_agent(&self, agent_id: AgentId) -> Result<usize, RecoveryError> {
        let settings = self.settings.snapshot();
        let held = self.tasks.active_tasks_for_agent(agent_id).await?;
        let count = held.len();
        for task in held {
            self.reclaim_one(&task, settings.max_chunk_retry_attempts)
                .await?;
        }
        Ok(count)
    }

    async fn reclaim_one(&self, task: &Task, max_retries: u32) -> Result<(), RecoveryError> {
        match self.tasks.reclaim(task.id, max_retries).await? {
            RequeueOutcome::Requeued(residual) => {
                self.metrics.write().tasks_reclaimed += 1;
                tracing::info!(
                    "task {} reclaimed; residual {} requeued for job {}",
                    task.id,
                    residual.id,
                    task.job_id
                );
            }
            RequeueOutcome::Settled => {
                self.metrics.write().tasks_reclaimed += 1;
            }
            RequeueOutcome::RetriesExhausted => {
                self.metrics.write().jobs_failed += 1;
                self.jobs
                    .set_last_error(
                        task.job_id,
                        &format!("task {} exceeded its retry budget", task.id),
                    )
                    .await?;
                match self.jobs.transition(task.job_id, JobStatus::Failed).await {
                    Ok(job) => {
                        let _ = self
                            .notifier
                            .notify(
                                &job.owner,
                                NotificationEvent::JobFailed {
                                    job_id: job.id,
                                    reason: "task retry budget exhausted".to_string(),
                                },
                            )
                            .await;
                    }
                    Err(e) => tracing::debug!("job {} not failed: {}", task.job_id, e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::AttackPlan;
    use crate::services::ServiceSet;
    use crate::store::Database;
    use crate::types::{
        Agent, AttackSpec, FileId, HashlistId, JobSpec, TaskStatus,
    };

    struct Fixture {
        tasks: Arc<TaskStore>,
        jobs: Arc<JobStore>,
        registry: Arc<AgentRegistry>,
        notifier: Arc<crate::services::RecordingNotifier>,
        manager: Arc<RecoveryManager>,
        settings: Arc<SettingsStore>,
        job: crate::types::Job,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let (_services, _hashlists, _files, notifier) = ServiceSet::in_memory();
        let tasks = Arc::new(TaskStore::new(db.clone()));
        let jobs = Arc::new(JobStore::new(db.clone()));
        let registry = Arc::new(AgentRegistry::new(db.clone()));
        let settings = Arc::new(SettingsStore::default());

        let spec = JobSpec {
            owner: "tester".to_string(),
            hashlist_id: HashlistId::new(),
            attack: AttackSpec::Dictionary {
                wordlist_id: FileId::new(),
                rule_id: None,
            },
            binary_version: "7.0.0".to_string(),
            priority: 5,
            max_agents: 0,
            allow_preempt: false,
            chunk_duration_secs: Some(1),
        };
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 1_000,
            rule_count: 0,
        };
        let job = jobs.build_job(spec, plan, 0, false, Vec::new()).unwrap();
        jobs.insert(&job).await.unwrap();
        let job = jobs.transition(job.id, JobStatus::Running).await.unwrap();

        let manager = RecoveryManager::new(
            tasks.clone(),
            jobs.clone(),
            registry.clone(),
            notifier.clone(),
            settings.clone(),
            RecoveryConfig::default(),
        );

        Fixture {
            tasks,
            jobs,
            registry,
            notifier,
            manager,
            settings,
            job,
        }
    }

    /// Shrink the stall math so freshly created tasks already look silent.
    fn tighten_stall_settings(settings: &SettingsStore, reporting_interval: Duration) {
        let mut s = settings.snapshot();
        s.progress_reporting_interval = reporting_interval;
        settings.update(s);
    }

    #[tokio::test]
    async fn stall_sweep_reclaims_silent_tasks() {
        let fx = fixture().await;
        let agent = Agent::new("ghost");
        fx.registry.register(&agent).await.unwrap();
        fx.registry.mark_connected(agent.id);

        let task = fx.tasks.claim(&fx.job, 500, agent.id).await.unwrap().unwrap();
        tighten_stall_settings(&fx.settings, Duration::ZERO);
        // Job chunk duration is 1s; let the 2s threshold pass with a silent
        // (never heartbeating after connect) agent.
        fx.registry.mark_disconnected(agent.id);
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let reclaimed = fx.manager.stall_sweep_once().await.unwrap();
        assert_eq!(reclaimed, 1);
        let stored = fx.tasks.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Reclaimed);
        assert_eq!(fx.tasks.pending_count_for_job(fx.job.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stall_sweep_spares_heartbeating_agents() {
        let fx = fixture().await;
        let agent = Agent::new("slowpoke");
        fx.registry.register(&agent).await.unwrap();
        fx.registry.mark_connected(agent.id);

        let task = fx.tasks.claim(&fx.job, 500, agent.id).await.unwrap().unwrap();
        // Threshold 2s + 200ms grace; heartbeat staleness 300ms.
        tighten_stall_settings(&fx.settings, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(2_300)).await;
        // Keep the heartbeat fresh: the slice is slow but the agent is alive.
        fx.registry.touch_heartbeat(agent.id);

        let reclaimed = fx.manager.stall_sweep_once().await.unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(
            fx.tasks.get(task.id).await.unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn disconnect_sweep_waits_for_grace() {
        let fx = fixture().await;
        let agent = Agent::new("roaming");
        fx.registry.register(&agent).await.unwrap();
        fx.registry.mark_connected(agent.id);
        let task = fx.tasks.claim(&fx.job, 500, agent.id).await.unwrap().unwrap();

        fx.registry.mark_disconnected(agent.id);

        // Inside grace: nothing happens.
        assert_eq!(fx.manager.disconnect_sweep_once().await.unwrap(), 0);
        assert_eq!(
            fx.tasks.get(task.id).await.unwrap().status,
            TaskStatus::Assigned
        );

        // Shrink the grace to zero: the agent's tasks are reclaimed once.
        let mut s = fx.settings.snapshot();
        s.reconnect_grace_period = Duration::ZERO;
        fx.settings.update(s);

        assert_eq!(fx.manager.disconnect_sweep_once().await.unwrap(), 1);
        assert_eq!(
            fx.tasks.get(task.id).await.unwrap().status,
            TaskStatus::Reclaimed
        );
        assert!(fx
            .notifier
            .events()
            .iter()
            .any(|(_, e)| matches!(e, NotificationEvent::AgentOffline { .. })));

        // The sweep is idempotent: the disconnect was handled.
        assert_eq!(fx.manager.disconnect_sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconnect_inside_grace_keeps_tasks() {
        let fx = fixture().await;
        let agent = Agent::new("wobbly");
        fx.registry.register(&agent).await.unwrap();
        fx.registry.mark_connected(agent.id);
        let task = fx.tasks.claim(&fx.job, 500, agent.id).await.unwrap().unwrap();

        fx.registry.mark_disconnected(agent.id);
        fx.registry.mark_connected(agent.id); // reconnect before grace

        let mut s = fx.settings.snapshot();
        s.reconnect_grace_period = Duration::ZERO;
        fx.settings.update(s);

        assert_eq!(fx.manager.disconnect_sweep_once().await.unwrap(), 0);
        assert_eq!(
            fx.tasks.get(task.id).await.unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_job() {
        let fx = fixture().await;
        let agent = Agent::new("cursed");
        fx.registry.register(&agent).await.unwrap();
        fx.registry.mark_connected(agent.id);

        let mut s = fx.settings.snapshot();
        s.max_chunk_retry_attempts = 0;
        s.reconnect_grace_period = Duration::ZERO;
        fx.settings.update(s);

        fx.tasks.claim(&fx.job, 500, agent.id).await.unwrap().unwrap();
        fx.registry.mark_disconnected(agent.id);

        fx.manager.disconnect_sweep_once().await.unwrap();
        let job = fx.jobs.get(fx.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("retry budget"));
        assert!(fx
            .notifier
            .events()
            .iter()
            .any(|(_, e)| matches!(e, NotificationEvent::JobFailed { .. })));
    }
}

//! CrackHive orchestrator core
//!
//! The job scheduling and execution subsystem of a distributed
//! password-cracking service: operators admit jobs (attack plans against a
//! hashlist), remote agents execute keyspace slices, and this crate owns
//! partitioning, priority scheduling with preemption, speed-adaptive chunk
//! sizing, rule-split parallelism, progress reconciliation and crash
//! recovery. Hashlist management, file storage, notification delivery, auth
//! and the network edge are external collaborators (see [`services`]).

pub mod chunk;
pub mod config;
pub mod keyspace;
pub mod reconciler;
pub mod recovery;
pub mod registry;
pub mod rules;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{OverflowMode, Settings, SettingsStore};
pub use reconciler::{ProgressReconciler, ReconcilerConfig};
pub use recovery::{RecoveryConfig, RecoveryManager};
pub use registry::AgentRegistry;
pub use rules::RuleSplitter;
pub use scheduler::{Scheduler, SchedulerConfig, TickSummary};
pub use services::{
    BinaryService, FileService, HashlistService, NotificationEvent, NotificationService,
    ServiceSet,
};
pub use store::{BenchmarkStore, Database, JobStore, TaskStore};
pub use transport::Transport;
pub use types::*;

use std::path::PathBuf;
use std::sync::Arc;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Database file; `None` runs fully in memory.
    pub db_path: Option<PathBuf>,
    pub settings: Settings,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub recovery: RecoveryConfig,
}

/// Store-level health snapshot.
#[derive(Debug, Clone)]
pub struct OrchestratorHealth {
    pub store_accessible: bool,
    pub jobs_total: usize,
    pub jobs_running: usize,
    pub tasks_active: usize,
    pub agents_online: usize,
}

/// The assembled scheduling core: stores, registry, transport and the three
/// background loops.
pub struct Orchestrator {
    pub jobs: Arc<JobStore>,
    pub tasks: Arc<TaskStore>,
    pub benchmarks: Arc<BenchmarkStore>,
    pub registry: Arc<AgentRegistry>,
    pub transport: Arc<Transport>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<ProgressReconciler>,
    pub recovery: Arc<RecoveryManager>,
    pub settings: Arc<SettingsStore>,
    pub splitter: RuleSplitter,
    services: ServiceSet,
}

impl Orchestrator {
    /// Wire up the core against the given collaborator services. Loops are
    /// not started until [`Orchestrator::start`].
    pub fn new(config: OrchestratorConfig, services: ServiceSet) -> Result<Self, OrchestratorError> {
        let db = match &config.db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };

        let settings = Arc::new(SettingsStore::new(config.settings.clone()));
        let jobs = Arc::new(JobStore::new(db.clone()));
        let tasks = Arc::new(TaskStore::new(db.clone()));
        let benchmarks = Arc::new(BenchmarkStore::new(db.clone()));
        let registry = Arc::new(AgentRegistry::new(db));
        let splitter = RuleSplitter::new(config.settings.rule_chunk_temp_dir.clone());

        let transport = Transport::new(
            registry.clone(),
            tasks.clone(),
            jobs.clone(),
            benchmarks.clone(),
            services.hashlists.clone(),
            services.notifier.clone(),
            settings.clone(),
        );

        let scheduler = Scheduler::new(
            jobs.clone(),
            tasks.clone(),
            benchmarks.clone(),
            registry.clone(),
            transport.clone(),
            services.hashlists.clone(),
            services.notifier.clone(),
            settings.clone(),
            config.scheduler,
        );

        let reconciler = ProgressReconciler::new(jobs.clone(), tasks.clone(), config.reconciler);

        let recovery = RecoveryManager::new(
            tasks.clone(),
            jobs.clone(),
            registry.clone(),
            services.notifier.clone(),
            settings.clone(),
            config.recovery,
        );

        Ok(Self {
            jobs,
            tasks,
            benchmarks,
            registry,
            transport,
            scheduler,
            reconciler,
            recovery,
            settings,
            splitter,
            services,
        })
    }

    /// Start all background loops.
    pub fn start(&self) {
        self.transport.start();
        self.scheduler.start();
        self.reconciler.start();
        self.recovery.start();
        tracing::info!("orchestrator loops started");
    }

    /// Admit a job into scheduling.
    pub async fn admit_job(&self, spec: JobSpec) -> Result<Job, AdmissionError> {
        let settings = self.settings.snapshot();
        self.jobs
            .admit(spec, &self.services, &self.benchmarks, &self.splitter, &settings)
            .await
    }

    /// Cancel a job: stop selecting it, cancel its slices, tell its agents.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self.jobs.transition(job_id, JobStatus::Cancelled).await?;
        for task in self.tasks.tasks_for_job(job_id).await? {
            if task.is_active() || task.status == TaskStatus::Pending {
                if let Some(agent_id) = task.agent_id {
                    self.transport.cancel_task(agent_id, task.id, "job cancelled");
                }
                self.tasks.cancel(task.id, "job cancelled", false).await?;
            }
        }
        Ok(job)
    }

    /// Pause a job. In-flight slices are allowed to finish; nothing new is
    /// assigned until resume.
    pub async fn pause_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        Ok(self.jobs.transition(job_id, JobStatus::Paused).await?)
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        Ok(self.jobs.transition(job_id, JobStatus::Running).await?)
    }

    /// Resolve a binary version and push its file manifest to an agent.
    pub async fn sync_agent_binary(
        &self,
        agent_id: AgentId,
        version: &str,
    ) -> Result<(), OrchestratorError> {
        let resolved = self.services.binaries.resolve_version(version).await?;
        let manifest = self.services.binaries.manifest(&resolved).await?;
        self.transport.sync_files(agent_id, manifest)?;
        Ok(())
    }

    /// Probe the store and summarize live state.
    pub async fn check_health(&self) -> Result<OrchestratorHealth, StoreError> {
        let jobs = self.jobs.list(None).await?;
        let running = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        let active = self.tasks.active_tasks().await?.len();
        let online = self.registry.online_agents().await?.len();
        Ok(OrchestratorHealth {
            store_accessible: true,
            jobs_total: jobs.len(),
            jobs_running: running,
            tasks_active: active,
            agents_online: online,
        })
    }

    /// Stop loops and flush transport state.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.recovery.shutdown();
        self.reconciler.shutdown();
        self.transport.shutdown().await;
        tracing::info!("orchestrator shut down");
    }
}

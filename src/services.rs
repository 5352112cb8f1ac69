//! External collaborator interfaces
//!
//! The scheduling core consumes these subsystems but does not implement
//! them: hashlist management, wordlist/rule storage, notification fan-out and
//! binary distribution live elsewhere. The in-memory implementations back
//! tests and the daemon's standalone mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{AgentId, CrackEntry, FileId, HashlistId, JobId, ServiceError};

/// Hashlist metadata the scheduler needs for admission and chunk sizing.
#[derive(Debug, Clone)]
pub struct HashlistInfo {
    pub id: HashlistId,
    pub hash_count: i64,
    pub uncracked_count: i64,
    pub hash_type: u32,
    /// Hashes with differing work factors in one list (skews engine-reported
    /// progress).
    pub mixed_work_factors: bool,
    /// Slow algorithm; chunk sizing applies a minimum slice floor.
    pub slow_hash: bool,
}

/// Supplies hash counts and receives cracked hashes.
#[async_trait]
pub trait HashlistService: Send + Sync {
    async fn get_hashlist(&self, id: HashlistId) -> Result<HashlistInfo, ServiceError>;

    /// Ingest cracked hashes. Must be idempotent: the transport delivers
    /// at-least-once. Returns the number of newly cracked hashes.
    async fn record_cracks(
        &self,
        id: HashlistId,
        cracks: &[CrackEntry],
    ) -> Result<u64, ServiceError>;
}

/// A resolved wordlist, rules file or association map.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub id: FileId,
    pub path: PathBuf,
    pub line_count: i64,
}

/// Looks up wordlists, rule files and per-hashlist association maps.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn wordlist(&self, id: FileId) -> Result<FileInfo, ServiceError>;

    async fn rules(&self, id: FileId) -> Result<FileInfo, ServiceError>;

    async fn association_map(&self, hashlist_id: HashlistId) -> Result<FileInfo, ServiceError>;
}

/// Events the scheduler publishes; delivery (webhook/email/in-app) is the
/// notification subsystem's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    JobStarted { job_id: JobId },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId, reason: String },
    FirstCrack { job_id: JobId },
    TaskCompletedWithCracks { job_id: JobId, cracked: u32 },
    AgentOffline { agent_id: AgentId },
    AgentError { agent_id: AgentId, reason: String },
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, owner: &str, event: NotificationEvent) -> Result<(), ServiceError>;
}

/// Resolves binary version pointers for assignment payloads and file sync.
#[async_trait]
pub trait BinaryService: Send + Sync {
    /// Resolve a version pointer (`"default"` included) to a concrete
    /// version string.
    async fn resolve_version(&self, version: &str) -> Result<String, ServiceError>;

    /// File manifest agents need for the given (resolved) version.
    async fn manifest(
        &self,
        version: &str,
    ) -> Result<Vec<crate::types::FileManifestEntry>, ServiceError>;
}

/// The collaborator bundle handed to the orchestrator.
#[derive(Clone)]
pub struct ServiceSet {
    pub hashlists: Arc<dyn HashlistService>,
    pub files: Arc<dyn FileService>,
    pub notifier: Arc<dyn NotificationService>,
    pub binaries: Arc<dyn BinaryService>,
}

// ── In-memory implementations ─────────────────────────────────────────

/// In-memory hashlist service for tests and standalone runs.
#[derive(Default)]
pub struct InMemoryHashlists {
    lists: RwLock<HashMap<HashlistId, HashlistInfo>>,
    cracked: RwLock<HashMap<HashlistId, Vec<CrackEntry>>>,
}

impl InMemoryHashlists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: HashlistInfo) {
        self.lists.write().insert(info.id, info);
    }

    /// Distinct cracked hashes recorded for a hashlist.
    pub fn cracked_hashes(&self, id: HashlistId) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .cracked
            .read()
            .get(&id)
            .map(|entries| entries.iter().map(|c| c.hash.clone()).collect())
            .unwrap_or_default();
        hashes.sort();
        hashes.dedup();
        hashes
    }
}

#[async_trait]
impl HashlistService for InMemoryHashlists {
    async fn get_hashlist(&self, id: HashlistId) -> Result<HashlistInfo, ServiceError> {
        self.lists
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("hashlist {id}")))
    }

    async fn record_cracks(
        &self,
        id: HashlistId,
        cracks: &[CrackEntry],
    ) -> Result<u64, ServiceError> {
        let mut lists = self.lists.write();
        let info = lists
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("hashlist {id}")))?;

        let mut store = self.cracked.write();
        let entries = store.entry(id).or_default();
        let mut new = 0u64;
        for crack in cracks {
            if !entries.iter().any(|c| c.hash == crack.hash) {
                entries.push(crack.clone());
                new += 1;
            }
        }
        info.uncracked_count = (info.uncracked_count - new as i64).max(0);
        Ok(new)
    }
}

/// In-memory file service for tests and standalone runs.
#[derive(Default)]
pub struct InMemoryFiles {
    wordlists: RwLock<HashMap<FileId, FileInfo>>,
    rules: RwLock<HashMap<FileId, FileInfo>>,
    association_maps: RwLock<HashMap<HashlistId, FileInfo>>,
}

impl InMemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_wordlist(&self, info: FileInfo) {
        self.wordlists.write().insert(info.id, info);
    }

    pub fn insert_rules(&self, info: FileInfo) {
        self.rules.write().insert(info.id, info);
    }

    pub fn insert_association_map(&self, hashlist_id: HashlistId, info: FileInfo) {
        self.association_maps.write().insert(hashlist_id, info);
    }
}

#[async_trait]
impl FileService for InMemoryFiles {
    async fn wordlist(&self, id: FileId) -> Result<FileInfo, ServiceError> {
        self.wordlists
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("wordlist {id}")))
    }

    async fn rules(&self, id: FileId) -> Result<FileInfo, ServiceError> {
        self.rules
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("rules {id}")))
    }

    async fn association_map(&self, hashlist_id: HashlistId) -> Result<FileInfo, ServiceError> {
        self.association_maps
            .read()
            .get(&hashlist_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("association map for {hashlist_id}")))
    }
}

/// Records notifications instead of delivering them.
#[derive(Default)]
pub struct RecordingNotifier {
    events: RwLock<Vec<(String, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, NotificationEvent)> {
        self.events.read().clone()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(&self, owner: &str, event: NotificationEvent) -> Result<(), ServiceError> {
        tracing::debug!("notification for {}: {:?}", owner, event);
        self.events.write().push((owner.to_string(), event));
        Ok(())
    }
}

/// Static binary catalogue.
pub struct StaticBinaries {
    default_version: String,
    versions: Vec<String>,
    manifests: HashMap<String, Vec<crate::types::FileManifestEntry>>,
}

impl StaticBinaries {
    pub fn new(default_version: impl Into<String>, versions: Vec<String>) -> Self {
        Self {
            default_version: default_version.into(),
            versions,
            manifests: HashMap::new(),
        }
    }

    pub fn with_manifest(
        mut self,
        version: impl Into<String>,
        manifest: Vec<crate::types::FileManifestEntry>,
    ) -> Self {
        self.manifests.insert(version.into(), manifest);
        self
    }
}

impl Default for StaticBinaries {
    fn default() -> Self {
        Self::new("7.0.0", vec!["7.0.0".to_string()])
    }
}

#[async_trait]
impl BinaryService for StaticBinaries {
    async fn resolve_version(&self, version: &str) -> Result<String, ServiceError> {
        if version == "default" {
            return Ok(self.default_version.clone());
        }
        if self.versions.iter().any(|v| v == version) {
            Ok(version.to_string())
        } else {
            Err(ServiceError::NotFound(format!("binary version {version}")))
        }
    }

    async fn manifest(
        &self,
        version: &str,
    ) -> Result<Vec<crate::types::FileManifestEntry>, ServiceError> {
        if !self.versions.iter().any(|v| v == version) {
            return Err(ServiceError::NotFound(format!("binary version {version}")));
        }
        Ok(self.manifests.get(version).cloned().unwrap_or_default())
    }
}

impl ServiceSet {
    /// Fully in-memory collaborator set for tests and standalone runs.
    pub fn in_memory() -> (
        Self,
        Arc<InMemoryHashlists>,
        Arc<InMemoryFiles>,
        Arc<RecordingNotifier>,
    ) {
        let hashlists = Arc::new(InMemoryHashlists::new());
        let files = Arc::new(InMemoryFiles::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let set = Self {
            hashlists: hashlists.clone(),
            files: files.clone(),
            notifier: notifier.clone(),
            binaries: Arc::new(StaticBinaries::default()),
        };
        (set, hashlists, files, notifier)
    }
}

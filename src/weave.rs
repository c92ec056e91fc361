/// The assembled engine.
///
/// [`Weave`] wires the compression engine, schema registry, tiered store,
/// cache, backups, integrity validator, tool registry, workflow engine and
/// batch coordinator together from one [`WeaveConfig`] and owns their
/// background tasks.
///
/// # Example
///
/// ```ignore
/// let weave = Weave::open(WeaveConfig::default()).await?;
/// let ns: Namespace = "acme/research/interviews".parse()?;
/// weave.put(&ns, Tier::Working, "p1", json!({"quote": "pricing is confusing"}))?;
/// let record = weave.get(&ns, Tier::Working, "p1").await?;
/// ```
use crate::backup::{BackupManager, BackupSnapshot, BackupStats, RestoreOutcome, SnapshotScope};
use crate::batch::{BatchCoordinator, BatchJob};
use crate::cache::{CacheLayer, CacheStats};
use crate::compression::{CompressionEngine, CompressionStats};
use crate::config::WeaveConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::integrity::{IntegrityStats, IntegrityValidator, Rebuilder, RecoveryOutcome, ValidationReport};
use crate::recipe::{Recipe, RecipePlan};
use crate::schema::SchemaRegistry;
use crate::search::{SearchHit, SearchOptions, SearchQuery};
use crate::storage::{ExpireReport, RevisionInfo, StoreStats, TieredStore};
use crate::tool::{Tool, ToolRegistry};
use crate::types::{MemoryRecord, MemoryValue, Namespace, Tier};
use crate::watch::DirectoryWatcher;
use crate::workflow::{Decision, RunInput, RunOutcome, RunReport, WorkflowEngine, WorkflowStats};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Statistics across every component.
#[derive(Debug, Clone, Serialize)]
pub struct WeaveStats {
    pub store: StoreStats,
    pub cache: CacheStats,
    pub compression: CompressionStats,
    pub backups: Option<BackupStats>,
    pub integrity: IntegrityStats,
    pub workflows: WorkflowStats,
    pub quarantined: Vec<(Namespace, String)>,
}

pub struct Weave {
    config: WeaveConfig,
    schemas: Arc<SchemaRegistry>,
    store: Arc<TieredStore>,
    cache: Arc<CacheLayer>,
    backups: Option<Arc<BackupManager>>,
    integrity: Arc<IntegrityValidator>,
    tools: Arc<ToolRegistry>,
    workflows: Arc<WorkflowEngine>,
    batches: Arc<BatchCoordinator>,
    /// Owner namespace -> namespaces allowed to read it
    grants: DashMap<Namespace, BTreeSet<Namespace>>,
    shutdown: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Weave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weave")
            .field("durable", &self.store.is_durable())
            .field("backups", &self.backups.as_ref().map(|b| b.dir().to_path_buf()))
            .finish()
    }
}

impl Weave {
    /// Assemble every component from `config`.
    pub async fn open(config: WeaveConfig) -> WeaveResult<Self> {
        config.validate()?;
        let compression = Arc::new(CompressionEngine::new(config.compression.clone()));
        let schemas = Arc::new(SchemaRegistry::new());
        let store = Arc::new(TieredStore::from_config(
            &config,
            Arc::clone(&compression),
            Arc::clone(&schemas),
        )?);
        let cache = Arc::new(CacheLayer::new(Arc::clone(&store), config.cache.max_bytes));

        let backups = match &config.backup.dir {
            Some(dir) => Some(Arc::new(
                BackupManager::open(dir, config.backup.clone(), Arc::clone(&store)).await?,
            )),
            None => None,
        };

        let tools = Arc::new(ToolRegistry::new());
        let workflows = Arc::new(WorkflowEngine::new(Arc::clone(&cache), Arc::clone(&tools)));
        let rebuilder: Arc<dyn Rebuilder> = workflows.clone();
        let integrity = Arc::new(
            IntegrityValidator::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                backups.clone(),
                config.integrity.clone(),
            )
            .with_rebuilder(rebuilder),
        );
        let batches = Arc::new(BatchCoordinator::new(Arc::clone(&workflows), config.batch.clone()));

        info!(
            durable = store.is_durable(),
            backups = backups.is_some(),
            "tierweave opened"
        );
        Ok(Self {
            config,
            schemas,
            store,
            cache,
            backups,
            integrity,
            tools,
            workflows,
            batches,
            grants: DashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(Vec::new()),
        })
    }

    /// In-memory engine with default settings.
    pub async fn in_memory() -> WeaveResult<Self> {
        Self::open(WeaveConfig::default()).await
    }

    pub fn config(&self) -> &WeaveConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn integrity(&self) -> &Arc<IntegrityValidator> {
        &self.integrity
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn batches(&self) -> &Arc<BatchCoordinator> {
        &self.batches
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    pub fn put(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        value: impl Into<MemoryValue>,
    ) -> WeaveResult<u64> {
        self.put_with_metadata(namespace, tier, key, value, BTreeMap::new())
    }

    pub fn put_with_metadata(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        value: impl Into<MemoryValue>,
        metadata: BTreeMap<String, String>,
    ) -> WeaveResult<u64> {
        self.cache.put(namespace, tier, key, &value.into(), metadata)
    }

    /// Read through the cache. A corrupt read runs recovery on the namespace
    /// and is retried once. So does a miss in a namespace with journal
    /// faults, since the missing record may be one the journal dropped.
    pub async fn get(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<MemoryRecord> {
        match self.cache.get(namespace, tier, key) {
            Err(WeaveError::CorruptData { reason }) => {
                warn!(namespace = %namespace, %tier, key, reason = %reason, "corrupt read, recovering");
                self.integrity.recover(namespace).await?;
                self.cache.get(namespace, tier, key)
            }
            Err(e @ WeaveError::NotFound { .. }) => {
                let faults = self.store.journal_faults(namespace).len();
                if faults == 0 {
                    return Err(e);
                }
                warn!(namespace = %namespace, %tier, key, faults, "miss in damaged namespace, recovering");
                self.integrity.recover(namespace).await?;
                self.cache.get(namespace, tier, key)
            }
            other => other,
        }
    }

    pub fn delete(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<()> {
        self.cache.delete(namespace, tier, key)
    }

    pub fn history(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<Vec<RevisionInfo>> {
        self.store.history(namespace, tier, key)
    }

    pub fn list(&self, namespace: &Namespace, tier: Tier, prefix: &str) -> WeaveResult<Vec<String>> {
        Ok(self.store.list_keys(namespace, tier, prefix)?.collect())
    }

    pub fn namespaces(&self) -> BTreeSet<Namespace> {
        self.store.namespaces()
    }

    pub async fn search(&self, query: &SearchQuery, options: &SearchOptions) -> WeaveResult<Vec<SearchHit>> {
        crate::search::search(&self.store, query, options).await
    }

    pub fn promote(&self, namespace: &Namespace, key: &str, from: Tier, to: Tier) -> WeaveResult<u64> {
        self.cache.promote(namespace, key, from, to)
    }

    /// Apply tier retention now and compact the journal.
    pub fn gc(&self) -> WeaveResult<ExpireReport> {
        let report = self.store.expire(Utc::now())?;
        if report.removed_records > 0 {
            self.cache.clear();
            self.workflows.prune_provenance();
        }
        if self.store.is_durable() {
            self.store.compact()?;
        }
        info!(
            removed = report.removed_records,
            pruned = report.pruned_revisions,
            "retention pass finished"
        );
        Ok(report)
    }

    pub fn register_schema(&self, namespace: &Namespace, schema: JsonValue) -> WeaveResult<()> {
        self.schemas.register(namespace, schema)
    }

    // ---------------------------------------------------------------------
    // Sharing
    // ---------------------------------------------------------------------

    /// Allow `reader` to read records owned by `owner`.
    pub fn share(&self, owner: &Namespace, reader: &Namespace) {
        self.grants
            .entry(owner.clone())
            .or_default()
            .insert(reader.clone());
        info!(owner = %owner, reader = %reader, "sharing granted");
    }

    pub fn revoke(&self, owner: &Namespace, reader: &Namespace) -> bool {
        self.grants
            .get_mut(owner)
            .is_some_and(|mut readers| readers.remove(reader))
    }

    /// Whether `reader` may read `owner`: its own namespace, anything in the
    /// `global` project, or an explicit grant.
    pub fn may_read(&self, reader: &Namespace, owner: &Namespace) -> bool {
        reader == owner
            || owner.is_global()
            || self
                .grants
                .get(owner)
                .is_some_and(|readers| readers.contains(reader))
    }

    /// Read a record of another namespace on behalf of `reader`.
    pub async fn read_shared(
        &self,
        reader: &Namespace,
        owner: &Namespace,
        tier: Tier,
        key: &str,
    ) -> WeaveResult<MemoryRecord> {
        if !self.may_read(reader, owner) {
            return Err(WeaveError::SharingDenied {
                reader: reader.to_string(),
                owner: owner.to_string(),
            });
        }
        self.get(owner, tier, key).await
    }

    // ---------------------------------------------------------------------
    // Backups and integrity
    // ---------------------------------------------------------------------

    pub fn backups(&self) -> WeaveResult<&Arc<BackupManager>> {
        self.backups
            .as_ref()
            .ok_or_else(|| WeaveError::Config("backups are not configured (set backup.dir)".into()))
    }

    pub async fn snapshot(&self, scope: SnapshotScope) -> WeaveResult<BackupSnapshot> {
        self.backups()?.snapshot_now(scope).await
    }

    pub async fn list_backups(&self) -> WeaveResult<Vec<BackupSnapshot>> {
        Ok(self.backups()?.list().await)
    }

    /// Restore a snapshot, dropping cached entries of every restored
    /// namespace.
    pub async fn restore(&self, snapshot_id: &str) -> WeaveResult<RestoreOutcome> {
        let outcome = self.backups()?.restore(snapshot_id).await?;
        for (namespace, _) in &outcome.namespaces {
            self.cache.invalidate_namespace(namespace);
        }
        Ok(outcome)
    }

    pub async fn restore_namespace(&self, snapshot_id: &str, namespace: &Namespace) -> WeaveResult<RestoreOutcome> {
        let outcome = self.backups()?.restore_namespace(snapshot_id, namespace).await?;
        self.cache.invalidate_namespace(namespace);
        Ok(outcome)
    }

    pub fn check(&self, namespace: &Namespace) -> ValidationReport {
        self.integrity.check(namespace)
    }

    pub async fn recover(&self, namespace: &Namespace) -> WeaveResult<RecoveryOutcome> {
        self.integrity.recover(namespace).await
    }

    pub fn clear_quarantine(&self, namespace: &Namespace) -> WeaveResult<bool> {
        self.integrity.clear_quarantine(namespace)
    }

    // ---------------------------------------------------------------------
    // Workflows and batches
    // ---------------------------------------------------------------------

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    pub fn validate_recipe(&self, recipe: &Recipe, namespace: &Namespace) -> WeaveResult<RecipePlan> {
        self.workflows.validate(recipe, namespace)
    }

    pub async fn run(&self, recipe: Arc<Recipe>, namespace: &Namespace, input: RunInput) -> WeaveResult<RunReport> {
        self.workflows.run(recipe, namespace, input).await
    }

    pub async fn resume(&self, run_id: &str, decision: Decision) -> WeaveResult<RunOutcome> {
        self.workflows.resume(run_id, decision).await
    }

    pub async fn submit_batch(
        &self,
        recipe: Arc<Recipe>,
        namespace: &Namespace,
        inputs: Vec<RunInput>,
        max_workers: Option<usize>,
    ) -> WeaveResult<BatchJob> {
        self.batches.submit(recipe, namespace, inputs, max_workers).await
    }

    /// Watch `root` with the configured patterns, submitting a batch of
    /// `recipe` for every poll that finds new files.
    pub fn watch(&self, root: &Path, recipe: Arc<Recipe>, namespace: &Namespace) -> WeaveResult<()> {
        self.workflows.validate(&recipe, namespace)?;
        let watcher = Arc::new(DirectoryWatcher::new(root, self.config.watch.clone())?);
        let handle = watcher.spawn(
            Arc::clone(&self.batches),
            recipe,
            namespace.clone(),
            Arc::clone(&self.shutdown),
        );
        self.track(handle);
        info!(root = %root.display(), namespace = %namespace, "directory watch started");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start the backup and integrity schedules.
    pub fn start_background(&self) {
        if let Some(backups) = &self.backups {
            self.track(backups.spawn_schedule(Arc::clone(&self.shutdown)));
        }
        self.track(self.integrity.spawn_schedule(Arc::clone(&self.shutdown)));
        info!("background tasks started");
    }

    /// Stop background tasks and compact the journal.
    pub async fn shutdown(&self) -> WeaveResult<()> {
        self.shutdown.store(true, Ordering::Release);
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            handle.abort();
            match handle.await {
                Err(e) if !e.is_cancelled() => warn!(error = %e, "background task failed"),
                _ => {}
            }
        }
        if self.store.is_durable() {
            self.store.compact()?;
        }
        info!("tierweave shut down");
        Ok(())
    }

    pub fn stats(&self) -> WeaveStats {
        WeaveStats {
            store: self.store.stats(),
            cache: self.cache.stats(),
            compression: self.store.compression().stats(),
            backups: self.backups.as_ref().map(|b| b.stats()),
            integrity: self.integrity.stats(),
            workflows: self.workflows.stats(),
            quarantined: self.store.quarantined(),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.background.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::RecoveryStage;
    use crate::types::RecordKey;
    use serde_json::json;
    use tempfile::TempDir;

    fn ns(s: &str) -> Namespace {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_put_get_through_facade() {
        let weave = Weave::in_memory().await.unwrap();
        let notes = ns("acme/research/notes");
        weave.put(&notes, Tier::Working, "a", json!({"n": 1})).unwrap();
        let rev = weave.put(&notes, Tier::Working, "a", json!({"n": 2})).unwrap();
        assert_eq!(rev, 2);

        let record = weave.get(&notes, Tier::Working, "a").await.unwrap();
        assert_eq!(record.value, MemoryValue::structured(json!({"n": 2})));
        assert_eq!(weave.history(&notes, Tier::Working, "a").unwrap().len(), 2);
        assert_eq!(weave.list(&notes, Tier::Working, "").unwrap(), vec!["a"]);
        assert!(weave.backups().is_err());
    }

    #[tokio::test]
    async fn test_cross_namespace_reads_need_a_grant() {
        let weave = Weave::in_memory().await.unwrap();
        let owner = ns("acme/research/notes");
        let reader = ns("beta/research/notes");
        let shared = Namespace::global("patterns", "prompts").unwrap();
        weave.put(&owner, Tier::Working, "k", json!(1)).unwrap();
        weave.put(&shared, Tier::LongTerm, "k", json!(2)).unwrap();

        let denied = weave.read_shared(&reader, &owner, Tier::Working, "k").await;
        assert!(matches!(denied, Err(WeaveError::SharingDenied { .. })));
        assert!(weave.read_shared(&reader, &shared, Tier::LongTerm, "k").await.is_ok());

        weave.share(&owner, &reader);
        assert!(weave.read_shared(&reader, &owner, Tier::Working, "k").await.is_ok());
        assert!(weave.revoke(&owner, &reader));
        assert!(!weave.may_read(&reader, &owner));
    }

    #[tokio::test]
    async fn test_corrupt_read_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let mut config = WeaveConfig::default();
        config.backup.dir = Some(dir.path().to_path_buf());
        config.backup.passphrase = Some("correct horse".into());
        let weave = Weave::open(config).await.unwrap();

        let notes = ns("acme/research/notes");
        weave.put(&notes, Tier::Working, "a", json!({"quote": "keep"})).unwrap();
        weave.snapshot(SnapshotScope::Namespace(notes.clone())).await.unwrap();

        let record = RecordKey::new(notes.clone(), Tier::Working, "a");
        assert!(weave.store().tamper(&record, 1));
        weave.cache().evict(&record);

        let value = weave.get(&notes, Tier::Working, "a").await.unwrap();
        assert_eq!(value.value, MemoryValue::structured(json!({"quote": "keep"})));
        assert_eq!(weave.stats().integrity.recoveries, 1);
        assert!(weave.check(&notes).consistent);
    }

    #[tokio::test]
    async fn test_recover_reports_stage() {
        let weave = Weave::in_memory().await.unwrap();
        let notes = ns("acme/research/notes");
        weave.put(&notes, Tier::Working, "a", json!(1)).unwrap();
        let outcome = weave.recover(&notes).await.unwrap();
        assert_eq!(outcome.stage, RecoveryStage::None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background() {
        let weave = Weave::in_memory().await.unwrap();
        weave.start_background();
        weave.shutdown().await.unwrap();
        assert!(weave.background.lock().unwrap().is_empty());
    }
}

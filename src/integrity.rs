/// Consistency checks and staged recovery for namespaces.
///
/// Recovery tries, in order:
///
/// 1. **Cache**: damaged keys still resident in the cache are re-committed
///    from their cached value.
/// 2. **Backup**: the newest snapshot covering the namespace that verifies
///    cleanly is restored.
/// 3. **Rebuild**: invalid revisions are dropped so each key falls back to its
///    newest valid revision; keys with nothing valid left are handed to a
///    [`Rebuilder`] (e.g. re-running the workflow step that produced them).
///
/// Each stage gets `max_retries` attempts. If all stages fail the namespace
/// is quarantined and `IrrecoverableState` is returned.
use crate::backup::BackupManager;
use crate::cache::CacheLayer;
use crate::config::IntegrityConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::storage::TieredStore;
use crate::types::{MemoryValue, Namespace, RecordKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

/// What kind of inconsistency an issue describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A stored revision fails decompression, checksum or decoding
    CorruptRevision,
    /// A journal line for the namespace was skipped on open
    JournalFault,
    /// The cache holds a newer revision than the store
    CacheAhead,
    /// The cache holds a key the store no longer has
    CacheOrphan,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueKind::CorruptRevision => "corrupt_revision",
            IssueKind::JournalFault => "journal_fault",
            IssueKind::CacheAhead => "cache_ahead",
            IssueKind::CacheOrphan => "cache_orphan",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub record: Option<RecordKey>,
    pub revision: Option<u64>,
    pub detail: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(record) = &self.record {
            write!(f, " {}", record)?;
        }
        if let Some(revision) = self.revision {
            write!(f, " @{}", revision)?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Result of [`IntegrityValidator::check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub namespace: Namespace,
    pub consistent: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Recovery stage that repaired a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    /// Nothing needed repairing
    None,
    Cache,
    Backup,
    Rebuild,
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStage::None => "none",
            RecoveryStage::Cache => "cache",
            RecoveryStage::Backup => "backup",
            RecoveryStage::Rebuild => "rebuild",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub namespace: Namespace,
    pub stage: RecoveryStage,
    /// Attempts made per stage, in the order tried
    pub attempts: Vec<(RecoveryStage, usize)>,
    pub repaired_issues: usize,
    /// Snapshot restored by the backup stage
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityStats {
    pub checks: u64,
    pub inconsistent: u64,
    pub recoveries: u64,
    pub quarantines: u64,
}

/// Supplies a fresh value for a key that has no valid revision left.
#[async_trait]
pub trait Rebuilder: Send + Sync {
    /// `Ok(None)` when the producing inputs are no longer available.
    async fn rebuild(&self, record: &RecordKey) -> WeaveResult<Option<MemoryValue>>;
}

enum Attempt {
    Repaired(Option<String>),
    Failed(String),
    Unavailable(String),
}

pub struct IntegrityValidator {
    store: Arc<TieredStore>,
    cache: Arc<CacheLayer>,
    backups: Option<Arc<BackupManager>>,
    rebuilder: Option<Arc<dyn Rebuilder>>,
    config: IntegrityConfig,
    checks: AtomicU64,
    inconsistent: AtomicU64,
    recoveries: AtomicU64,
    quarantines: AtomicU64,
}

impl IntegrityValidator {
    pub fn new(
        store: Arc<TieredStore>,
        cache: Arc<CacheLayer>,
        backups: Option<Arc<BackupManager>>,
        config: IntegrityConfig,
    ) -> Self {
        Self {
            store,
            cache,
            backups,
            rebuilder: None,
            config,
            checks: AtomicU64::new(0),
            inconsistent: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            quarantines: AtomicU64::new(0),
        }
    }

    pub fn with_rebuilder(mut self, rebuilder: Arc<dyn Rebuilder>) -> Self {
        self.rebuilder = Some(rebuilder);
        self
    }

    /// Check every retained revision, the namespace's journal faults and the
    /// cache's agreement with the store.
    pub fn check(&self, namespace: &Namespace) -> ValidationReport {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let mut issues = self.state_issues(namespace);
        issues.extend(
            self.store
                .journal_faults(namespace)
                .into_iter()
                .map(|fault| ValidationIssue {
                    kind: IssueKind::JournalFault,
                    record: fault.record,
                    revision: None,
                    detail: format!("journal line {}: {}", fault.line, fault.reason),
                }),
        );

        let consistent = issues.is_empty();
        if !consistent {
            self.inconsistent.fetch_add(1, Ordering::Relaxed);
            debug!(namespace = %namespace, issues = issues.len(), "namespace inconsistent");
        }
        ValidationReport {
            namespace: namespace.clone(),
            consistent,
            issues,
        }
    }

    /// Issues visible in current state, i.e. excluding replay history.
    fn state_issues(&self, namespace: &Namespace) -> Vec<ValidationIssue> {
        let mut issues: Vec<ValidationIssue> = self
            .store
            .verify(namespace)
            .into_iter()
            .map(|fault| ValidationIssue {
                kind: IssueKind::CorruptRevision,
                record: Some(fault.record),
                revision: Some(fault.revision),
                detail: fault.reason,
            })
            .collect();

        for cached in self.cache.resident(namespace) {
            let record = cached.record_key();
            match self.store.current_revision(&record) {
                None => issues.push(ValidationIssue {
                    kind: IssueKind::CacheOrphan,
                    record: Some(record),
                    revision: Some(cached.revision),
                    detail: "cached key missing from store".into(),
                }),
                Some(stored) if cached.revision > stored => issues.push(ValidationIssue {
                    kind: IssueKind::CacheAhead,
                    record: Some(record),
                    revision: Some(cached.revision),
                    detail: format!("store is at revision {}", stored),
                }),
                Some(_) => {}
            }
        }
        issues
    }

    /// Repair a namespace through the cache, backup and rebuild stages.
    pub async fn recover(&self, namespace: &Namespace) -> WeaveResult<RecoveryOutcome> {
        let report = self.check(namespace);
        if report.consistent {
            return Ok(RecoveryOutcome {
                namespace: namespace.clone(),
                stage: RecoveryStage::None,
                attempts: Vec::new(),
                repaired_issues: 0,
                snapshot_id: None,
            });
        }
        info!(namespace = %namespace, issues = report.issues.len(), "starting recovery");

        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = Vec::new();
        let mut failures = Vec::new();

        for stage in [RecoveryStage::Cache, RecoveryStage::Backup, RecoveryStage::Rebuild] {
            let mut made = 0;
            while made < max_attempts {
                made += 1;
                let attempt = match stage {
                    RecoveryStage::Cache => self.from_cache(namespace, &report.issues),
                    RecoveryStage::Backup => self.from_backup(namespace).await,
                    RecoveryStage::Rebuild => self.rebuild(namespace, &report.issues).await,
                    RecoveryStage::None => break,
                };

                match attempt {
                    Attempt::Repaired(snapshot_id) => {
                        self.cache.invalidate_namespace(namespace);
                        let remaining = self.state_issues(namespace);
                        if remaining.is_empty() {
                            attempts.push((stage, made));
                            self.store.clear_faults(namespace);
                            self.store.compact()?;
                            self.recoveries.fetch_add(1, Ordering::Relaxed);
                            info!(namespace = %namespace, stage = %stage, attempts = made, "namespace recovered");
                            return Ok(RecoveryOutcome {
                                namespace: namespace.clone(),
                                stage,
                                attempts,
                                repaired_issues: report.issues.len(),
                                snapshot_id,
                            });
                        }
                        warn!(
                            namespace = %namespace,
                            stage = %stage,
                            remaining = remaining.len(),
                            "recovery stage left issues"
                        );
                        failures.push(format!("{}: {} issues remain", stage, remaining.len()));
                    }
                    Attempt::Failed(reason) => {
                        warn!(namespace = %namespace, stage = %stage, attempt = made, reason = %reason, "recovery attempt failed");
                        failures.push(format!("{}: {}", stage, reason));
                    }
                    Attempt::Unavailable(reason) => {
                        debug!(namespace = %namespace, stage = %stage, reason = %reason, "recovery stage skipped");
                        failures.push(format!("{}: {}", stage, reason));
                        break;
                    }
                }
            }
            attempts.push((stage, made));
        }

        let reason = failures.join("; ");
        self.store.quarantine(namespace, reason.clone())?;
        self.cache.invalidate_namespace(namespace);
        self.quarantines.fetch_add(1, Ordering::Relaxed);
        error!(namespace = %namespace, reason = %reason, "ALERT: namespace irrecoverable, quarantined");
        Err(WeaveError::IrrecoverableState {
            namespace: namespace.to_string(),
            reason,
        })
    }

    fn from_cache(&self, namespace: &Namespace, issues: &[ValidationIssue]) -> Attempt {
        let mut bad: BTreeMap<RecordKey, Vec<u64>> = BTreeMap::new();
        for issue in issues {
            let Some(record) = &issue.record else {
                return Attempt::Unavailable("issue not attributable to a key".into());
            };
            let revisions = bad.entry(record.clone()).or_default();
            if issue.kind == IssueKind::CorruptRevision {
                revisions.extend(issue.revision);
            }
        }

        let mut resident = BTreeMap::new();
        for record in bad.keys() {
            match self.cache.peek(record) {
                Some(cached) => {
                    resident.insert(record.clone(), cached);
                }
                None => return Attempt::Unavailable(format!("{} not resident in cache", record)),
            }
        }
        trace!(namespace = %namespace, keys = resident.len(), "reconstructing from cache");

        for (record, revisions) in &bad {
            if let Err(e) = self.store.discard_revisions(record, revisions) {
                return Attempt::Failed(e.to_string());
            }
            let Some(cached) = resident.get(record) else {
                continue;
            };
            let current_is_cached = self
                .store
                .current_revision(record)
                .is_some_and(|current| current >= cached.revision);
            if current_is_cached {
                continue;
            }
            if let Err(e) = self
                .store
                .commit(record.clone(), &cached.value, cached.metadata.clone())
            {
                return Attempt::Failed(e.to_string());
            }
        }
        Attempt::Repaired(None)
    }

    async fn from_backup(&self, namespace: &Namespace) -> Attempt {
        let Some(backups) = &self.backups else {
            return Attempt::Unavailable("backups not configured".into());
        };
        let candidates = backups.candidates_for(namespace).await;
        if candidates.is_empty() {
            return Attempt::Unavailable("no snapshot covers the namespace".into());
        }

        let mut last_error = String::new();
        for snapshot in candidates {
            match backups.restore_namespace(&snapshot.id, namespace).await {
                Ok(_) => return Attempt::Repaired(Some(snapshot.id)),
                Err(e @ WeaveError::BackupCorrupt { .. }) => {
                    warn!(id = %snapshot.id, error = %e, "skipping corrupt snapshot");
                    last_error = e.to_string();
                }
                Err(e) => return Attempt::Failed(e.to_string()),
            }
        }
        Attempt::Unavailable(format!("no valid snapshot ({})", last_error))
    }

    async fn rebuild(&self, namespace: &Namespace, issues: &[ValidationIssue]) -> Attempt {
        let mut damaged: BTreeSet<RecordKey> = BTreeSet::new();
        for issue in issues {
            match &issue.record {
                Some(record) => {
                    damaged.insert(record.clone());
                }
                None => return Attempt::Unavailable(format!("cannot rebuild unattributed issue: {}", issue.detail)),
            }
        }
        // Re-verify: an earlier stage may already have changed what is valid.
        let mut invalid: BTreeMap<RecordKey, Vec<u64>> = BTreeMap::new();
        for fault in self.store.verify(namespace) {
            damaged.insert(fault.record.clone());
            invalid.entry(fault.record).or_default().push(fault.revision);
        }

        for record in damaged {
            if let Some(revisions) = invalid.get(&record) {
                if let Err(e) = self.store.discard_revisions(&record, revisions) {
                    return Attempt::Failed(e.to_string());
                }
            }
            if self.store.current_revision(&record).is_some() {
                continue;
            }

            let Some(rebuilder) = &self.rebuilder else {
                return Attempt::Failed(format!("{} has no valid revision and no rebuilder", record));
            };
            match rebuilder.rebuild(&record).await {
                Ok(Some(value)) => {
                    if let Err(e) = self.store.commit(record.clone(), &value, BTreeMap::new()) {
                        return Attempt::Failed(e.to_string());
                    }
                    debug!(record = %record, "record rebuilt");
                }
                Ok(None) => return Attempt::Failed(format!("{}: inputs no longer available", record)),
                Err(e) => return Attempt::Failed(format!("{}: {}", record, e)),
            }
        }
        Attempt::Repaired(None)
    }

    /// Lift a quarantine after manual intervention.
    pub fn clear_quarantine(&self, namespace: &Namespace) -> WeaveResult<bool> {
        self.store.clear_quarantine(namespace)
    }

    pub fn stats(&self) -> IntegrityStats {
        IntegrityStats {
            checks: self.checks.load(Ordering::Relaxed),
            inconsistent: self.inconsistent.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            quarantines: self.quarantines.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic check. Inconsistent namespaces are recovered.
    pub fn spawn_schedule(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let validator = Arc::clone(self);
        let period = self.config.check_interval.get();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                trace!("Running integrity check");
                for namespace in validator.store.namespaces() {
                    if validator.store.is_quarantined(&namespace) {
                        continue;
                    }
                    if validator.check(&namespace).consistent {
                        continue;
                    }
                    if let Err(e) = validator.recover(&namespace).await {
                        warn!(namespace = %namespace, error = %e, "scheduled recovery failed");
                    }
                }
            }
        })
    }
}

/// Tiered storage with append-only revision history.
///
/// This module implements the persistent store underneath the cache. Records
/// are addressed by `(namespace, tier, key)` and are never mutated in place:
///
/// - Every write appends a new revision with a monotonically increasing number
/// - Deletes write a tombstone rather than dropping history
/// - Retention garbage collection is the only thing that removes revisions
///
/// Values above the compression threshold are compressed before they are
/// stored, and the chosen algorithm is recorded on the revision.
///
/// The store is thread-safe and uses DashMap for concurrent access. The entry
/// lock on a key is what makes revision assignment atomic, so N concurrent
/// writers to one key always produce N distinct revisions.
///
/// When opened on a directory the store is backed by a [`Journal`].
use crate::compression::CompressionEngine;
use crate::config::{RetentionConfig, RetentionPeriod, WeaveConfig};
use crate::error::{WeaveError, WeaveResult};
use crate::persistence::{Journal, JournalEntry, JournalFault};
use crate::retry::RetryPolicy;
use crate::schema::SchemaRegistry;
use crate::types::{MemoryRecord, MemoryValue, Namespace, RecordKey, Revision, Tier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Metadata key recording the tier a promoted record came from.
pub const PROMOTED_FROM: &str = "promoted_from";

const LIST_PAGE_SIZE: usize = 256;

/// Deletion marker for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Revisions up to and including this one are deleted
    pub after_revision: u64,
    pub at: DateTime<Utc>,
}

/// All retained revisions of one key, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyHistory {
    pub revisions: Vec<Revision>,
    pub tombstone: Option<Tombstone>,
}

impl KeyHistory {
    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Whether the key currently resolves to a value.
    pub fn is_live(&self) -> bool {
        match (self.latest(), &self.tombstone) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(latest), Some(t)) => latest.revision > t.after_revision,
        }
    }

    fn next_revision(&self) -> u64 {
        let last = self.latest().map(|r| r.revision).unwrap_or(0);
        let deleted = self.tombstone.as_ref().map(|t| t.after_revision).unwrap_or(0);
        last.max(deleted) + 1
    }

    /// Insert in revision order; replaying a revision twice is a no-op.
    fn insert(&mut self, revision: Revision) {
        match self
            .revisions
            .binary_search_by_key(&revision.revision, |r| r.revision)
        {
            Ok(_) => {}
            Err(pos) => self.revisions.insert(pos, revision),
        }
    }
}

/// A key and its history, as exported for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: RecordKey,
    pub history: KeyHistory,
}

/// Revision metadata as shown by history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: usize,
    pub stored_bytes: usize,
    pub algorithm: crate::compression::Algorithm,
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
}

/// A stored revision that fails verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionFault {
    pub record: RecordKey,
    pub revision: u64,
    pub reason: String,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpireReport {
    pub removed_records: usize,
    pub pruned_revisions: usize,
}

/// Store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: usize,
    pub live_records: usize,
    pub revisions: usize,
    pub namespaces: usize,
    pub quarantined: usize,
    pub logical_bytes: usize,
    pub stored_bytes: usize,
    pub compressed_revisions: usize,
    pub writes: u64,
    pub reads: u64,
}

/// Namespaced, tiered, revisioned key/value store.
pub struct TieredStore {
    /// Full retained history per key
    records: DashMap<RecordKey, KeyHistory>,
    compression: Arc<CompressionEngine>,
    schemas: Arc<SchemaRegistry>,
    retention: RetentionConfig,
    journal: Option<Journal>,
    /// Quarantined namespaces and the reason they were quarantined
    quarantined: DashMap<Namespace, String>,
    /// Journal lines skipped on replay, per namespace
    faults: DashMap<Namespace, Vec<JournalFault>>,
    unattributed_faults: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl TieredStore {
    /// In-memory store.
    pub fn new(
        compression: Arc<CompressionEngine>,
        schemas: Arc<SchemaRegistry>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            records: DashMap::new(),
            compression,
            schemas,
            retention,
            journal: None,
            quarantined: DashMap::new(),
            faults: DashMap::new(),
            unattributed_faults: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Journal-backed store in `dir`, replaying any existing journal.
    pub fn open(
        dir: &Path,
        compression: Arc<CompressionEngine>,
        schemas: Arc<SchemaRegistry>,
        retention: RetentionConfig,
        journal_retry: RetryPolicy,
    ) -> WeaveResult<Self> {
        let (journal, replay) = Journal::open(dir, journal_retry)?;
        let mut store = Self::new(compression, schemas, retention);

        let applied = replay.entries.len();
        for entry in replay.entries {
            store.apply(entry);
        }
        for fault in replay.faults {
            match fault.namespace.clone() {
                Some(ns) => store.faults.entry(ns).or_default().push(fault),
                None => {
                    store.unattributed_faults.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        store.journal = Some(journal);
        info!(
            dir = %dir.display(),
            applied,
            records = store.records.len(),
            "store opened"
        );
        Ok(store)
    }

    /// Build the store described by `config`.
    pub fn from_config(
        config: &WeaveConfig,
        compression: Arc<CompressionEngine>,
        schemas: Arc<SchemaRegistry>,
    ) -> WeaveResult<Self> {
        match (&config.storage.data_dir, config.storage.journal) {
            (Some(dir), true) => Self::open(
                dir,
                compression,
                schemas,
                config.retention.clone(),
                config.storage.journal_retry.clone(),
            ),
            _ => Ok(Self::new(compression, schemas, config.retention.clone())),
        }
    }

    pub fn compression(&self) -> &Arc<CompressionEngine> {
        &self.compression
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// Write a new revision of a record.
    ///
    /// Structured values are validated against the namespace's schema first.
    /// Returns the revision number assigned to the write.
    pub fn put(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        value: &MemoryValue,
        metadata: BTreeMap<String, String>,
    ) -> WeaveResult<u64> {
        self.put_record(namespace, tier, key, value, metadata)
            .map(|r| r.revision)
    }

    /// Like [`TieredStore::put`], returning the record as written.
    pub fn put_record(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        value: &MemoryValue,
        metadata: BTreeMap<String, String>,
    ) -> WeaveResult<MemoryRecord> {
        self.ensure_writable(namespace)?;
        self.schemas.validate(namespace, key, value)?;
        self.commit(RecordKey::new(namespace.clone(), tier, key), value, metadata)
    }

    /// Run the checks `put` would apply to a value, without writing it.
    pub fn check_writable(&self, namespace: &Namespace, key: &str, value: &MemoryValue) -> WeaveResult<()> {
        self.ensure_writable(namespace)?;
        self.schemas.validate(namespace, key, value)
    }

    /// Append a revision without quarantine or schema checks.
    pub(crate) fn commit(
        &self,
        record: RecordKey,
        value: &MemoryValue,
        metadata: BTreeMap<String, String>,
    ) -> WeaveResult<MemoryRecord> {
        let encoded = value.encode()?;
        let size_bytes = encoded.len();
        let checksum = blake3::hash(&encoded).to_hex().to_string();
        let (algorithm, payload) = self.compression.compress(&encoded, size_bytes)?;

        let (revision, created_at) = {
            let mut history = self.records.entry(record.clone()).or_default();
            let revision = Revision {
                revision: history.next_revision(),
                kind: value.kind(),
                mime: value.mime().map(str::to_string),
                algorithm,
                payload,
                size_bytes,
                checksum,
                metadata,
                created_at: Utc::now(),
            };
            history.revisions.push(revision.clone());
            let created_at = history
                .revisions
                .first()
                .map(|r| r.created_at)
                .unwrap_or(revision.created_at);
            (revision, created_at)
        };

        if let Some(journal) = &self.journal {
            let entry = JournalEntry::Put {
                record: record.clone(),
                revision: revision.clone(),
            };
            if let Err(e) = journal.append(&entry) {
                warn!(record = %record, revision = revision.revision, "journal append failed, rolling back");
                if let Some(mut history) = self.records.get_mut(&record) {
                    history.revisions.retain(|r| r.revision != revision.revision);
                }
                return Err(e);
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(
            record = %record,
            revision = revision.revision,
            algorithm = ?revision.algorithm,
            size = size_bytes,
            "revision committed"
        );
        Ok(MemoryRecord {
            namespace: record.namespace,
            tier: record.tier,
            key: record.key,
            value: value.clone(),
            revision: revision.revision,
            compressed: revision.compressed(),
            size_bytes: revision.size_bytes,
            metadata: revision.metadata,
            created_at,
            updated_at: revision.created_at,
        })
    }

    /// Read the current revision of a record.
    pub fn get(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<MemoryRecord> {
        self.ensure_readable(namespace)?;
        let record = RecordKey::new(namespace.clone(), tier, key);
        let (created_at, latest) = {
            let history = self
                .records
                .get(&record)
                .ok_or_else(|| record.not_found())?;
            if !history.is_live() {
                return Err(record.not_found());
            }
            match (history.revisions.first(), history.latest()) {
                (Some(first), Some(latest)) => (first.created_at, latest.clone()),
                _ => return Err(record.not_found()),
            }
        };
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.materialize(&record, created_at, &latest)
    }

    /// Read a specific retained revision.
    pub fn get_revision(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        revision: u64,
    ) -> WeaveResult<MemoryRecord> {
        self.ensure_readable(namespace)?;
        let record = RecordKey::new(namespace.clone(), tier, key);
        let (created_at, found) = {
            let history = self
                .records
                .get(&record)
                .ok_or_else(|| record.not_found())?;
            let first = history
                .revisions
                .first()
                .map(|r| r.created_at)
                .ok_or_else(|| record.not_found())?;
            let found = history
                .revisions
                .iter()
                .find(|r| r.revision == revision)
                .cloned()
                .ok_or_else(|| record.not_found())?;
            (first, found)
        };
        self.materialize(&record, created_at, &found)
    }

    /// Latest revision number of a live record.
    pub fn current_revision(&self, record: &RecordKey) -> Option<u64> {
        self.records
            .get(record)
            .filter(|h| h.is_live())
            .and_then(|h| h.latest().map(|r| r.revision))
    }

    fn materialize(
        &self,
        record: &RecordKey,
        created_at: DateTime<Utc>,
        revision: &Revision,
    ) -> WeaveResult<MemoryRecord> {
        let value = self.decode_revision(record, revision)?;
        Ok(MemoryRecord {
            namespace: record.namespace.clone(),
            tier: record.tier,
            key: record.key.clone(),
            value,
            revision: revision.revision,
            metadata: revision.metadata.clone(),
            created_at,
            updated_at: revision.created_at,
            compressed: revision.compressed(),
            size_bytes: revision.size_bytes,
        })
    }

    fn decode_revision(&self, record: &RecordKey, revision: &Revision) -> WeaveResult<MemoryValue> {
        let raw = self.compression.decompress_cached(
            record,
            revision.revision,
            revision.algorithm,
            &revision.payload,
        )?;
        check_digest(record, revision, &raw)?;
        MemoryValue::decode(revision.kind, revision.mime.as_deref(), &raw)
    }

    /// Delete a record by writing a tombstone.
    pub fn delete(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<()> {
        self.ensure_writable(namespace)?;
        let record = RecordKey::new(namespace.clone(), tier, key);
        self.delete_record(&record)
    }

    fn delete_record(&self, record: &RecordKey) -> WeaveResult<()> {
        let tombstone = {
            let mut history = self
                .records
                .get_mut(record)
                .ok_or_else(|| record.not_found())?;
            if !history.is_live() {
                return Err(record.not_found());
            }
            let tombstone = Tombstone {
                after_revision: history.latest().map(|r| r.revision).unwrap_or(0),
                at: Utc::now(),
            };
            history.tombstone = Some(tombstone.clone());
            tombstone
        };
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::Delete {
                record: record.clone(),
                after_revision: tombstone.after_revision,
                at: tombstone.at,
            })?;
        }
        self.compression.invalidate(record);
        debug!(record = %record, "record deleted");
        Ok(())
    }

    /// Whether a live record exists.
    pub fn contains(&self, record: &RecordKey) -> bool {
        self.records.get(record).is_some_and(|h| h.is_live())
    }

    /// Lazily list live keys in `(namespace, tier)` starting with `prefix`, in
    /// key order.
    pub fn list_keys(&self, namespace: &Namespace, tier: Tier, prefix: &str) -> WeaveResult<KeyIter<'_>> {
        self.list_keys_after(namespace, tier, prefix, None)
    }

    /// Resume a listing after `cursor`, as returned by [`KeyIter::cursor`].
    pub fn list_keys_after(
        &self,
        namespace: &Namespace,
        tier: Tier,
        prefix: &str,
        cursor: Option<&str>,
    ) -> WeaveResult<KeyIter<'_>> {
        self.ensure_readable(namespace)?;
        Ok(KeyIter {
            store: self,
            namespace: namespace.clone(),
            tier,
            prefix: prefix.to_string(),
            after: cursor.map(str::to_string),
            buffer: VecDeque::new(),
            page_size: LIST_PAGE_SIZE,
            exhausted: false,
        })
    }

    /// Revision metadata for a key, oldest first.
    pub fn history(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<Vec<RevisionInfo>> {
        self.ensure_readable(namespace)?;
        let record = RecordKey::new(namespace.clone(), tier, key);
        let history = self
            .records
            .get(&record)
            .ok_or_else(|| record.not_found())?;
        Ok(history
            .revisions
            .iter()
            .map(|r| RevisionInfo {
                revision: r.revision,
                created_at: r.created_at,
                size_bytes: r.size_bytes,
                stored_bytes: r.payload.len(),
                algorithm: r.algorithm,
                checksum: r.checksum.clone(),
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    /// Move a record's current value into another tier.
    ///
    /// The value is written as a new revision in `to` and the record is then
    /// deleted from `from`. Returns the revision in the target tier.
    pub fn promote(&self, namespace: &Namespace, key: &str, from: Tier, to: Tier) -> WeaveResult<u64> {
        if from == to {
            return Err(WeaveError::Storage(format!(
                "cannot promote '{}' from {} into itself",
                key, from
            )));
        }
        let current = self.get(namespace, from, key)?;
        let mut metadata = current.metadata.clone();
        metadata.insert(PROMOTED_FROM.into(), from.to_string());
        let revision = self.put(namespace, to, key, &current.value, metadata)?;
        self.delete_record(&current.record_key())?;
        info!(namespace = %namespace, key, %from, %to, revision, "record promoted");
        Ok(revision)
    }

    /// Apply tier retention as of `now`.
    ///
    /// Records whose last update is older than their tier's retention are
    /// removed along with their history. For the rest, superseded revisions
    /// older than the window are dropped; the current revision always stays.
    /// Quarantined namespaces are left untouched.
    pub fn expire(&self, now: DateTime<Utc>) -> WeaveResult<ExpireReport> {
        let mut report = ExpireReport::default();
        let mut purge = Vec::new();
        let mut prune = Vec::new();

        for entry in self.records.iter() {
            let record = entry.key();
            if self.quarantined.contains_key(&record.namespace) {
                continue;
            }
            let Some(window) = self.retention.for_tier(record.tier).as_chrono() else {
                continue;
            };
            let cutoff = now - window;
            let history = entry.value();

            let last_touched = history
                .tombstone
                .as_ref()
                .map(|t| t.at)
                .into_iter()
                .chain(history.latest().map(|r| r.created_at))
                .max();
            match last_touched {
                Some(at) if at >= cutoff && history.is_live() => {
                    let stale: Vec<u64> = history
                        .revisions
                        .iter()
                        .rev()
                        .skip(1)
                        .filter(|r| r.created_at < cutoff)
                        .map(|r| r.revision)
                        .collect();
                    if !stale.is_empty() {
                        prune.push((record.clone(), stale));
                    }
                }
                Some(at) if at >= cutoff => {}
                _ => purge.push(record.clone()),
            }
        }

        for record in purge {
            self.records.remove(&record);
            self.compression.invalidate(&record);
            if let Some(journal) = &self.journal {
                journal.append(&JournalEntry::Purge {
                    record: record.clone(),
                })?;
            }
            report.removed_records += 1;
        }
        for (record, revisions) in prune {
            report.pruned_revisions += revisions.len();
            self.discard_revisions(&record, &revisions)?;
        }

        if report.removed_records + report.pruned_revisions > 0 {
            info!(
                removed = report.removed_records,
                pruned = report.pruned_revisions,
                "retention pass complete"
            );
        }
        Ok(report)
    }

    /// Retention for a tier, as configured.
    pub fn retention(&self, tier: Tier) -> RetentionPeriod {
        self.retention.for_tier(tier)
    }

    /// Drop specific revisions of a key. A key left without revisions is
    /// removed.
    pub(crate) fn discard_revisions(&self, record: &RecordKey, revisions: &[u64]) -> WeaveResult<()> {
        if revisions.is_empty() {
            return Ok(());
        }
        let emptied = match self.records.get_mut(record) {
            Some(mut history) => {
                history.revisions.retain(|r| !revisions.contains(&r.revision));
                history.revisions.is_empty()
            }
            None => return Ok(()),
        };
        if emptied {
            self.records.remove(record);
        }
        self.compression.invalidate(record);
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::Prune {
                record: record.clone(),
                revisions: revisions.to_vec(),
            })?;
        }
        Ok(())
    }

    /// Every namespace holding at least one key.
    pub fn namespaces(&self) -> BTreeSet<Namespace> {
        self.records
            .iter()
            .map(|entry| entry.key().namespace.clone())
            .collect()
    }

    /// Point-in-time copy of a namespace, or of the whole store.
    ///
    /// Each key is cloned under its own entry lock, so concurrent writers are
    /// only blocked for the duration of one clone.
    pub fn export(&self, scope: Option<&Namespace>) -> Vec<StoredRecord> {
        let mut out: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|entry| scope.is_none_or(|ns| &entry.key().namespace == ns))
            .map(|entry| StoredRecord {
                record: entry.key().clone(),
                history: entry.value().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.record.cmp(&b.record));
        out
    }

    /// Current history of a single key.
    pub fn key_history(&self, record: &RecordKey) -> Option<KeyHistory> {
        self.records.get(record).map(|h| h.clone())
    }

    /// Replace the whole content of a namespace, e.g. from a backup.
    pub fn replace_namespace(&self, namespace: &Namespace, records: Vec<StoredRecord>) -> WeaveResult<usize> {
        let mut replacements = BTreeMap::new();
        replacements.insert(namespace.clone(), records);
        let restored = self.replace_namespaces(replacements)?;
        Ok(restored.first().map(|(_, n)| *n).unwrap_or(0))
    }

    /// Replace several namespaces as one unit.
    ///
    /// Every replacement is checked before anything is swapped in, and the
    /// journal is compacted once at the end. If that fails, all namespaces
    /// are put back as they were. Records filed under the wrong namespace
    /// are ignored.
    pub fn replace_namespaces(
        &self,
        replacements: BTreeMap<Namespace, Vec<StoredRecord>>,
    ) -> WeaveResult<Vec<(Namespace, usize)>> {
        let mut staged = Vec::with_capacity(replacements.len());
        for (namespace, records) in replacements {
            let records: Vec<StoredRecord> = records
                .into_iter()
                .filter(|stored| stored.record.namespace == namespace)
                .collect();
            for stored in &records {
                check_history(&stored.record, &stored.history).map_err(|reason| {
                    WeaveError::Storage(format!("restore of {} rejected: {}", namespace, reason))
                })?;
            }
            staged.push((namespace, records));
        }

        let previous: Vec<(Namespace, Vec<StoredRecord>, Option<Vec<JournalFault>>)> = staged
            .iter()
            .map(|(namespace, _)| {
                let faults = self.faults.get(namespace).map(|f| f.clone());
                (namespace.clone(), self.export(Some(namespace)), faults)
            })
            .collect();

        let mut restored = Vec::with_capacity(staged.len());
        for (namespace, records) in staged {
            let count = records.len();
            self.swap_namespace(&namespace, records);
            self.faults.remove(&namespace);
            restored.push((namespace, count));
        }

        if let Err(e) = self.compact() {
            warn!(error = %e, namespaces = previous.len(), "restore not durable, rolling back");
            for (namespace, records, faults) in previous {
                self.swap_namespace(&namespace, records);
                if let Some(faults) = faults {
                    self.faults.insert(namespace, faults);
                }
            }
            return Err(e);
        }
        for (namespace, count) in &restored {
            info!(namespace = %namespace, records = count, "namespace replaced");
        }
        Ok(restored)
    }

    fn swap_namespace(&self, namespace: &Namespace, records: Vec<StoredRecord>) {
        self.records.retain(|key, _| &key.namespace != namespace);
        for stored in records {
            self.records.insert(stored.record, stored.history);
        }
        self.compression.invalidate_namespace(namespace);
    }

    /// Verify every retained revision in a namespace.
    ///
    /// Bypasses the decompression cache so damaged payloads are seen even if
    /// a good copy is still cached.
    pub fn verify(&self, namespace: &Namespace) -> Vec<RevisionFault> {
        let mut faults = Vec::new();
        for stored in self.export(Some(namespace)) {
            let mut previous = 0;
            for revision in &stored.history.revisions {
                if revision.revision <= previous {
                    faults.push(RevisionFault {
                        record: stored.record.clone(),
                        revision: revision.revision,
                        reason: format!("revision {} out of order after {}", revision.revision, previous),
                    });
                }
                previous = revision.revision;
                if let Err(e) = self.decode_verified(&stored.record, revision) {
                    faults.push(RevisionFault {
                        record: stored.record.clone(),
                        revision: revision.revision,
                        reason: e.to_string(),
                    });
                }
            }
        }
        faults
    }

    /// Decode one revision, verifying it without the decompression cache.
    pub(crate) fn decode_verified(&self, record: &RecordKey, revision: &Revision) -> WeaveResult<MemoryValue> {
        let raw = self
            .compression
            .decompress(revision.algorithm, &revision.payload)?;
        check_digest(record, revision, &raw)?;
        MemoryValue::decode(revision.kind, revision.mime.as_deref(), &raw)
    }

    /// Journal lines skipped for a namespace when the store was opened.
    pub fn journal_faults(&self, namespace: &Namespace) -> Vec<JournalFault> {
        self.faults
            .get(namespace)
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub(crate) fn clear_faults(&self, namespace: &Namespace) {
        self.faults.remove(namespace);
    }

    /// Quarantine a namespace: reads fail fast and writes are refused.
    pub fn quarantine(&self, namespace: &Namespace, reason: impl Into<String>) -> WeaveResult<()> {
        let reason = reason.into();
        warn!(namespace = %namespace, reason = %reason, "namespace quarantined");
        self.quarantined.insert(namespace.clone(), reason.clone());
        self.compression.invalidate_namespace(namespace);
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::Quarantine {
                namespace: namespace.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Lift a quarantine. Returns whether the namespace was quarantined.
    pub fn clear_quarantine(&self, namespace: &Namespace) -> WeaveResult<bool> {
        if self.quarantined.remove(namespace).is_none() {
            return Ok(false);
        }
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::ClearQuarantine {
                namespace: namespace.clone(),
            })?;
        }
        info!(namespace = %namespace, "quarantine cleared");
        Ok(true)
    }

    pub fn is_quarantined(&self, namespace: &Namespace) -> bool {
        self.quarantined.contains_key(namespace)
    }

    pub fn quarantined(&self) -> Vec<(Namespace, String)> {
        let mut out: Vec<_> = self
            .quarantined
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    pub(crate) fn ensure_readable(&self, namespace: &Namespace) -> WeaveResult<()> {
        if self.quarantined.contains_key(namespace) {
            return Err(WeaveError::Quarantined {
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self, namespace: &Namespace) -> WeaveResult<()> {
        self.ensure_readable(namespace)
    }

    /// Rewrite the journal from current state. No-op for in-memory stores.
    pub fn compact(&self) -> WeaveResult<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        journal.compact(|| self.journal_image())
    }

    fn journal_image(&self) -> Vec<JournalEntry> {
        let mut entries = Vec::new();
        for stored in self.export(None) {
            for revision in stored.history.revisions {
                entries.push(JournalEntry::Put {
                    record: stored.record.clone(),
                    revision,
                });
            }
            if let Some(t) = stored.history.tombstone {
                entries.push(JournalEntry::Delete {
                    record: stored.record,
                    after_revision: t.after_revision,
                    at: t.at,
                });
            }
        }
        for (namespace, reason) in self.quarantined() {
            entries.push(JournalEntry::Quarantine { namespace, reason });
        }
        entries
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Put { record, revision } => {
                self.records.entry(record).or_default().insert(revision);
            }
            JournalEntry::Delete {
                record,
                after_revision,
                at,
            } => {
                if let Some(mut history) = self.records.get_mut(&record) {
                    let newer = history
                        .tombstone
                        .as_ref()
                        .is_none_or(|t| t.after_revision <= after_revision);
                    if newer {
                        history.tombstone = Some(Tombstone { after_revision, at });
                    }
                }
            }
            JournalEntry::Prune { record, revisions } => {
                let emptied = match self.records.get_mut(&record) {
                    Some(mut history) => {
                        history.revisions.retain(|r| !revisions.contains(&r.revision));
                        history.revisions.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.records.remove(&record);
                }
            }
            JournalEntry::Purge { record } => {
                self.records.remove(&record);
            }
            JournalEntry::Quarantine { namespace, reason } => {
                self.quarantined.insert(namespace, reason);
            }
            JournalEntry::ClearQuarantine { namespace } => {
                self.quarantined.remove(&namespace);
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            quarantined: self.quarantined.len(),
            namespaces: self.namespaces().len(),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.records.iter() {
            let history = entry.value();
            stats.records += 1;
            if history.is_live() {
                stats.live_records += 1;
            }
            for revision in &history.revisions {
                stats.revisions += 1;
                stats.logical_bytes += revision.size_bytes;
                stats.stored_bytes += revision.payload.len();
                if revision.compressed() {
                    stats.compressed_revisions += 1;
                }
            }
        }
        stats
    }

    /// Number of journal lines that could not be attributed to a namespace.
    pub fn unattributed_faults(&self) -> u64 {
        self.unattributed_faults.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, record: &RecordKey, revision: u64) -> bool {
        match self.records.get_mut(record) {
            Some(mut history) => match history.revisions.iter_mut().find(|r| r.revision == revision) {
                Some(r) => {
                    match r.payload.last_mut() {
                        Some(byte) => *byte ^= 0xFF,
                        None => r.payload.push(0),
                    }
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

fn check_digest(record: &RecordKey, revision: &Revision, raw: &[u8]) -> WeaveResult<()> {
    if raw.len() != revision.size_bytes {
        return Err(WeaveError::corrupt(format!(
            "{} revision {}: {} bytes, expected {}",
            record,
            revision.revision,
            raw.len(),
            revision.size_bytes
        )));
    }
    if blake3::hash(raw).to_hex().as_str() != revision.checksum {
        return Err(WeaveError::corrupt(format!(
            "{} revision {}: checksum mismatch",
            record, revision.revision
        )));
    }
    Ok(())
}

/// Lazy, restartable listing of keys in one `(namespace, tier)`.
///
/// Keys are produced in lexicographic order one page at a time. Keys written
/// after the listing started are picked up if they sort after the cursor.
pub struct KeyIter<'a> {
    store: &'a TieredStore,
    namespace: Namespace,
    tier: Tier,
    prefix: String,
    after: Option<String>,
    buffer: VecDeque<String>,
    page_size: usize,
    exhausted: bool,
}

impl KeyIter<'_> {
    /// The last key produced; pass it to [`TieredStore::list_keys_after`] to
    /// resume.
    pub fn cursor(&self) -> Option<&str> {
        self.after.as_deref()
    }

    fn fill(&mut self) {
        let after = self.after.clone();
        let mut page: Vec<String> = self
            .store
            .records
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.namespace == self.namespace
                    && key.tier == self.tier
                    && key.key.starts_with(&self.prefix)
                    && after.as_ref().is_none_or(|a| &key.key > a)
                    && entry.value().is_live()
            })
            .map(|entry| entry.key().key.clone())
            .collect();
        page.sort();
        if page.len() <= self.page_size {
            self.exhausted = true;
        }
        page.truncate(self.page_size);
        self.buffer.extend(page);
    }
}

impl Iterator for KeyIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        let key = self.buffer.pop_front()?;
        self.after = Some(key.clone());
        Some(key)
    }
}

/// Structural check of a history about to be installed wholesale.
fn check_history(record: &RecordKey, history: &KeyHistory) -> Result<(), String> {
    if history.revisions.is_empty() && history.tombstone.is_none() {
        return Err(format!("{} has no revisions", record));
    }
    let mut previous = 0;
    for revision in &history.revisions {
        if revision.revision <= previous {
            return Err(format!(
                "{} revision {} out of order after {}",
                record, revision.revision, previous
            ));
        }
        previous = revision.revision;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use crate::persistence::JOURNAL_FILE;
    use serde_json::json;
    use std::thread;
    use tempfile::TempDir;

    fn ns() -> Namespace {
        "acme/research/notes".parse().unwrap()
    }

    fn create_store() -> TieredStore {
        TieredStore::new(
            Arc::new(CompressionEngine::new(CompressionConfig {
                threshold_bytes: 64,
                ..Default::default()
            })),
            Arc::new(SchemaRegistry::new()),
            RetentionConfig::default(),
        )
    }

    fn open_store(dir: &Path) -> TieredStore {
        TieredStore::open(
            dir,
            Arc::new(CompressionEngine::default()),
            Arc::new(SchemaRegistry::new()),
            RetentionConfig::default(),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    fn put_json(store: &TieredStore, tier: Tier, key: &str, value: serde_json::Value) -> u64 {
        store
            .put(&ns(), tier, key, &MemoryValue::structured(value), BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let store = create_store();
        let value = json!({"topic": "onboarding", "quotes": 12});
        let rev = put_json(&store, Tier::Working, "summary", value.clone());
        assert_eq!(rev, 1);

        let record = store.get(&ns(), Tier::Working, "summary").unwrap();
        assert_eq!(record.value, MemoryValue::structured(value));
        assert_eq!(record.revision, 1);
        assert!(!record.compressed);
    }

    #[test]
    fn test_get_nonexistent_key() {
        let store = create_store();
        let result = store.get(&ns(), Tier::Working, "missing");
        assert!(matches!(result, Err(WeaveError::NotFound { .. })));
    }

    #[test]
    fn test_tiers_are_separate() {
        let store = create_store();
        put_json(&store, Tier::ShortTerm, "k", json!(1));
        assert!(store.get(&ns(), Tier::Working, "k").is_err());
    }

    #[test]
    fn test_revisions_increase_and_history_is_kept() {
        let store = create_store();
        for i in 1..=3 {
            assert_eq!(put_json(&store, Tier::Working, "counter", json!(i)), i);
        }
        let history = store.history(&ns(), Tier::Working, "counter").unwrap();
        assert_eq!(
            history.iter().map(|h| h.revision).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let old = store.get_revision(&ns(), Tier::Working, "counter", 1).unwrap();
        assert_eq!(old.value, MemoryValue::structured(json!(1)));
    }

    #[test]
    fn test_large_values_are_compressed() {
        let store = create_store();
        let text = "the participant described the export flow as confusing. ".repeat(50);
        let value = MemoryValue::bytes(text.clone().into_bytes(), "text/plain");
        store
            .put(&ns(), Tier::LongTerm, "transcript", &value, BTreeMap::new())
            .unwrap();
        let record = store.get(&ns(), Tier::LongTerm, "transcript").unwrap();
        assert!(record.compressed);
        assert_eq!(record.value, value);
        assert_eq!(record.size_bytes, text.len());
    }

    #[test]
    fn test_delete_keeps_revision_numbering() {
        let store = create_store();
        put_json(&store, Tier::Working, "k", json!("a"));
        store.delete(&ns(), Tier::Working, "k").unwrap();
        assert!(matches!(
            store.get(&ns(), Tier::Working, "k"),
            Err(WeaveError::NotFound { .. })
        ));
        assert!(store.delete(&ns(), Tier::Working, "k").is_err());
        assert_eq!(put_json(&store, Tier::Working, "k", json!("b")), 2);
        assert_eq!(store.get(&ns(), Tier::Working, "k").unwrap().revision, 2);
    }

    #[test]
    fn test_list_keys_is_lazy_and_restartable() {
        let store = create_store();
        for i in 0..10 {
            put_json(&store, Tier::Working, &format!("item-{:02}", i), json!(i));
        }
        put_json(&store, Tier::Working, "other", json!(0));

        let mut iter = store.list_keys(&ns(), Tier::Working, "item-").unwrap();
        let first: Vec<String> = iter.by_ref().take(4).collect();
        assert_eq!(first, vec!["item-00", "item-01", "item-02", "item-03"]);
        let cursor = iter.cursor().map(str::to_string);
        drop(iter);

        let rest: Vec<String> = store
            .list_keys_after(&ns(), Tier::Working, "item-", cursor.as_deref())
            .unwrap()
            .collect();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0], "item-04");
    }

    #[test]
    fn test_list_keys_pages() {
        let store = create_store();
        for i in 0..(LIST_PAGE_SIZE + 10) {
            put_json(&store, Tier::ShortTerm, &format!("k{:05}", i), json!(i));
        }
        let keys: Vec<String> = store.list_keys(&ns(), Tier::ShortTerm, "").unwrap().collect();
        assert_eq!(keys.len(), LIST_PAGE_SIZE + 10);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_schema_violation_rejected() {
        let store = create_store();
        store
            .schemas()
            .register(&ns(), json!({"type": "object", "required": ["title"]}))
            .unwrap();
        let err = store
            .put(
                &ns(),
                Tier::Working,
                "bad",
                &MemoryValue::structured(json!({"body": "x"})),
                BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, WeaveError::SchemaViolation { .. }));
        assert!(!store.contains(&RecordKey::new(ns(), Tier::Working, "bad")));
    }

    #[test]
    fn test_concurrent_updates_same_key() {
        let store = Arc::new(create_store());
        let mut handles = vec![];
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store
                    .put(
                        &ns(),
                        Tier::Working,
                        "shared",
                        &MemoryValue::structured(json!(i)),
                        BTreeMap::new(),
                    )
                    .unwrap()
            }));
        }
        let mut revisions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        revisions.sort();
        assert_eq!(revisions, (1..=20).collect::<Vec<_>>());
        assert_eq!(store.history(&ns(), Tier::Working, "shared").unwrap().len(), 20);
        assert_eq!(store.get(&ns(), Tier::Working, "shared").unwrap().revision, 20);
    }

    #[test]
    fn test_promote_moves_record() {
        let store = create_store();
        put_json(&store, Tier::Working, "finding", json!({"severity": "high"}));
        let rev = store
            .promote(&ns(), "finding", Tier::Working, Tier::LongTerm)
            .unwrap();
        assert_eq!(rev, 1);
        assert!(store.get(&ns(), Tier::Working, "finding").is_err());
        let archived = store.get(&ns(), Tier::LongTerm, "finding").unwrap();
        assert_eq!(archived.metadata.get(PROMOTED_FROM).map(String::as_str), Some("working"));
        assert!(store.promote(&ns(), "finding", Tier::LongTerm, Tier::LongTerm).is_err());
    }

    #[test]
    fn test_expire_removes_stale_and_prunes_history() {
        let store = create_store();
        put_json(&store, Tier::ShortTerm, "stale", json!(1));
        put_json(&store, Tier::Working, "busy", json!(1));
        put_json(&store, Tier::Working, "busy", json!(2));
        put_json(&store, Tier::LongTerm, "forever", json!(1));

        let later = Utc::now() + chrono::Duration::days(31);
        let report = store.expire(later).unwrap();
        assert_eq!(report.removed_records, 1);
        assert!(store.get(&ns(), Tier::ShortTerm, "stale").is_err());
        assert!(store.get(&ns(), Tier::Working, "busy").is_ok());

        let much_later = Utc::now() + chrono::Duration::days(365 * 10);
        store.expire(much_later).unwrap();
        assert!(store.get(&ns(), Tier::Working, "busy").is_err());
        assert!(store.get(&ns(), Tier::LongTerm, "forever").is_ok());
    }

    #[test]
    fn test_expire_keeps_current_revision() {
        let store = TieredStore::new(
            Arc::new(CompressionEngine::default()),
            Arc::new(SchemaRegistry::new()),
            RetentionConfig {
                working: RetentionPeriod::Limited(std::time::Duration::from_secs(3600)),
                ..Default::default()
            },
        );
        put_json(&store, Tier::Working, "k", json!(1));
        put_json(&store, Tier::Working, "k", json!(2));
        let report = store.expire(Utc::now() + chrono::Duration::minutes(30)).unwrap();
        assert_eq!(report, ExpireReport::default());
        let history = store.history(&ns(), Tier::Working, "k").unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_quarantine_blocks_reads_and_writes() {
        let store = create_store();
        put_json(&store, Tier::Working, "k", json!(1));
        store.quarantine(&ns(), "test").unwrap();
        assert!(matches!(
            store.get(&ns(), Tier::Working, "k"),
            Err(WeaveError::Quarantined { .. })
        ));
        assert!(matches!(
            store.put(&ns(), Tier::Working, "k", &MemoryValue::structured(json!(2)), BTreeMap::new()),
            Err(WeaveError::Quarantined { .. })
        ));
        assert!(store.clear_quarantine(&ns()).unwrap());
        assert!(!store.clear_quarantine(&ns()).unwrap());
        assert_eq!(store.get(&ns(), Tier::Working, "k").unwrap().revision, 1);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let store = create_store();
        put_json(&store, Tier::Working, "k", json!({"a": 1}));
        assert!(store.verify(&ns()).is_empty());
        let record = RecordKey::new(ns(), Tier::Working, "k");
        assert!(store.tamper(&record, 1));
        let faults = store.verify(&ns());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].revision, 1);
        assert!(matches!(
            store.get(&ns(), Tier::Working, "k"),
            Err(WeaveError::CorruptData { .. })
        ));
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            put_json(&store, Tier::Working, "a", json!(1));
            put_json(&store, Tier::Working, "a", json!(2));
            put_json(&store, Tier::Working, "b", json!("x"));
            store.delete(&ns(), Tier::Working, "b").unwrap();
            store.quarantine(&"other/x/y".parse().unwrap(), "manual").unwrap();
        }

        let store = open_store(dir.path());
        let a = store.get(&ns(), Tier::Working, "a").unwrap();
        assert_eq!(a.revision, 2);
        assert_eq!(a.value, MemoryValue::structured(json!(2)));
        assert!(store.get(&ns(), Tier::Working, "b").is_err());
        assert!(store.is_quarantined(&"other/x/y".parse().unwrap()));
        assert!(store.journal_faults(&ns()).is_empty());
    }

    #[test]
    fn test_compact_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            for i in 0..5 {
                put_json(&store, Tier::Working, "a", json!(i));
            }
            store.discard_revisions(&RecordKey::new(ns(), Tier::Working, "a"), &[1, 2]).unwrap();
            assert_eq!(store.compact().unwrap(), 3);
        }
        let store = open_store(dir.path());
        let history = store.history(&ns(), Tier::Working, "a").unwrap();
        assert_eq!(history.iter().map(|h| h.revision).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_replace_namespace() {
        let store = create_store();
        put_json(&store, Tier::Working, "a", json!(1));
        let snapshot = store.export(Some(&ns()));
        put_json(&store, Tier::Working, "a", json!(2));
        put_json(&store, Tier::Working, "b", json!(3));

        assert_eq!(store.replace_namespace(&ns(), snapshot).unwrap(), 1);
        assert_eq!(store.get(&ns(), Tier::Working, "a").unwrap().revision, 1);
        assert!(store.get(&ns(), Tier::Working, "b").is_err());
    }

    #[test]
    fn test_replace_namespaces_rejects_all_on_bad_second() {
        let store = create_store();
        let other: Namespace = "acme/research/tags".parse().unwrap();
        put_json(&store, Tier::Working, "a", json!(1));
        store
            .put(&other, Tier::Working, "t", &MemoryValue::structured(json!("x")), BTreeMap::new())
            .unwrap();
        let first = store.export(Some(&ns()));
        let mut second = store.export(Some(&other));
        second[0].history.revisions.clear();
        put_json(&store, Tier::Working, "a", json!(2));

        let replacements = BTreeMap::from([(ns(), first), (other.clone(), second)]);
        let err = store.replace_namespaces(replacements).unwrap_err();
        assert!(err.to_string().contains("acme/research/tags"), "{err}");
        assert_eq!(store.get(&ns(), Tier::Working, "a").unwrap().revision, 2);
        assert_eq!(store.get(&other, Tier::Working, "t").unwrap().revision, 1);
    }

    #[test]
    fn test_replace_namespaces_rolls_back_when_compact_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let other: Namespace = "acme/research/tags".parse().unwrap();
        put_json(&store, Tier::Working, "a", json!(1));
        store
            .put(&other, Tier::Working, "t", &MemoryValue::structured(json!("x")), BTreeMap::new())
            .unwrap();
        let snapshot = BTreeMap::from([
            (ns(), store.export(Some(&ns()))),
            (other.clone(), store.export(Some(&other))),
        ]);
        put_json(&store, Tier::Working, "a", json!(2));
        store
            .put(&other, Tier::Working, "t", &MemoryValue::structured(json!("y")), BTreeMap::new())
            .unwrap();

        // A directory where the compacted journal would be written.
        std::fs::create_dir(dir.path().join(JOURNAL_FILE).with_extension("tmp")).unwrap();
        assert!(store.replace_namespaces(snapshot).is_err());

        assert_eq!(store.get(&ns(), Tier::Working, "a").unwrap().revision, 2);
        assert_eq!(store.get(&other, Tier::Working, "t").unwrap().revision, 2);
        drop(store);
        let reopened = open_store(dir.path());
        assert_eq!(reopened.get(&other, Tier::Working, "t").unwrap().revision, 2);
    }
}

/// Bounded LRU cache in front of the tiered store.
///
/// The cache is write-through: a write reaches the store before it is cached,
/// so evicting an entry (or losing the whole cache) can never lose data. The
/// cache is bounded by a total byte budget rather than an entry count.
///
/// ## Per-key serialization
///
/// Every operation on a `(namespace, tier, key)` takes that key's lock: reads
/// share it, writes hold it exclusively. Two batch items writing the same key
/// are therefore ordered, and a reader never caches a revision older than one
/// a concurrent writer just committed.
use crate::error::{WeaveError, WeaveResult};
use crate::storage::TieredStore;
use crate::types::{MemoryRecord, MemoryValue, Namespace, RecordKey, Tier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

/// Fixed per-entry overhead charged against the byte budget.
const ENTRY_OVERHEAD: usize = 64;

/// A cached record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: MemoryRecord,
    pub last_access: DateTime<Utc>,
    pub size_bytes: usize,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: usize,
    pub max_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Write-through LRU cache over a [`TieredStore`].
pub struct CacheLayer {
    store: Arc<TieredStore>,
    max_bytes: usize,
    entries: DashMap<RecordKey, CacheEntry>,
    /// Access order (front = most recent)
    order: Mutex<VecDeque<RecordKey>>,
    /// Per-key single-writer / multi-reader locks
    locks: DashMap<RecordKey, Arc<RwLock<()>>>,
    used_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheLayer {
    pub fn new(store: Arc<TieredStore>, max_bytes: usize) -> Self {
        Self {
            store,
            max_bytes,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            locks: DashMap::new(),
            used_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    /// Read a record, filling the cache from the store on a miss.
    pub fn get(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<MemoryRecord> {
        let record = RecordKey::new(namespace.clone(), tier, key);
        self.store.ensure_readable(namespace)?;

        self.with_key(&record, false, || {
            if let Some(mut hit) = self.entries.get_mut(&record) {
                hit.last_access = Utc::now();
                let value = hit.record.clone();
                drop(hit);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.touch(&record);
                return Ok(value);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            let fetched = self.store.get(namespace, tier, key)?;
            self.insert(fetched.clone());
            Ok(fetched)
        })
    }

    /// Write through to the store, then cache the new revision.
    pub fn put(
        &self,
        namespace: &Namespace,
        tier: Tier,
        key: &str,
        value: &MemoryValue,
        metadata: BTreeMap<String, String>,
    ) -> WeaveResult<u64> {
        let record = RecordKey::new(namespace.clone(), tier, key);
        self.with_key(&record, true, || {
            let written = self
                .store
                .put_record(namespace, tier, key, value, metadata)?;
            let revision = written.revision;
            self.insert(written);
            Ok(revision)
        })
    }

    /// Take back a revision this caller just wrote.
    pub fn revert(&self, record: &RecordKey, revision: u64) -> WeaveResult<()> {
        self.with_key(record, true, || {
            self.store.discard_revisions(record, &[revision])?;
            self.remove(record);
            Ok(())
        })
    }

    pub fn delete(&self, namespace: &Namespace, tier: Tier, key: &str) -> WeaveResult<()> {
        let record = RecordKey::new(namespace.clone(), tier, key);
        self.with_key(&record, true, || {
            self.store.delete(namespace, tier, key)?;
            self.remove(&record);
            Ok(())
        })
    }

    /// Promote through the store while holding both keys' write locks.
    pub fn promote(&self, namespace: &Namespace, key: &str, from: Tier, to: Tier) -> WeaveResult<u64> {
        let source = RecordKey::new(namespace.clone(), from, key);
        let target = RecordKey::new(namespace.clone(), to, key);
        // Fixed acquisition order so opposite promotions cannot deadlock.
        let (first, second) = if source <= target {
            (&source, &target)
        } else {
            (&target, &source)
        };
        self.with_key(first, true, || {
            self.with_key(second, true, || {
                let revision = self.store.promote(namespace, key, from, to)?;
                self.remove(&source);
                self.remove(&target);
                Ok(revision)
            })
        })
    }

    /// Cached copy of a record without touching LRU order or counters.
    pub fn peek(&self, record: &RecordKey) -> Option<MemoryRecord> {
        self.entries.get(record).map(|e| e.record.clone())
    }

    /// Every cached record belonging to a namespace.
    pub fn resident(&self, namespace: &Namespace) -> Vec<MemoryRecord> {
        let mut out: Vec<MemoryRecord> = self
            .entries
            .iter()
            .filter(|e| &e.key().namespace == namespace)
            .map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| (a.tier, &a.key).cmp(&(b.tier, &b.key)));
        out
    }

    pub fn contains(&self, record: &RecordKey) -> bool {
        self.entries.contains_key(record)
    }

    /// Drop one entry. Returns whether it was resident.
    pub fn evict(&self, record: &RecordKey) -> bool {
        let removed = self.remove(record);
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn invalidate_namespace(&self, namespace: &Namespace) {
        let keys: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(|e| &e.key().namespace == namespace)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        if let Ok(mut order) = self.order.lock() {
            order.clear();
        }
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            used_bytes: self.used_bytes(),
            max_bytes: self.max_bytes,
        }
    }

    fn with_key<T>(
        &self,
        record: &RecordKey,
        exclusive: bool,
        op: impl FnOnce() -> WeaveResult<T>,
    ) -> WeaveResult<T> {
        let lock = self
            .locks
            .entry(record.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();
        let poisoned = || WeaveError::Storage(format!("lock for {} poisoned", record));
        let result = if exclusive {
            let _guard = lock.write().map_err(|_| poisoned())?;
            op()
        } else {
            let _guard = lock.read().map_err(|_| poisoned())?;
            op()
        };
        drop(lock);
        self.locks
            .remove_if(record, |_, l| Arc::strong_count(l) == 1);
        result
    }

    fn insert(&self, record: MemoryRecord) {
        let key = record.record_key();
        let size_bytes = record.size_bytes + key.key.len() + ENTRY_OVERHEAD;
        if size_bytes > self.max_bytes {
            // Larger than the whole budget; serve it uncached.
            self.remove(&key);
            return;
        }

        let entry = CacheEntry {
            record,
            last_access: Utc::now(),
            size_bytes,
        };
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.used_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.used_bytes.fetch_add(size_bytes, Ordering::Relaxed);
        self.touch(&key);

        while self.used_bytes() > self.max_bytes {
            if !self.evict_lru(&key) {
                break;
            }
        }
    }

    fn remove(&self, record: &RecordKey) -> bool {
        match self.entries.remove(record) {
            Some((_, old)) => {
                self.used_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                if let Ok(mut order) = self.order.lock() {
                    order.retain(|k| k != record);
                }
                true
            }
            None => false,
        }
    }

    fn touch(&self, record: &RecordKey) {
        if let Ok(mut order) = self.order.lock() {
            order.retain(|k| k != record);
            order.push_front(record.clone());
        }
    }

    /// Evict the least recently used entry other than `keep`.
    fn evict_lru(&self, keep: &RecordKey) -> bool {
        let victim = match self.order.lock() {
            Ok(mut order) => {
                let pos = order.iter().rposition(|k| k != keep);
                pos.and_then(|p| order.remove(p))
            }
            Err(_) => None,
        };
        let Some(victim) = victim else {
            return false;
        };
        if let Some((_, old)) = self.entries.remove(&victim) {
            self.used_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(record = %victim, "evicted from cache");
        }
        true
    }
}

/// Scheduled, encrypted snapshots of the tiered store.
///
/// A snapshot captures a namespace (or the whole store) as a point-in-time
/// copy taken key by key, so foreground writers are never blocked for long.
///
/// ## Archive format
///
/// ```text
/// "TWBK" | format version (u8) | nonce (12 bytes) | ChaCha20-Poly1305(deflate(json))
/// ```
///
/// The encryption key is derived with HKDF-SHA256 from the configured
/// passphrase, or from a random key file created in the backup directory when
/// no passphrase is set. The snapshot id is bound as associated data, so an
/// archive cannot be swapped for another one. The manifest records the
/// SHA-256 of every archive file; restore checks it before anything else.
///
/// ## Retention
///
/// Each snapshot belongs to a retention class. After every snapshot the
/// oldest snapshots of that class beyond the configured count are deleted.
use crate::config::BackupConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::retry::retry;
use crate::storage::{StoredRecord, TieredStore};
use crate::types::Namespace;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

const ARCHIVE_MAGIC: &[u8; 4] = b"TWBK";
const ARCHIVE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const MANIFEST_FILE: &str = "manifest.json";
const KEY_FILE: &str = "backup.key";
const MANIFEST_VERSION: u32 = 1;

/// Retention class of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    Daily,
    Weekly,
    Monthly,
}

impl RetentionClass {
    /// Class for a scheduled run on `date`: the first of the month is monthly,
    /// Sundays are weekly, every other day is daily.
    pub fn for_date(date: NaiveDate) -> Self {
        if date.day() == 1 {
            RetentionClass::Monthly
        } else if date.weekday() == Weekday::Sun {
            RetentionClass::Weekly
        } else {
            RetentionClass::Daily
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetentionClass::Daily => "daily",
            RetentionClass::Weekly => "weekly",
            RetentionClass::Monthly => "monthly",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionClass {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RetentionClass::Daily),
            "weekly" => Ok(RetentionClass::Weekly),
            "monthly" => Ok(RetentionClass::Monthly),
            other => Err(WeaveError::Config(format!("unknown retention class '{}'", other))),
        }
    }
}

/// What a snapshot covers: one namespace, or everything (`*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SnapshotScope {
    All,
    Namespace(Namespace),
}

impl SnapshotScope {
    pub fn covers(&self, namespace: &Namespace) -> bool {
        match self {
            SnapshotScope::All => true,
            SnapshotScope::Namespace(ns) => ns == namespace,
        }
    }

    fn namespace(&self) -> Option<&Namespace> {
        match self {
            SnapshotScope::All => None,
            SnapshotScope::Namespace(ns) => Some(ns),
        }
    }
}

impl fmt::Display for SnapshotScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotScope::All => f.write_str("*"),
            SnapshotScope::Namespace(ns) => write!(f, "{}", ns),
        }
    }
}

impl FromStr for SnapshotScope {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" | "all" => Ok(SnapshotScope::All),
            ns => Ok(SnapshotScope::Namespace(ns.parse()?)),
        }
    }
}

impl TryFrom<String> for SnapshotScope {
    type Error = WeaveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotScope> for String {
    fn from(scope: SnapshotScope) -> Self {
        scope.to_string()
    }
}

/// Manifest entry for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub scope: SnapshotScope,
    pub created_at: DateTime<Utc>,
    pub retention_class: RetentionClass,
    pub encrypted: bool,
    pub storage_location: PathBuf,
    /// SHA-256 hex of the archive file
    pub checksum: String,
    pub records: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    snapshots: Vec<BackupSnapshot>,
}

/// Decrypted archive content.
#[derive(Debug, Serialize, Deserialize)]
struct Archive {
    id: String,
    scope: SnapshotScope,
    created_at: DateTime<Utc>,
    records: Vec<StoredRecord>,
}

/// Result of a restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    /// Namespaces replaced and the number of keys each now holds
    pub namespaces: Vec<(Namespace, usize)>,
}

/// Backup statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStats {
    pub snapshots_created: u64,
    pub restores: u64,
    pub failures: u64,
    pub alerts: u64,
    pub pruned: u64,
}

/// Creates, prunes and restores snapshots.
pub struct BackupManager {
    dir: PathBuf,
    config: BackupConfig,
    store: Arc<TieredStore>,
    key: [u8; 32],
    manifest: Mutex<Manifest>,
    created: AtomicU64,
    restores: AtomicU64,
    failures: AtomicU64,
    alerts: AtomicU64,
    pruned: AtomicU64,
}

impl BackupManager {
    /// Open the backup directory, loading its manifest.
    pub async fn open(dir: &Path, config: BackupConfig, store: Arc<TieredStore>) -> WeaveResult<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| WeaveError::Storage(format!("Failed to create backup directory: {}", e)))?;

        let secret = match &config.passphrase {
            Some(passphrase) => passphrase.as_bytes().to_vec(),
            None => load_or_create_key_file(&dir.join(KEY_FILE)).await?,
        };
        let key = derive_key(&secret)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = match fs::read(&manifest_path).await {
            Ok(bytes) => {
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                if manifest.version != MANIFEST_VERSION {
                    return Err(WeaveError::Storage(format!(
                        "Incompatible backup manifest version: {} (expected {})",
                        manifest.version, MANIFEST_VERSION
                    )));
                }
                manifest
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest {
                version: MANIFEST_VERSION,
                snapshots: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };
        debug!(dir = %dir.display(), snapshots = manifest.snapshots.len(), "backup manifest loaded");

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            store,
            key,
            manifest: Mutex::new(manifest),
            created: AtomicU64::new(0),
            restores: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot with the retention class chosen from today's date.
    pub async fn snapshot_now(&self, scope: SnapshotScope) -> WeaveResult<BackupSnapshot> {
        let class = RetentionClass::for_date(Utc::now().date_naive());
        self.snapshot(scope, class).await
    }

    /// Take a snapshot, retrying transient failures with backoff.
    ///
    /// Persistent failure raises an alert and returns `RetryExhausted`; the
    /// live store is unaffected either way.
    pub async fn snapshot(&self, scope: SnapshotScope, class: RetentionClass) -> WeaveResult<BackupSnapshot> {
        let attempt = retry("backup snapshot", &self.config.retry, || {
            let scope = scope.clone();
            async move {
                self.create_snapshot(scope, class).await.inspect_err(|_| {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                })
            }
        })
        .await;

        match attempt {
            Ok((snapshot, _)) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    id = %snapshot.id,
                    scope = %snapshot.scope,
                    class = %class,
                    records = snapshot.records,
                    "snapshot created"
                );
                self.prune_class(class).await?;
                Ok(snapshot)
            }
            Err(e) => {
                self.alerts.fetch_add(1, Ordering::Relaxed);
                error!(scope = %scope, error = %e, "ALERT: backup failed persistently");
                Err(e)
            }
        }
    }

    async fn create_snapshot(&self, scope: SnapshotScope, class: RetentionClass) -> WeaveResult<BackupSnapshot> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let records = self.store.export(scope.namespace());
        let count = records.len();
        let archive = Archive {
            id: id.clone(),
            scope: scope.clone(),
            created_at,
            records,
        };

        let body = self.seal(&archive)?;
        let checksum = hex::encode(Sha256::digest(&body));
        let location = self.dir.join(format!("{}.twbk", id));
        write_atomic(&location, &body).await?;

        let snapshot = BackupSnapshot {
            id,
            scope,
            created_at,
            retention_class: class,
            encrypted: true,
            storage_location: location,
            checksum,
            records: count,
            size_bytes: body.len() as u64,
        };

        let mut manifest = self.manifest.lock().await;
        manifest.snapshots.push(snapshot.clone());
        self.save_manifest(&manifest).await?;
        Ok(snapshot)
    }

    /// Snapshots in creation order, oldest first.
    pub async fn list(&self) -> Vec<BackupSnapshot> {
        let manifest = self.manifest.lock().await;
        let mut snapshots = manifest.snapshots.clone();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Snapshots covering `namespace`, newest first.
    pub async fn candidates_for(&self, namespace: &Namespace) -> Vec<BackupSnapshot> {
        let mut snapshots: Vec<BackupSnapshot> = self
            .list()
            .await
            .into_iter()
            .filter(|s| s.scope.covers(namespace))
            .collect();
        snapshots.reverse();
        snapshots
    }

    /// Restore every namespace a snapshot covers.
    ///
    /// The archive is fully verified (file checksum, decryption and every
    /// stored revision) before any live state is replaced; a bad snapshot
    /// fails with `BackupCorrupt` and leaves the store untouched.
    pub async fn restore(&self, snapshot_id: &str) -> WeaveResult<RestoreOutcome> {
        let archive = self.load_verified(snapshot_id).await?;
        let targets: BTreeSet<Namespace> = match &archive.scope {
            SnapshotScope::Namespace(ns) => [ns.clone()].into(),
            SnapshotScope::All => {
                let mut all = self.store.namespaces();
                all.extend(archive.records.iter().map(|r| r.record.namespace.clone()));
                all
            }
        };
        self.apply(archive, targets).await
    }

    /// Restore a single namespace from a snapshot that covers it.
    pub async fn restore_namespace(&self, snapshot_id: &str, namespace: &Namespace) -> WeaveResult<RestoreOutcome> {
        let archive = self.load_verified(snapshot_id).await?;
        if !archive.scope.covers(namespace) {
            return Err(WeaveError::BackupCorrupt {
                snapshot_id: snapshot_id.to_string(),
                reason: format!("snapshot does not cover {}", namespace),
            });
        }
        self.apply(archive, [namespace.clone()].into()).await
    }

    /// Check a snapshot end to end without applying it. Returns its key count.
    pub async fn verify(&self, snapshot_id: &str) -> WeaveResult<usize> {
        Ok(self.load_verified(snapshot_id).await?.records.len())
    }

    async fn apply(&self, archive: Archive, targets: BTreeSet<Namespace>) -> WeaveResult<RestoreOutcome> {
        let replacements: BTreeMap<Namespace, Vec<StoredRecord>> = targets
            .into_iter()
            .map(|namespace| {
                let records = archive
                    .records
                    .iter()
                    .filter(|r| r.record.namespace == namespace)
                    .cloned()
                    .collect();
                (namespace, records)
            })
            .collect();
        let namespaces = self.store.replace_namespaces(replacements)?;
        self.restores.fetch_add(1, Ordering::Relaxed);
        info!(id = %archive.id, namespaces = namespaces.len(), "snapshot restored");
        Ok(RestoreOutcome {
            snapshot_id: archive.id,
            namespaces,
        })
    }

    async fn load_verified(&self, snapshot_id: &str) -> WeaveResult<Archive> {
        let corrupt = |reason: String| WeaveError::BackupCorrupt {
            snapshot_id: snapshot_id.to_string(),
            reason,
        };
        let snapshot = {
            let manifest = self.manifest.lock().await;
            manifest
                .snapshots
                .iter()
                .find(|s| s.id == snapshot_id)
                .cloned()
                .ok_or_else(|| WeaveError::Storage(format!("unknown snapshot '{}'", snapshot_id)))?
        };

        let body = fs::read(&snapshot.storage_location)
            .await
            .map_err(|e| corrupt(format!("unreadable archive: {}", e)))?;
        let checksum = hex::encode(Sha256::digest(&body));
        if checksum != snapshot.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }

        let archive = self.open_sealed(snapshot_id, &body).map_err(|e| corrupt(e.to_string()))?;
        if archive.id != snapshot_id {
            return Err(corrupt(format!("archive holds snapshot '{}'", archive.id)));
        }
        for stored in &archive.records {
            for revision in &stored.history.revisions {
                self.store
                    .decode_verified(&stored.record, revision)
                    .map_err(|e| corrupt(format!("{}: {}", stored.record, e)))?;
            }
        }
        trace!(id = snapshot_id, records = archive.records.len(), "snapshot verified");
        Ok(archive)
    }

    /// Delete the oldest snapshots of every class beyond its keep count.
    pub async fn prune(&self) -> WeaveResult<Vec<String>> {
        let mut removed = Vec::new();
        for class in [RetentionClass::Daily, RetentionClass::Weekly, RetentionClass::Monthly] {
            removed.extend(self.prune_class(class).await?);
        }
        Ok(removed)
    }

    async fn prune_class(&self, class: RetentionClass) -> WeaveResult<Vec<String>> {
        let keep = match class {
            RetentionClass::Daily => self.config.keep_daily,
            RetentionClass::Weekly => self.config.keep_weekly,
            RetentionClass::Monthly => self.config.keep_monthly,
        };

        let mut manifest = self.manifest.lock().await;
        let mut in_class: Vec<(DateTime<Utc>, String)> = manifest
            .snapshots
            .iter()
            .filter(|s| s.retention_class == class)
            .map(|s| (s.created_at, s.id.clone()))
            .collect();
        if in_class.len() <= keep {
            return Ok(Vec::new());
        }
        in_class.sort();
        let excess = in_class.len() - keep;
        let doomed: Vec<String> = in_class.into_iter().take(excess).map(|(_, id)| id).collect();

        for id in &doomed {
            if let Some(pos) = manifest.snapshots.iter().position(|s| &s.id == id) {
                let snapshot = manifest.snapshots.remove(pos);
                if let Err(e) = fs::remove_file(&snapshot.storage_location).await {
                    warn!(id = %id, error = %e, "failed to delete pruned snapshot file");
                }
            }
        }
        self.save_manifest(&manifest).await?;
        self.pruned.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        debug!(class = %class, pruned = doomed.len(), "pruned snapshots");
        Ok(doomed)
    }

    pub fn stats(&self) -> BackupStats {
        BackupStats {
            snapshots_created: self.created.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }

    /// Spawn the scheduled backup loop. Failures are logged and counted; the
    /// loop keeps running.
    pub fn spawn_schedule(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.interval.get();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately; skip it so startup does
            // not snapshot.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                trace!("Running scheduled backup");
                if let Err(e) = manager.snapshot_now(SnapshotScope::All).await {
                    warn!(error = %e, "scheduled backup failed");
                }
            }
        })
    }

    async fn save_manifest(&self, manifest: &Manifest) -> WeaveResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.dir.join(MANIFEST_FILE), &bytes).await
    }

    fn seal(&self, archive: &Archive) -> WeaveResult<Vec<u8>> {
        let json = serde_json::to_vec(archive)?;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let deflated = encoder.finish()?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &deflated,
                    aad: archive.id.as_bytes(),
                },
            )
            .map_err(|_| WeaveError::Storage("snapshot encryption failed".into()))?;

        let mut body = Vec::with_capacity(ARCHIVE_MAGIC.len() + 1 + NONCE_LEN + ciphertext.len());
        body.extend_from_slice(ARCHIVE_MAGIC);
        body.push(ARCHIVE_VERSION);
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    fn open_sealed(&self, snapshot_id: &str, body: &[u8]) -> WeaveResult<Archive> {
        let header = ARCHIVE_MAGIC.len() + 1 + NONCE_LEN;
        if body.len() < header || &body[..4] != ARCHIVE_MAGIC {
            return Err(WeaveError::corrupt("missing archive header"));
        }
        if body[4] != ARCHIVE_VERSION {
            return Err(WeaveError::corrupt(format!("unsupported archive version {}", body[4])));
        }
        let nonce = Nonce::from_slice(&body[5..header]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let deflated = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &body[header..],
                    aad: snapshot_id.as_bytes(),
                },
            )
            .map_err(|_| WeaveError::corrupt("decryption failed (wrong key or tampered archive)"))?;

        let mut json = Vec::new();
        DeflateDecoder::new(deflated.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| WeaveError::corrupt(format!("archive stream: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| WeaveError::corrupt(format!("archive body: {}", e)))
    }
}

fn derive_key(secret: &[u8]) -> WeaveResult<[u8; 32]> {
    let salt = Sha256::digest(b"tierweave-backup");
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"tierweave-snapshot-v1", &mut key)
        .map_err(|_| WeaveError::Config("backup key derivation failed".into()))?;
    Ok(key)
}

async fn load_or_create_key_file(path: &Path) -> WeaveResult<Vec<u8>> {
    match fs::read_to_string(path).await {
        Ok(text) => hex::decode(text.trim())
            .map_err(|e| WeaveError::Config(format!("invalid backup key file: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            write_atomic(path, hex::encode(&secret).as_bytes()).await?;
            info!(path = %path.display(), "generated backup key");
            Ok(secret)
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> WeaveResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)
        .await
        .map_err(|e| WeaveError::Storage(format!("Failed to write temporary file: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| WeaveError::Storage(format!("Failed to rename file: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionEngine;
    use crate::config::RetentionConfig;
    use crate::retry::RetryPolicy;
    use crate::schema::SchemaRegistry;
    use crate::types::{MemoryValue, Tier};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn ns() -> Namespace {
        "acme/research/notes".parse().unwrap()
    }

    fn store() -> Arc<TieredStore> {
        Arc::new(TieredStore::new(
            Arc::new(CompressionEngine::default()),
            Arc::new(SchemaRegistry::new()),
            RetentionConfig::default(),
        ))
    }

    fn config() -> BackupConfig {
        BackupConfig {
            passphrase: Some("correct horse".into()),
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        }
    }

    fn put(store: &TieredStore, key: &str, value: serde_json::Value) {
        store
            .put(&ns(), Tier::Working, key, &MemoryValue::structured(value), BTreeMap::new())
            .unwrap();
    }

    #[test]
    fn test_retention_class_for_date() {
        let first = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let sunday = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 9, 9).unwrap();
        assert_eq!(RetentionClass::for_date(first), RetentionClass::Monthly);
        assert_eq!(RetentionClass::for_date(sunday), RetentionClass::Weekly);
        assert_eq!(RetentionClass::for_date(monday), RetentionClass::Daily);
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("*".parse::<SnapshotScope>().unwrap(), SnapshotScope::All);
        assert_eq!(
            "acme/research/notes".parse::<SnapshotScope>().unwrap(),
            SnapshotScope::Namespace(ns())
        );
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!({"v": 1}));
        let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store))
            .await
            .unwrap();

        let snapshot = manager
            .snapshot(SnapshotScope::Namespace(ns()), RetentionClass::Daily)
            .await
            .unwrap();
        assert!(snapshot.encrypted);
        assert_eq!(snapshot.records, 1);
        assert!(snapshot.storage_location.exists());

        put(&store, "a", json!({"v": 2}));
        put(&store, "b", json!({"v": 3}));

        let outcome = manager.restore(&snapshot.id).await.unwrap();
        assert_eq!(outcome.namespaces, vec![(ns(), 1)]);
        let a = store.get(&ns(), Tier::Working, "a").unwrap();
        assert_eq!(a.value, MemoryValue::structured(json!({"v": 1})));
        assert!(store.get(&ns(), Tier::Working, "b").is_err());
    }

    #[tokio::test]
    async fn test_archive_is_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "secret", json!({"token": "hunter2-hunter2-hunter2"}));
        let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store))
            .await
            .unwrap();
        let snapshot = manager.snapshot(SnapshotScope::All, RetentionClass::Daily).await.unwrap();
        let body = std::fs::read(&snapshot.storage_location).unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("secret"));
    }

    #[tokio::test]
    async fn test_tampered_archive_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!(1));
        let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store))
            .await
            .unwrap();
        let snapshot = manager.snapshot(SnapshotScope::All, RetentionClass::Daily).await.unwrap();

        put(&store, "a", json!(2));
        let mut body = std::fs::read(&snapshot.storage_location).unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        std::fs::write(&snapshot.storage_location, body).unwrap();

        let err = manager.restore(&snapshot.id).await.unwrap_err();
        assert!(matches!(err, WeaveError::BackupCorrupt { .. }));
        // Live state untouched.
        assert_eq!(store.get(&ns(), Tier::Working, "a").unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails_closed() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!(1));
        let snapshot = {
            let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store))
                .await
                .unwrap();
            manager.snapshot(SnapshotScope::All, RetentionClass::Daily).await.unwrap()
        };

        let other = BackupConfig {
            passphrase: Some("wrong".into()),
            ..config()
        };
        let manager = BackupManager::open(dir.path(), other, Arc::clone(&store)).await.unwrap();
        let err = manager.verify(&snapshot.id).await.unwrap_err();
        assert!(matches!(err, WeaveError::BackupCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_generated_key_file_is_reused() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!(1));
        let no_passphrase = BackupConfig {
            passphrase: None,
            ..config()
        };
        let snapshot = {
            let manager = BackupManager::open(dir.path(), no_passphrase.clone(), Arc::clone(&store))
                .await
                .unwrap();
            manager.snapshot(SnapshotScope::All, RetentionClass::Daily).await.unwrap()
        };
        assert!(dir.path().join(KEY_FILE).exists());
        let manager = BackupManager::open(dir.path(), no_passphrase, Arc::clone(&store)).await.unwrap();
        assert_eq!(manager.verify(&snapshot.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest_per_class() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!(1));
        let manager = BackupManager::open(
            dir.path(),
            BackupConfig {
                keep_daily: 3,
                keep_weekly: 1,
                ..config()
            },
            Arc::clone(&store),
        )
        .await
        .unwrap();

        let mut daily = Vec::new();
        for _ in 0..5 {
            daily.push(manager.snapshot(SnapshotScope::All, RetentionClass::Daily).await.unwrap());
        }
        manager.snapshot(SnapshotScope::All, RetentionClass::Weekly).await.unwrap();

        let remaining = manager.list().await;
        let remaining_daily: Vec<&str> = remaining
            .iter()
            .filter(|s| s.retention_class == RetentionClass::Daily)
            .map(|s| s.id.as_str())
            .collect();
        let expected: Vec<&str> = daily[2..].iter().map(|s| s.id.as_str()).collect();
        assert_eq!(remaining_daily, expected);
        assert!(!daily[0].storage_location.exists());
        assert_eq!(manager.stats().pruned, 2);
    }

    #[tokio::test]
    async fn test_manifest_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store();
        put(&store, "a", json!(1));
        {
            let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store)).await.unwrap();
            manager.snapshot(SnapshotScope::All, RetentionClass::Monthly).await.unwrap();
        }
        let manager = BackupManager::open(dir.path(), config(), Arc::clone(&store)).await.unwrap();
        let list = manager.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].retention_class, RetentionClass::Monthly);
        assert_eq!(manager.candidates_for(&ns()).await.len(), 1);
    }
}

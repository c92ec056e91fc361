/// Append-only journal backing the tiered store.
///
/// Every committed revision, deletion, pruning and quarantine change is
/// appended to `journal.log` as one line. Opening a store on a directory
/// replays the journal to rebuild in-memory state.
///
/// # Line Format
///
/// ```text
/// <crc32 of json, 8 hex digits> TAB <namespace> TAB <json entry>
/// ```
///
/// The namespace is kept outside the JSON body so a damaged line can still be
/// attributed to the namespace it belonged to. Lines whose checksum does not
/// match are skipped and reported as faults.
///
/// # Compaction
///
/// [`Journal::compact`] rewrites the journal from a point-in-time copy of the
/// store: the new content is written to a temporary file which is then
/// renamed over the old one.
use crate::error::{WeaveError, WeaveResult};
use crate::retry::{RetryPolicy, retry_blocking};
use crate::types::{Namespace, RecordKey, Revision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// File name of the journal inside a data directory.
pub const JOURNAL_FILE: &str = "journal.log";

/// One journaled state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Put {
        record: RecordKey,
        revision: Revision,
    },
    /// Tombstone: the key is deleted unless a revision newer than
    /// `after_revision` exists
    Delete {
        record: RecordKey,
        after_revision: u64,
        at: DateTime<Utc>,
    },
    /// Drop specific revisions of a key
    Prune {
        record: RecordKey,
        revisions: Vec<u64>,
    },
    /// Drop a key and its whole history
    Purge { record: RecordKey },
    Quarantine {
        namespace: Namespace,
        reason: String,
    },
    ClearQuarantine { namespace: Namespace },
}

impl JournalEntry {
    pub fn namespace(&self) -> &Namespace {
        match self {
            JournalEntry::Put { record, .. }
            | JournalEntry::Delete { record, .. }
            | JournalEntry::Prune { record, .. }
            | JournalEntry::Purge { record } => &record.namespace,
            JournalEntry::Quarantine { namespace, .. }
            | JournalEntry::ClearQuarantine { namespace } => namespace,
        }
    }
}

/// A journal line that could not be applied on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalFault {
    /// 1-based line number in the journal at open time
    pub line: usize,
    /// Namespace the line belonged to, when still readable
    pub namespace: Option<Namespace>,
    /// Record the line belonged to, when the body still parsed
    pub record: Option<RecordKey>,
    pub reason: String,
}

/// Result of replaying a journal.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<JournalEntry>,
    pub faults: Vec<JournalFault>,
}

/// Journal statistics.
#[derive(Debug, Clone, Default)]
pub struct JournalStats {
    pub appended: u64,
    pub compactions: u64,
}

/// Handle to an open journal file.
pub struct Journal {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    retry: RetryPolicy,
    appended: AtomicU64,
    compactions: AtomicU64,
}

impl Journal {
    /// Open (creating if needed) the journal in `dir` and replay its contents.
    pub fn open(dir: &Path, retry: RetryPolicy) -> WeaveResult<(Self, Replay)> {
        fs::create_dir_all(dir)
            .map_err(|e| WeaveError::Storage(format!("Failed to create directory: {}", e)))?;
        let path = dir.join(JOURNAL_FILE);

        let replay = if path.exists() {
            read_entries(&path)?
        } else {
            Replay::default()
        };
        if !replay.faults.is_empty() {
            warn!(
                path = %path.display(),
                faults = replay.faults.len(),
                "journal replay skipped corrupt lines"
            );
        }
        info!(
            path = %path.display(),
            entries = replay.entries.len(),
            "journal opened"
        );

        let file = open_append(&path)?;
        Ok((
            Self {
                path,
                file: Mutex::new(BufWriter::new(file)),
                retry,
                appended: AtomicU64::new(0),
                compactions: AtomicU64::new(0),
            },
            replay,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it, retrying transient I/O failures.
    pub fn append(&self, entry: &JournalEntry) -> WeaveResult<()> {
        let line = encode_line(entry)?;
        retry_blocking("journal append", &self.retry, || {
            let mut file = self
                .file
                .lock()
                .map_err(|_| WeaveError::Storage("journal lock poisoned".into()))?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
            Ok(())
        })?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically replace the journal with `entries`.
    ///
    /// `entries` is produced while the journal lock is held, so no append can
    /// land between the copy and the rename.
    pub fn compact<F>(&self, entries: F) -> WeaveResult<usize>
    where
        F: FnOnce() -> Vec<JournalEntry>,
    {
        let mut file = self
            .file
            .lock()
            .map_err(|_| WeaveError::Storage("journal lock poisoned".into()))?;
        file.flush()?;

        let entries = entries();
        let temp_path = self.path.with_extension("tmp");
        {
            let temp = File::create(&temp_path).map_err(|e| {
                WeaveError::Storage(format!("Failed to write temporary file: {}", e))
            })?;
            let mut writer = BufWriter::new(temp);
            for entry in &entries {
                writer.write_all(encode_line(entry)?.as_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)
            .map_err(|e| WeaveError::Storage(format!("Failed to rename file: {}", e)))?;

        *file = BufWriter::new(open_append(&self.path)?);
        self.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), entries = entries.len(), "journal compacted");
        Ok(entries.len())
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            appended: self.appended.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

fn open_append(path: &Path) -> WeaveResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| WeaveError::Storage(format!("Failed to open journal: {}", e)))
}

fn encode_line(entry: &JournalEntry) -> WeaveResult<String> {
    let body = serde_json::to_string(entry)?;
    Ok(format!(
        "{:08x}\t{}\t{}\n",
        crc32fast::hash(body.as_bytes()),
        entry.namespace(),
        body
    ))
}

/// Read every line of a journal file, separating good entries from faults.
pub fn read_entries(path: &Path) -> WeaveResult<Replay> {
    let file = File::open(path)
        .map_err(|e| WeaveError::Storage(format!("Failed to read journal: {}", e)))?;
    let mut replay = Replay::default();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                replay.faults.push(JournalFault {
                    line: line_no,
                    namespace: None,
                    record: None,
                    reason: format!("unreadable line: {}", e),
                });
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(entry) => replay.entries.push(entry),
            Err(mut fault) => {
                fault.line = line_no;
                replay.faults.push(fault);
            }
        }
    }
    Ok(replay)
}

fn decode_line(line: &str) -> Result<JournalEntry, JournalFault> {
    let mut parts = line.splitn(3, '\t');
    let crc = parts.next().unwrap_or_default();
    let namespace = parts.next().and_then(|ns| ns.parse::<Namespace>().ok());
    let fault = |record: Option<RecordKey>, reason: String| JournalFault {
        line: 0,
        namespace: namespace.clone(),
        record,
        reason,
    };

    let Some(body) = parts.next() else {
        return Err(fault(None, "truncated line".into()));
    };
    let parsed: Result<JournalEntry, _> = serde_json::from_str(body);
    let record = parsed.as_ref().ok().and_then(|entry| match entry {
        JournalEntry::Put { record, .. }
        | JournalEntry::Delete { record, .. }
        | JournalEntry::Prune { record, .. }
        | JournalEntry::Purge { record } => Some(record.clone()),
        _ => None,
    });

    let expected = u32::from_str_radix(crc, 16).map_err(|_| fault(record.clone(), "bad checksum field".into()))?;
    if crc32fast::hash(body.as_bytes()) != expected {
        return Err(fault(record, "checksum mismatch".into()));
    }
    let entry = parsed.map_err(|e| fault(None, format!("unparseable entry: {}", e)))?;
    if Some(entry.namespace()) != namespace.as_ref() {
        return Err(fault(record, "namespace column does not match entry".into()));
    }
    Ok(entry)
}

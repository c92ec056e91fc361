/// Directory polling that turns new or changed files into batch jobs.
///
/// Patterns are globs relative to the watched root: `*` and `?` stay inside
/// one path segment, `**` crosses segments and `{a,b}` picks alternatives.
/// Ignore patterns are also applied to directories, so an ignored directory
/// is never descended into.
use crate::batch::{BatchCoordinator, BatchJob};
use crate::config::WatchConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::recipe::Recipe;
use crate::types::Namespace;
use crate::workflow::RunInput;
use regex::Regex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Translate a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> WeaveResult<Regex> {
    let mut out = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    let mut in_braces = false;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' if !in_braces => {
                in_braces = true;
                out.push_str("(?:");
            }
            '}' if in_braces => {
                in_braces = false;
                out.push(')');
            }
            ',' if in_braces => out.push('|'),
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| WeaveError::Config(format!("unclosed '[' in glob '{}'", glob)))?;
                let class: String = chars[i + 1..i + end].iter().collect();
                let class = class.strip_prefix('!').map(|c| format!("^{}", c)).unwrap_or(class);
                out.push('[');
                out.push_str(&class);
                out.push(']');
                i += end + 1;
                continue;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    if in_braces {
        return Err(WeaveError::Config(format!("unclosed '{{' in glob '{}'", glob)));
    }
    out.push('$');
    Regex::new(&out).map_err(|e| WeaveError::Config(format!("invalid glob '{}': {}", glob, e)))
}

#[derive(Debug, Clone)]
struct PatternSet {
    include: Vec<Regex>,
    ignore: Vec<Regex>,
}

impl PatternSet {
    fn new(config: &WatchConfig) -> WeaveResult<Self> {
        Ok(Self {
            include: config.patterns.iter().map(|g| glob_to_regex(g)).collect::<WeaveResult<_>>()?,
            ignore: config.ignore.iter().map(|g| glob_to_regex(g)).collect::<WeaveResult<_>>()?,
        })
    }

    fn ignored(&self, relative: &str) -> bool {
        self.ignore.iter().any(|r| r.is_match(relative))
    }

    fn matches(&self, relative: &str) -> bool {
        !self.ignored(relative) && self.include.iter().any(|r| r.is_match(relative))
    }
}

pub struct DirectoryWatcher {
    root: PathBuf,
    patterns: PatternSet,
    config: WatchConfig,
    /// Modification time last seen per file
    seen: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl DirectoryWatcher {
    pub fn new(root: impl Into<PathBuf>, config: WatchConfig) -> WeaveResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(WeaveError::Config(format!("watch root {} is not a directory", root.display())));
        }
        Ok(Self {
            patterns: PatternSet::new(&config)?,
            root,
            config,
            seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files remembered from the last scan.
    pub fn tracked(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    /// Files that appeared or changed since the previous scan, sorted. The
    /// first scan returns everything that matches.
    pub fn scan(&self) -> WeaveResult<Vec<PathBuf>> {
        let mut walker = WalkDir::new(&self.root).min_depth(1).follow_links(false);
        if !self.config.recursive {
            walker = walker.max_depth(1);
        }

        let mut found = Vec::new();
        let entries = walker.into_iter().filter_entry(|entry| {
            !entry.file_type().is_dir()
                || relative(&self.root, entry.path()).is_none_or(|rel| !self.patterns.ignored(&rel))
        });
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable watch entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative(&self.root, entry.path()) else {
                continue;
            };
            if !self.patterns.matches(&rel) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((entry.into_path(), modified));
        }

        let mut seen = self
            .seen
            .lock()
            .map_err(|_| WeaveError::Storage("watch state lock poisoned".into()))?;
        // Forget files that are gone, so a re-created file counts as new.
        let present: HashSet<&PathBuf> = found.iter().map(|(path, _)| path).collect();
        seen.retain(|path, _| present.contains(path));
        let mut fresh: Vec<PathBuf> = found
            .into_iter()
            .filter_map(|(path, modified)| match seen.insert(path.clone(), modified) {
                Some(previous) if previous >= modified => None,
                _ => Some(path),
            })
            .collect();
        fresh.sort();
        trace!(root = %self.root.display(), fresh = fresh.len(), "watch scan");
        Ok(fresh)
    }

    /// Batch inputs for a set of files: the id is the root-relative path.
    pub fn inputs(&self, files: &[PathBuf]) -> Vec<RunInput> {
        files
            .iter()
            .filter_map(|path| {
                let rel = relative(&self.root, path)?;
                Some(RunInput::new(
                    rel.clone(),
                    json!({"path": path.display().to_string(), "relative": rel}),
                ))
            })
            .collect()
    }

    /// Scan once and submit a job for whatever is new.
    pub async fn poll(
        &self,
        coordinator: &BatchCoordinator,
        recipe: &Arc<Recipe>,
        namespace: &Namespace,
    ) -> WeaveResult<Option<BatchJob>> {
        let files = self.scan()?;
        if files.is_empty() {
            return Ok(None);
        }
        let job = coordinator
            .submit(Arc::clone(recipe), namespace, self.inputs(&files), None)
            .await?;
        info!(root = %self.root.display(), job = %job.id, files = files.len(), "watch submitted batch");
        Ok(Some(job))
    }

    /// Poll on the configured interval until `shutdown` is set.
    pub fn spawn(
        self: Arc<Self>,
        coordinator: Arc<BatchCoordinator>,
        recipe: Arc<Recipe>,
        namespace: Namespace,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval.get());
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    debug!(root = %self.root.display(), "watcher stopping");
                    break;
                }
                if let Err(e) = self.poll(&coordinator, &recipe, &namespace).await {
                    warn!(root = %self.root.display(), error = %e, "watch poll failed");
                }
            }
        })
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// tweave - tierweave command line tool
///
/// Operates on a journal-backed store under a data directory, with backups
/// kept alongside it.
///
/// Usage:
///   tweave put <namespace> <key> <value>     - Store a JSON value
///   tweave get <namespace> <key>             - Read the current revision
///   tweave history <namespace> <key>         - Show retained revisions
///   tweave list [namespace]                  - List namespaces or keys
///   tweave search <query>                    - Search stored memory
///   tweave snapshot [scope]                  - Take a backup
///   tweave check <namespace>                 - Validate a namespace
///   tweave status                            - Show engine statistics
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tierweave::{
    MemoryValue, Namespace, Recipe, SearchOptions, SearchQuery, SnapshotScope, Tier, Weave,
    WeaveConfig, WeaveError,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the backup passphrase.
const PASSPHRASE_ENV: &str = "TWEAVE_BACKUP_PASSPHRASE";

/// tweave - tiered memory with backups and integrity recovery
#[derive(Parser)]
#[command(name = "tweave")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.tierweave/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: ~/.tierweave/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug detail to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a value
    ///
    /// Examples:
    ///   tweave put acme/research/notes p1 '{"quote": "pricing is confusing"}'
    ///   tweave put acme/research/notes draft --tier short_term '"todo"'
    ///   tweave put acme/research/audio a1 --file a1.wav --mime audio/wav
    Put {
        namespace: Namespace,
        key: String,

        /// Value to store (JSON); omit when using --file
        value: Option<String>,

        #[arg(short, long, default_value = "working")]
        tier: Tier,

        /// Store the file's bytes as an unstructured value
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Mime type for --file
        #[arg(short, long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Read the current revision of a key
    ///
    /// Examples:
    ///   tweave get acme/research/notes p1
    ///   tweave get acme/research/notes p1 --tier long_term --meta
    Get {
        namespace: Namespace,
        key: String,

        #[arg(short, long, default_value = "working")]
        tier: Tier,

        /// Show revision metadata
        #[arg(short, long)]
        meta: bool,
    },

    /// Delete a key
    Delete {
        namespace: Namespace,
        key: String,

        #[arg(short, long, default_value = "working")]
        tier: Tier,
    },

    /// Show the retained revisions of a key
    History {
        namespace: Namespace,
        key: String,

        #[arg(short, long, default_value = "working")]
        tier: Tier,

        /// Limit number of entries shown
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List namespaces, or the keys of one namespace
    ///
    /// Examples:
    ///   tweave list
    ///   tweave list acme/research/notes --tier long_term --prefix p
    List {
        namespace: Option<Namespace>,

        #[arg(short, long, default_value = "working")]
        tier: Tier,

        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Search stored memory
    ///
    /// Examples:
    ///   tweave search "pricing is confusing"
    ///   tweave search 'pric(e|ing)' --regex --tier working
    ///   tweave search --field persona=designer --field 'quote="love it"'
    Search {
        /// Text (or regex with --regex); omit when using --field
        query: Option<String>,

        /// Treat the query as a regular expression
        #[arg(short, long)]
        regex: bool,

        /// Field criterion `name=value`; the value is parsed as JSON when possible
        #[arg(short, long)]
        field: Vec<String>,

        #[arg(short, long)]
        namespace: Option<Namespace>,

        #[arg(short, long)]
        tier: Option<Tier>,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
    },

    /// Move a key to another tier
    ///
    /// Example:
    ///   tweave promote acme/research/notes p1 --from working --to long_term
    Promote {
        namespace: Namespace,
        key: String,

        #[arg(long, default_value = "working")]
        from: Tier,

        #[arg(long, default_value = "long_term")]
        to: Tier,
    },

    /// Apply tier retention and compact the journal
    Gc,

    /// Take a backup snapshot
    ///
    /// Examples:
    ///   tweave snapshot
    ///   tweave snapshot acme/research/notes
    Snapshot {
        /// Namespace, or `*` for everything
        #[arg(default_value = "*")]
        scope: SnapshotScope,
    },

    /// List backup snapshots
    Backups,

    /// Restore a snapshot
    ///
    /// Examples:
    ///   tweave restore 20261018T120000000Z-1a2b3c4d
    ///   tweave restore 20261018T120000000Z-1a2b3c4d --namespace acme/research/notes
    Restore {
        snapshot_id: String,

        /// Restore only this namespace
        #[arg(short, long)]
        namespace: Option<Namespace>,
    },

    /// Validate a namespace
    Check { namespace: Namespace },

    /// Run recovery on a namespace
    Recover { namespace: Namespace },

    /// Lift the quarantine of a namespace
    ClearQuarantine { namespace: Namespace },

    /// Recipe commands
    #[command(subcommand)]
    Recipe(RecipeCommands),

    /// Show engine statistics
    Status,
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// Validate a recipe document (TOML or JSON) and print its execution order
    ///
    /// Example:
    ///   tweave recipe validate summaries.toml --namespace acme/research/notes
    Validate {
        path: PathBuf,

        /// Also check the recipe may run against this namespace
        #[arg(short, long)]
        namespace: Option<Namespace>,
    },
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { "tierweave=debug" } else { "tierweave=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

/// Base directory for defaults (~/.tierweave)
fn home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".tierweave"))
        .context("Could not determine home directory")
}

fn load_config(cli: &Cli) -> Result<WeaveConfig> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => home_dir()?.join("config.toml"),
    };
    let mut config = WeaveConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let data_dir = match (&cli.data_dir, &config.storage.data_dir) {
        (Some(dir), _) => dir.clone(),
        (None, Some(dir)) => dir.clone(),
        (None, None) => home_dir()?.join("data"),
    };
    if config.backup.dir.is_none() {
        config.backup.dir = Some(data_dir.join("backups"));
    }
    if config.backup.passphrase.is_none() {
        config.backup.passphrase = std::env::var(PASSPHRASE_ENV).ok();
    }
    config.storage.data_dir = Some(data_dir);
    Ok(config)
}

/// Format a timestamp in a human-readable way
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Format JSON for pretty printing
fn format_json(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn format_value(value: &MemoryValue) -> String {
    match value {
        MemoryValue::Structured(doc) => format_json(doc),
        MemoryValue::Unstructured { bytes, mime } => format!("<{} bytes of {}>", bytes.len(), mime),
        MemoryValue::Mixed { document, bytes, mime } => {
            format!("{}\n<{} bytes of {}>", format_json(document), bytes.len(), mime)
        }
    }
}

/// Parse `name=value`, reading the value as JSON when it parses.
fn parse_field(expr: &str) -> Result<(String, JsonValue)> {
    let (name, raw) = expr
        .split_once('=')
        .with_context(|| format!("Invalid field criterion '{}', expected name=value", expr))?;
    let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| JsonValue::String(raw.trim().to_string()));
    Ok((name.trim().to_string(), value))
}

fn read_value(value: Option<String>, file: Option<&Path>, mime: &str) -> Result<MemoryValue> {
    match (value, file) {
        (_, Some(path)) => {
            let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(MemoryValue::bytes(bytes, mime))
        }
        (Some(text), None) => {
            let json: JsonValue =
                serde_json::from_str(&text).with_context(|| format!("Invalid JSON value: {}", text))?;
            Ok(MemoryValue::structured(json))
        }
        (None, None) => anyhow::bail!("Provide a JSON value or --file"),
    }
}

fn validate_recipe(path: &Path, namespace: Option<&Namespace>) -> Result<()> {
    let recipe = Recipe::load(path).with_context(|| format!("Failed to load recipe {}", path.display()))?;
    let plan = recipe.plan()?;
    if let Some(ns) = namespace {
        if !recipe.memory_interactions.allows_namespace(ns) {
            anyhow::bail!("Recipe '{}' may not run against {}", recipe.reference(), ns);
        }
    }

    println!("{}", "OK".green().bold());
    println!("  Recipe: {}", recipe.reference().cyan());
    println!("  Steps:");
    for (position, idx) in plan.order.iter().enumerate() {
        let step = &recipe.steps[*idx];
        let deps: Vec<&str> = plan.deps[*idx]
            .iter()
            .map(|d| recipe.steps[*d].name.as_str())
            .collect();
        let after = if deps.is_empty() {
            String::new()
        } else {
            format!(" (after {})", deps.join(", ")).bright_black().to_string()
        };
        println!("    {}. {}{}", position + 1, step.name, after);
    }
    if !plan.external_reads.is_empty() {
        println!("  Inputs expected in the namespace:");
        for (idx, key) in &plan.external_reads {
            println!("    {} {} {}", "*".cyan(), key, format!("({})", recipe.steps[*idx].name).bright_black());
        }
    }
    Ok(())
}

async fn execute(weave: &Weave, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            namespace,
            key,
            value,
            tier,
            file,
            mime,
        } => {
            let value = read_value(value, file.as_deref(), &mime)?;
            let revision = weave
                .put(&namespace, tier, &key, value)
                .context("Failed to store value")?;
            println!("{}", "OK".green().bold());
            println!("  Stored: {}/{}:{}", namespace.to_string().cyan(), tier, key.cyan());
            println!("  Revision: {}", revision.to_string().bright_black());
        }

        Commands::Get {
            namespace,
            key,
            tier,
            meta,
        } => match weave.get(&namespace, tier, &key).await {
            Ok(record) => {
                println!("{}", format_value(&record.value));
                if meta {
                    println!();
                    println!("  {} {}", "Revision:".bright_black(), record.revision);
                    println!("  {} {}", "Updated:".bright_black(), format_timestamp(&record.updated_at));
                    println!("  {} {}", "Created:".bright_black(), format_timestamp(&record.created_at));
                    println!("  {} {} bytes", "Size:".bright_black(), record.size_bytes);
                    println!("  {} {}", "Compressed:".bright_black(), record.compressed);
                    for (k, v) in &record.metadata {
                        println!("  {} {}={}", "Meta:".bright_black(), k, v);
                    }
                }
            }
            Err(WeaveError::NotFound { .. }) => {
                anyhow::bail!("Key not found: {}/{}:{}", namespace, tier, key);
            }
            Err(e) => return Err(e.into()),
        },

        Commands::Delete { namespace, key, tier } => {
            weave.delete(&namespace, tier, &key).context("Failed to delete key")?;
            println!("{}", "OK".green().bold());
            println!("  Deleted: {}/{}:{}", namespace, tier, key);
        }

        Commands::History {
            namespace,
            key,
            tier,
            limit,
        } => {
            let mut history = weave.history(&namespace, tier, &key)?;
            history.reverse();
            if let Some(limit) = limit {
                history.truncate(limit);
            }
            println!("{}", format!("History of {}/{}:{}", namespace, tier, key).bold());
            println!();
            for info in history {
                println!(
                    "  {} rev {} {} {} bytes ({} stored, {:?})",
                    "*".cyan(),
                    info.revision.to_string().bold(),
                    format_timestamp(&info.created_at).bright_black(),
                    info.size_bytes,
                    info.stored_bytes,
                    info.algorithm
                );
            }
        }

        Commands::List {
            namespace,
            tier,
            prefix,
        } => match namespace {
            Some(ns) => {
                let keys = weave.list(&ns, tier, &prefix)?;
                if keys.is_empty() {
                    println!("{}", format!("No keys in {} ({})", ns, tier).yellow());
                    return Ok(());
                }
                println!("{}", format!("Keys in {} ({}):", ns, tier).bold());
                println!();
                for key in keys {
                    println!("  {} {}", "*".cyan(), key);
                }
            }
            None => {
                let namespaces = weave.namespaces();
                if namespaces.is_empty() {
                    println!("{}", "No namespaces found".yellow());
                    return Ok(());
                }
                println!("{}", "Namespaces:".bold());
                println!();
                for ns in namespaces {
                    let counts: Vec<String> = Tier::ALL
                        .iter()
                        .map(|t| {
                            let n = weave.list(&ns, *t, "").map(|k| k.len()).unwrap_or(0);
                            format!("{} {}", n, t)
                        })
                        .collect();
                    println!("  {} {} ({})", "*".cyan(), ns, counts.join(", "));
                }
            }
        },

        Commands::Search {
            query,
            regex,
            field,
            namespace,
            tier,
            limit,
            min_score,
        } => {
            let query = match (query, field.is_empty()) {
                (Some(q), _) if regex => SearchQuery::pattern(&q)?,
                (Some(q), true) => SearchQuery::text(q),
                (_, false) => SearchQuery::fields(
                    field
                        .iter()
                        .map(|f| parse_field(f))
                        .collect::<Result<BTreeMap<_, _>>>()?,
                ),
                (None, true) => anyhow::bail!("Provide a query or at least one --field"),
            };
            let options = SearchOptions {
                namespace,
                tier,
                min_score,
                limit,
            };
            let hits = weave.search(&query, &options).await?;
            if hits.is_empty() {
                println!("{}", "No matches".yellow());
                return Ok(());
            }
            for hit in hits {
                let r = &hit.record;
                println!(
                    "  {} {:.2} {}/{}:{} {}",
                    "*".cyan(),
                    hit.score,
                    r.namespace,
                    r.tier,
                    r.key.bold(),
                    format!("rev {}", r.revision).bright_black()
                );
            }
        }

        Commands::Promote {
            namespace,
            key,
            from,
            to,
        } => {
            let revision = weave.promote(&namespace, &key, from, to)?;
            println!("{}", "OK".green().bold());
            println!("  Promoted {}/{} {} -> {} (rev {})", namespace, key, from, to, revision);
        }

        Commands::Gc => {
            let report = weave.gc()?;
            println!("{}", "OK".green().bold());
            println!("  Removed records: {}", report.removed_records);
            println!("  Pruned revisions: {}", report.pruned_revisions);
        }

        Commands::Snapshot { scope } => {
            let snapshot = weave.snapshot(scope).await.context("Snapshot failed")?;
            println!("{}", "OK".green().bold());
            println!("  Snapshot: {}", snapshot.id.cyan());
            println!("  Scope: {}", snapshot.scope);
            println!("  Records: {}", snapshot.records);
            println!("  Class: {}", snapshot.retention_class);
            println!("  Checksum: {}", snapshot.checksum.bright_black());
        }

        Commands::Backups => {
            let snapshots = weave.list_backups().await?;
            if snapshots.is_empty() {
                println!("{}", "No snapshots".yellow());
                return Ok(());
            }
            println!("{}", "Snapshots:".bold());
            println!();
            for s in snapshots.iter().rev() {
                println!(
                    "  {} {} {} {} {} records, {} bytes",
                    "*".cyan(),
                    s.id,
                    format_timestamp(&s.created_at).bright_black(),
                    s.retention_class,
                    s.records,
                    s.size_bytes
                );
                println!("      scope {}", s.scope);
            }
        }

        Commands::Restore {
            snapshot_id,
            namespace,
        } => {
            let outcome = match namespace {
                Some(ns) => weave.restore_namespace(&snapshot_id, &ns).await,
                None => weave.restore(&snapshot_id).await,
            }
            .context("Restore failed")?;
            println!("{}", "OK".green().bold());
            for (ns, records) in outcome.namespaces {
                println!("  {} {} ({} records)", "*".cyan(), ns, records);
            }
        }

        Commands::Check { namespace } => {
            let report = weave.check(&namespace);
            if report.consistent {
                println!("{} {}", "CONSISTENT".green().bold(), namespace);
            } else {
                println!("{} {}", "INCONSISTENT".red().bold(), namespace);
                for issue in &report.issues {
                    println!("  {} {}", "*".red(), issue);
                }
                anyhow::bail!("{} has {} issue(s)", namespace, report.issues.len());
            }
        }

        Commands::Recover { namespace } => {
            let outcome = weave.recover(&namespace).await.context("Recovery failed")?;
            println!("{}", "OK".green().bold());
            println!("  Stage: {}", outcome.stage);
            println!("  Repaired issues: {}", outcome.repaired_issues);
            if let Some(id) = outcome.snapshot_id {
                println!("  Snapshot: {}", id);
            }
        }

        Commands::ClearQuarantine { namespace } => {
            if weave.clear_quarantine(&namespace)? {
                println!("{}", "OK".green().bold());
                println!("  {} is no longer quarantined", namespace);
            } else {
                println!("{}", format!("{} was not quarantined", namespace).yellow());
            }
        }

        Commands::Recipe(RecipeCommands::Validate { path, namespace }) => {
            validate_recipe(&path, namespace.as_ref())?;
        }

        Commands::Status => {
            let stats = weave.stats();
            println!("{}", "tierweave status".bold());
            println!();
            println!("  {} {}", "Records:".bright_black(), stats.store.live_records);
            println!("  {} {}", "Revisions:".bright_black(), stats.store.revisions);
            println!("  {} {}", "Namespaces:".bright_black(), stats.store.namespaces);
            println!(
                "  {} {} logical / {} stored bytes",
                "Size:".bright_black(),
                stats.store.logical_bytes,
                stats.store.stored_bytes
            );
            println!("  {} {}", "Compressed revisions:".bright_black(), stats.store.compressed_revisions);
            if let Some(backups) = &stats.backups {
                println!("  {} {} created, {} alerts", "Backups:".bright_black(), backups.snapshots_created, backups.alerts);
            }
            if !stats.quarantined.is_empty() {
                println!();
                println!("{}", "Quarantined:".red().bold());
                for (ns, reason) in &stats.quarantined {
                    println!("  {} {} ({})", "*".red(), ns, reason);
                }
            }
            if let Some(dir) = &weave.config().storage.data_dir {
                println!();
                println!("  {} {}", "Data:".bright_black(), dir.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    // Recipe validation needs no store.
    if let Commands::Recipe(RecipeCommands::Validate { path, namespace }) = &cli.command {
        return validate_recipe(path, namespace.as_ref());
    }

    let config = load_config(&cli)?;
    let weave = Weave::open(config).await.context("Failed to open tierweave")?;

    let result = execute(&weave, cli.command).await;
    weave.shutdown().await.context("Failed to shut down cleanly")?;
    result
}

/// Scored search over stored memory.
///
/// Text queries score each string inside a value by character similarity and
/// keep the best one. Patterns score 1.0 when any string matches. Field
/// queries compare top-level fields of structured documents: string criteria
/// match on similarity above [`FIELD_MATCH_THRESHOLD`], anything else on
/// equality, and the score is the share of criteria matched.
///
/// Tiers are searched concurrently. Quarantined namespaces are skipped.
use crate::error::{WeaveError, WeaveResult};
use crate::storage::TieredStore;
use crate::types::{MemoryRecord, MemoryValue, Namespace, Tier};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use similar::TextDiff;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Similarity a string criterion must exceed to count as matched.
pub const FIELD_MATCH_THRESHOLD: f32 = 0.7;

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub enum SearchQuery {
    Text(String),
    Pattern(Regex),
    Fields(BTreeMap<String, JsonValue>),
}

impl SearchQuery {
    pub fn text(query: impl Into<String>) -> Self {
        SearchQuery::Text(query.into())
    }

    pub fn pattern(pattern: &str) -> WeaveResult<Self> {
        Regex::new(pattern)
            .map(SearchQuery::Pattern)
            .map_err(|e| WeaveError::Config(format!("invalid pattern '{}': {}", pattern, e)))
    }

    pub fn fields(criteria: BTreeMap<String, JsonValue>) -> Self {
        SearchQuery::Fields(criteria)
    }

    /// Score a value; 0.0 means no match.
    pub fn score(&self, value: &MemoryValue) -> f32 {
        match self {
            SearchQuery::Text(query) => {
                let query = query.to_lowercase();
                searchable(value)
                    .map(|doc| fuzzy_score(&query, &doc))
                    .unwrap_or(0.0)
            }
            SearchQuery::Pattern(pattern) => match searchable(value) {
                Some(doc) if pattern_matches(pattern, &doc) => 1.0,
                _ => 0.0,
            },
            SearchQuery::Fields(criteria) => match value.document() {
                Some(JsonValue::Object(fields)) if !criteria.is_empty() => {
                    let matched = criteria
                        .iter()
                        .filter(|(name, expected)| {
                            fields
                                .get(name.as_str())
                                .is_some_and(|actual| field_matches(expected, actual))
                        })
                        .count();
                    matched as f32 / criteria.len() as f32
                }
                _ => 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Restrict to one namespace; `None` searches every namespace
    pub namespace: Option<Namespace>,
    /// Restrict to one tier; `None` searches all three
    pub tier: Option<Tier>,
    pub min_score: f32,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            tier: None,
            min_score: 0.0,
            limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub score: f32,
    pub record: MemoryRecord,
}

/// Run a search. Hits are ordered by score, then most recent first.
pub async fn search(
    store: &Arc<TieredStore>,
    query: &SearchQuery,
    options: &SearchOptions,
) -> WeaveResult<Vec<SearchHit>> {
    let namespaces: Vec<Namespace> = match &options.namespace {
        Some(ns) => vec![ns.clone()],
        None => store.namespaces().into_iter().collect(),
    };
    let namespaces: Vec<Namespace> = namespaces
        .into_iter()
        .filter(|ns| !store.is_quarantined(ns))
        .collect();
    let tiers: Vec<Tier> = match options.tier {
        Some(tier) => vec![tier],
        None => Tier::ALL.to_vec(),
    };

    let tasks: Vec<_> = tiers
        .into_iter()
        .map(|tier| {
            let store = Arc::clone(store);
            let namespaces = namespaces.clone();
            let query = query.clone();
            let min_score = options.min_score;
            tokio::task::spawn_blocking(move || scan_tier(&store, &namespaces, tier, &query, min_score))
        })
        .collect();

    let mut hits = Vec::new();
    for joined in futures::future::join_all(tasks).await {
        let tier_hits = joined.map_err(|e| WeaveError::Storage(format!("search task failed: {}", e)))??;
        hits.extend(tier_hits);
    }

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
    });
    hits.truncate(options.limit);
    debug!(hits = hits.len(), "search finished");
    Ok(hits)
}

fn scan_tier(
    store: &TieredStore,
    namespaces: &[Namespace],
    tier: Tier,
    query: &SearchQuery,
    min_score: f32,
) -> WeaveResult<Vec<SearchHit>> {
    let mut hits = Vec::new();
    for namespace in namespaces {
        let keys: Vec<String> = store.list_keys(namespace, tier, "")?.collect();
        for key in keys {
            let record = match store.get(namespace, tier, &key) {
                Ok(record) => record,
                Err(WeaveError::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(namespace = %namespace, %tier, key = %key, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            let score = query.score(&record.value);
            if score > 0.0 && score >= min_score {
                hits.push(SearchHit { score, record });
            }
        }
    }
    Ok(hits)
}

/// The JSON that text and pattern queries look into.
fn searchable(value: &MemoryValue) -> Option<JsonValue> {
    match value.document() {
        Some(doc) => Some(doc.clone()),
        None => match value {
            MemoryValue::Unstructured { bytes, mime } if mime.starts_with("text/") => {
                std::str::from_utf8(bytes).ok().map(|s| JsonValue::String(s.to_string()))
            }
            _ => None,
        },
    }
}

fn ratio(a: &str, b: &str) -> f32 {
    TextDiff::from_chars(a, b).ratio()
}

fn fuzzy_score(query: &str, value: &JsonValue) -> f32 {
    match value {
        JsonValue::String(s) => ratio(query, &s.to_lowercase()),
        JsonValue::Array(items) => items.iter().map(|v| fuzzy_score(query, v)).fold(0.0, f32::max),
        JsonValue::Object(fields) => fields.values().map(|v| fuzzy_score(query, v)).fold(0.0, f32::max),
        _ => 0.0,
    }
}

fn pattern_matches(pattern: &Regex, value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => pattern.is_match(s),
        JsonValue::Array(items) => items.iter().any(|v| pattern_matches(pattern, v)),
        JsonValue::Object(fields) => fields.values().any(|v| pattern_matches(pattern, v)),
        _ => false,
    }
}

fn field_matches(expected: &JsonValue, actual: &JsonValue) -> bool {
    match (expected, actual) {
        (JsonValue::String(e), JsonValue::String(a)) => {
            ratio(&e.to_lowercase(), &a.to_lowercase()) > FIELD_MATCH_THRESHOLD
        }
        _ => expected == actual,
    }
}

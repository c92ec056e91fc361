/// Common types used throughout tierweave.
///
/// This module defines the addressing model (namespaces, tiers, record keys)
/// and the value model (structured documents, opaque bytes, or both) that the
/// store, cache and workflow layers share.
use crate::compression::Algorithm;
use crate::error::{WeaveError, WeaveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Project name reserved for cross-project shared patterns.
pub const GLOBAL_PROJECT: &str = "global";

/// An isolation boundary for memory records: `project/context_type/memory_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    project: String,
    context_type: String,
    memory_type: String,
}

impl Namespace {
    /// Build a namespace from its three segments, validating each one.
    pub fn new(
        project: impl Into<String>,
        context_type: impl Into<String>,
        memory_type: impl Into<String>,
    ) -> WeaveResult<Self> {
        let ns = Self {
            project: project.into(),
            context_type: context_type.into(),
            memory_type: memory_type.into(),
        };
        for segment in [&ns.project, &ns.context_type, &ns.memory_type] {
            validate_segment(&ns.to_string(), segment)?;
        }
        Ok(ns)
    }

    /// A namespace in the shared `global` project.
    pub fn global(
        context_type: impl Into<String>,
        memory_type: impl Into<String>,
    ) -> WeaveResult<Self> {
        Self::new(GLOBAL_PROJECT, context_type, memory_type)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    pub fn memory_type(&self) -> &str {
        &self.memory_type
    }

    /// Whether this namespace holds cross-project shareable patterns.
    pub fn is_global(&self) -> bool {
        self.project == GLOBAL_PROJECT
    }
}

fn validate_segment(input: &str, segment: &str) -> WeaveResult<()> {
    if segment.is_empty() {
        return Err(WeaveError::InvalidNamespace {
            input: input.to_string(),
            reason: "empty segment".into(),
        });
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(WeaveError::InvalidNamespace {
            input: input.to_string(),
            reason: format!("invalid character '{}'", bad),
        });
    }
    Ok(())
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.context_type, self.memory_type)
    }
}

impl FromStr for Namespace {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(WeaveError::InvalidNamespace {
                input: s.to_string(),
                reason: "expected project/context_type/memory_type".into(),
            });
        }
        Self::new(parts[0], parts[1], parts[2])
    }
}

impl TryFrom<String> for Namespace {
    type Error = WeaveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// Memory tier enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Immediate context, rewritten or promoted quickly
    ShortTerm,
    /// Active session data
    Working,
    /// Archived, persistent data
    LongTerm,
}

impl Tier {
    /// All tiers, shortest-lived first.
    pub const ALL: [Tier; 3] = [Tier::ShortTerm, Tier::Working, Tier::LongTerm];

    /// The tier a record is promoted into, if any.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::ShortTerm => Some(Tier::Working),
            Tier::Working => Some(Tier::LongTerm),
            Tier::LongTerm => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::ShortTerm => "short_term",
            Tier::Working => "working",
            Tier::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" | "short" | "stm" => Ok(Tier::ShortTerm),
            "working" | "wm" => Ok(Tier::Working),
            "long_term" | "long" | "ltm" => Ok(Tier::LongTerm),
            other => Err(WeaveError::Config(format!("unknown tier '{}'", other))),
        }
    }
}

/// A fully-qualified record address: namespace, tier and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: Namespace,
    pub tier: Tier,
    pub key: String,
}

impl RecordKey {
    pub fn new(namespace: Namespace, tier: Tier, key: impl Into<String>) -> Self {
        Self {
            namespace,
            tier,
            key: key.into(),
        }
    }

    pub(crate) fn not_found(&self) -> WeaveError {
        WeaveError::NotFound {
            namespace: self.namespace.to_string(),
            tier: self.tier,
            key: self.key.clone(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]:{}", self.namespace, self.tier, self.key)
    }
}

/// Shape of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Structured,
    Unstructured,
    Mixed,
}

/// A memory value: a JSON document, opaque bytes with a mime type, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MemoryValue {
    Structured(JsonValue),
    Unstructured {
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
        mime: String,
    },
    Mixed {
        document: JsonValue,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
        mime: String,
    },
}

impl MemoryValue {
    pub fn structured(value: JsonValue) -> Self {
        MemoryValue::Structured(value)
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        MemoryValue::Unstructured {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            MemoryValue::Structured(_) => ValueKind::Structured,
            MemoryValue::Unstructured { .. } => ValueKind::Unstructured,
            MemoryValue::Mixed { .. } => ValueKind::Mixed,
        }
    }

    /// The JSON document part, if any.
    pub fn document(&self) -> Option<&JsonValue> {
        match self {
            MemoryValue::Structured(doc) | MemoryValue::Mixed { document: doc, .. } => Some(doc),
            MemoryValue::Unstructured { .. } => None,
        }
    }

    pub fn mime(&self) -> Option<&str> {
        match self {
            MemoryValue::Structured(_) => None,
            MemoryValue::Unstructured { mime, .. } | MemoryValue::Mixed { mime, .. } => Some(mime),
        }
    }

    /// Encode into the canonical byte form that gets compressed and stored.
    ///
    /// Mixed values are `u32 LE document length | document JSON | bytes`.
    pub fn encode(&self) -> WeaveResult<Vec<u8>> {
        match self {
            MemoryValue::Structured(doc) => Ok(serde_json::to_vec(doc)?),
            MemoryValue::Unstructured { bytes, .. } => Ok(bytes.clone()),
            MemoryValue::Mixed {
                document, bytes, ..
            } => {
                let doc = serde_json::to_vec(document)?;
                let mut out = Vec::with_capacity(4 + doc.len() + bytes.len());
                out.extend_from_slice(&(doc.len() as u32).to_le_bytes());
                out.extend_from_slice(&doc);
                out.extend_from_slice(bytes);
                Ok(out)
            }
        }
    }

    /// Inverse of [`MemoryValue::encode`].
    pub fn decode(kind: ValueKind, mime: Option<&str>, raw: &[u8]) -> WeaveResult<Self> {
        let mime = || mime.unwrap_or("application/octet-stream").to_string();
        match kind {
            ValueKind::Structured => Ok(MemoryValue::Structured(
                serde_json::from_slice(raw)
                    .map_err(|e| WeaveError::corrupt(format!("structured payload: {}", e)))?,
            )),
            ValueKind::Unstructured => Ok(MemoryValue::Unstructured {
                bytes: raw.to_vec(),
                mime: mime(),
            }),
            ValueKind::Mixed => {
                if raw.len() < 4 {
                    return Err(WeaveError::corrupt("mixed payload shorter than header"));
                }
                let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                let body = &raw[4..];
                if body.len() < len {
                    return Err(WeaveError::corrupt("mixed payload truncated"));
                }
                let document = serde_json::from_slice(&body[..len])
                    .map_err(|e| WeaveError::corrupt(format!("mixed document: {}", e)))?;
                Ok(MemoryValue::Mixed {
                    document,
                    bytes: body[len..].to_vec(),
                    mime: mime(),
                })
            }
        }
    }
}

impl From<JsonValue> for MemoryValue {
    fn from(value: JsonValue) -> Self {
        MemoryValue::Structured(value)
    }
}

/// One append-only revision of a record as it sits in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Monotonically increasing per `(namespace, tier, key)`, starting at 1
    pub revision: u64,
    pub kind: ValueKind,
    pub mime: Option<String>,
    pub algorithm: Algorithm,
    /// Stored bytes, compressed when `algorithm` is not `Raw`
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Size of the encoded value before compression
    pub size_bytes: usize,
    /// blake3 hex digest of the encoded value before compression
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    pub fn compressed(&self) -> bool {
        self.algorithm != Algorithm::Raw
    }
}

/// The current view of a record, as returned by reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub namespace: Namespace,
    pub tier: Tier,
    pub key: String,
    pub value: MemoryValue,
    pub revision: u64,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub compressed: bool,
    pub size_bytes: usize,
}

impl MemoryRecord {
    pub fn value_kind(&self) -> ValueKind {
        self.value.kind()
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.namespace.clone(), self.tier, self.key.clone())
    }
}

/// Serde helper storing byte vectors as hex strings in JSON documents.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_parse_and_display() {
        let ns: Namespace = "acme/research/interviews".parse().unwrap();
        assert_eq!(ns.project(), "acme");
        assert_eq!(ns.context_type(), "research");
        assert_eq!(ns.memory_type(), "interviews");
        assert_eq!(ns.to_string(), "acme/research/interviews");
        assert!(!ns.is_global());
    }

    #[test]
    fn test_namespace_rejects_bad_input() {
        assert!("acme/research".parse::<Namespace>().is_err());
        assert!("acme//notes".parse::<Namespace>().is_err());
        assert!("acme/re search/notes".parse::<Namespace>().is_err());
        assert!("a/b/c/d".parse::<Namespace>().is_err());
    }

    #[test]
    fn test_global_namespace() {
        let ns = Namespace::global("patterns", "ux").unwrap();
        assert!(ns.is_global());
        assert_eq!(ns.to_string(), "global/patterns/ux");
    }

    #[test]
    fn test_namespace_serde_as_string() {
        let ns: Namespace = "p/c/m".parse().unwrap();
        let s = serde_json::to_string(&ns).unwrap();
        assert_eq!(s, "\"p/c/m\"");
        let back: Namespace = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ns);
        assert!(serde_json::from_str::<Namespace>("\"bad\"").is_err());
    }

    #[test]
    fn test_tier_order_and_promotion() {
        assert_eq!(Tier::ShortTerm.next(), Some(Tier::Working));
        assert_eq!(Tier::Working.next(), Some(Tier::LongTerm));
        assert_eq!(Tier::LongTerm.next(), None);
        assert_eq!("long_term".parse::<Tier>().unwrap(), Tier::LongTerm);
        assert_eq!(Tier::Working.to_string(), "working");
    }

    #[test]
    fn test_mixed_value_encoding() {
        let value = MemoryValue::Mixed {
            document: json!({"title": "scan"}),
            bytes: vec![0, 1, 2, 255],
            mime: "image/png".into(),
        };
        let raw = value.encode().unwrap();
        let back = MemoryValue::decode(ValueKind::Mixed, Some("image/png"), &raw).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_truncated_mixed_value_is_corrupt() {
        let err = MemoryValue::decode(ValueKind::Mixed, None, &[10, 0, 0, 0, b'{']).unwrap_err();
        assert!(matches!(err, WeaveError::CorruptData { .. }));
    }
}

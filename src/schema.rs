/// Per-namespace JSON Schema registry.
///
/// Structured and mixed writes to a namespace with a registered schema are
/// validated before they reach the store. Unstructured writes carry no
/// document but must declare a mime type.
use crate::error::{WeaveError, WeaveResult};
use crate::types::{MemoryValue, Namespace};
use dashmap::DashMap;
use jsonschema::JSONSchema;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

struct CompiledSchema {
    source: JsonValue,
    compiled: JSONSchema,
}

/// Schemas keyed by namespace.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<Namespace, Arc<CompiledSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for a namespace.
    pub fn register(&self, namespace: &Namespace, schema: JsonValue) -> WeaveResult<()> {
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| WeaveError::Config(format!("invalid schema for {}: {}", namespace, e)))?;
        debug!(namespace = %namespace, "registered schema");
        self.schemas.insert(
            namespace.clone(),
            Arc::new(CompiledSchema {
                source: schema,
                compiled,
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, namespace: &Namespace) -> bool {
        self.schemas.remove(namespace).is_some()
    }

    /// The raw schema document registered for a namespace.
    pub fn get(&self, namespace: &Namespace) -> Option<JsonValue> {
        self.schemas.get(namespace).map(|s| s.source.clone())
    }

    /// Validate a value about to be written under `namespace`/`key`.
    pub fn validate(&self, namespace: &Namespace, key: &str, value: &MemoryValue) -> WeaveResult<()> {
        if let Some(mime) = value.mime() {
            if mime.trim().is_empty() {
                return Err(WeaveError::SchemaViolation {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    errors: vec!["unstructured value requires a mime type".into()],
                });
            }
        }

        let Some(document) = value.document() else {
            return Ok(());
        };
        let Some(schema) = self.schemas.get(namespace).map(|s| Arc::clone(&s)) else {
            return Ok(());
        };

        if let Err(errors) = schema.compiled.validate(document) {
            let errors: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            return Err(WeaveError::SchemaViolation {
                namespace: namespace.to_string(),
                key: key.to_string(),
                errors,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        "acme/research/interviews".parse().unwrap()
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register(
                &ns(),
                json!({
                    "type": "object",
                    "required": ["speaker"],
                    "properties": {"speaker": {"type": "string"}}
                }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_valid_document_accepted() {
        let value = MemoryValue::structured(json!({"speaker": "P1"}));
        registry().validate(&ns(), "t1", &value).unwrap();
    }

    #[test]
    fn test_invalid_document_rejected_with_key() {
        let value = MemoryValue::structured(json!({"speaker": 5}));
        let err = registry().validate(&ns(), "t1", &value).unwrap_err();
        match err {
            WeaveError::SchemaViolation { key, errors, .. } => {
                assert_eq!(key, "t1");
                assert!(!errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_namespaces_unconstrained() {
        let other: Namespace = "acme/research/notes".parse().unwrap();
        let value = MemoryValue::structured(json!(42));
        registry().validate(&other, "n", &value).unwrap();
    }

    #[test]
    fn test_unstructured_requires_mime() {
        let value = MemoryValue::bytes(vec![1, 2, 3], "");
        assert!(registry().validate(&ns(), "blob", &value).is_err());
        let value = MemoryValue::bytes(vec![1, 2, 3], "audio/wav");
        registry().validate(&ns(), "blob", &value).unwrap();
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let registry = SchemaRegistry::new();
        assert!(registry.register(&ns(), json!({"type": 12})).is_err());
    }
}

/// Error types for tierweave operations.
///
/// Every failure mode of the memory store, the backup and recovery machinery
/// and the workflow layer is a variant of [`WeaveError`]. Variants that concern
/// a record or a recipe step carry the namespace, key or step name so callers
/// can report exactly what failed.
use crate::types::Tier;
use thiserror::Error;

/// The main error type for tierweave operations.
#[derive(Error, Debug)]
pub enum WeaveError {
    /// Key not found in the given namespace and tier
    #[error("Key '{key}' not found in {namespace} ({tier})")]
    NotFound {
        /// The namespace that was queried
        namespace: String,
        /// The tier that was queried
        tier: Tier,
        /// The key that was not found
        key: String,
    },

    /// A structured value failed schema validation at write time
    #[error("Schema violation for '{key}' in {namespace}: {}", errors.join("; "))]
    SchemaViolation {
        namespace: String,
        key: String,
        errors: Vec<String>,
    },

    /// Stored or transported bytes could not be decoded
    #[error("Corrupt data: {reason}")]
    CorruptData { reason: String },

    /// A recipe failed syntax, memory-compatibility or dependency validation
    #[error("Invalid recipe '{recipe}': {reason}")]
    InvalidRecipe { recipe: String, reason: String },

    /// A declared read key did not resolve when its step was about to run
    #[error("Step '{step}' is missing input '{key}' in {namespace}")]
    MissingInput {
        step: String,
        namespace: String,
        key: String,
    },

    /// A backup snapshot failed checksum or decryption on restore
    #[error("Backup '{snapshot_id}' is corrupt: {reason}")]
    BackupCorrupt { snapshot_id: String, reason: String },

    /// Every recovery stage failed; the namespace is quarantined
    #[error("Namespace {namespace} is irrecoverable: {reason}")]
    IrrecoverableState { namespace: String, reason: String },

    /// A retried operation kept failing
    #[error("Operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },

    /// A cross-namespace read without a sharing grant
    #[error("Namespace {reader} is not allowed to read {owner}")]
    SharingDenied { reader: String, owner: String },

    /// The namespace is quarantined until manually cleared
    #[error("Namespace {namespace} is quarantined")]
    Quarantined { namespace: String },

    /// Namespace string is not of the form project/context_type/memory_type
    #[error("Invalid namespace '{input}': {reason}")]
    InvalidNamespace { input: String, reason: String },

    /// An external tool invoked by a step reported failure
    #[error("Tool '{tool}' failed in step '{step}': {reason}")]
    ToolFailed {
        step: String,
        tool: String,
        reason: String,
    },

    /// A checkpoint decision aborted the run
    #[error("Run aborted at checkpoint '{step}'")]
    CheckpointRejected { step: String },

    /// The surrounding batch was cancelled before the run finished
    #[error("Cancelled before step '{step}'")]
    Cancelled { step: String },

    /// Configuration could not be parsed or holds invalid values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WeaveError {
    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Dependency and schema errors are structural and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WeaveError::Io(_)
                | WeaveError::Storage(_)
                | WeaveError::CorruptData { .. }
                | WeaveError::ToolFailed { .. }
        )
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        WeaveError::CorruptData {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_recipe(recipe: &str, reason: impl Into<String>) -> Self {
        WeaveError::InvalidRecipe {
            recipe: recipe.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for tierweave operations.
pub type WeaveResult<T> = Result<T, WeaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(WeaveError::Storage("disk full".into()).is_transient());
        assert!(WeaveError::corrupt("truncated").is_transient());
        assert!(!WeaveError::invalid_recipe("r", "cycle").is_transient());
        assert!(
            !WeaveError::SchemaViolation {
                namespace: "a/b/c".into(),
                key: "k".into(),
                errors: vec![],
            }
            .is_transient()
        );
    }

    #[test]
    fn test_messages_name_the_failing_key() {
        let err = WeaveError::MissingInput {
            step: "summarize".into(),
            namespace: "proj/research/notes".into(),
            key: "draft".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("summarize"));
        assert!(msg.contains("draft"));
    }
}

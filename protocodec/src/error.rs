//! Error taxonomy for the codec pipeline.
//!
//! One enum covers every stage (`Schema`, `Plan`, `Derive`, `Code`) rather than
//! a per-module error type, because a caller driving `encode`/`decode` only
//! ever needs to match on "what went wrong", not "which internal stage raised
//! it". Each variant still carries enough context (node path, bit offset) to
//! pinpoint the failure.

use thiserror::Error;

/// Which stage of the pipeline raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Schema,
    Plan,
    Derive,
    Code,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Schema => "schema",
            Stage::Plan => "plan",
            Stage::Derive => "derive",
            Stage::Code => "code",
        };
        f.write_str(s)
    }
}

/// All failure modes the core can report.
///
/// Carries the offending node path (empty string when not applicable) and,
/// for stream errors, the bit offset at which the failure occurred.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("[{stage}] schema error at '{node_path}': {detail}")]
    Schema {
        stage: Stage,
        node_path: String,
        detail: String,
    },

    #[error("[{stage}] cyclic dependency involving: {cycle:?}")]
    CyclicDependency { stage: Stage, cycle: Vec<String> },

    #[error("[{stage}] unknown reference '{reference}' from '{node_path}'")]
    UnknownReference {
        stage: Stage,
        node_path: String,
        reference: String,
    },

    #[error("[{stage}] expression syntax error in '{node_path}': {detail}")]
    ExpressionSyntax {
        stage: Stage,
        node_path: String,
        detail: String,
    },

    #[error("[{stage}] expression runtime error in '{node_path}': {detail}")]
    ExpressionRuntime {
        stage: Stage,
        node_path: String,
        detail: String,
    },

    #[error("[{stage}] range endpoints out of order in '{node_path}': {from} comes after {to}")]
    RangeOrder {
        stage: Stage,
        node_path: String,
        from: String,
        to: String,
    },

    #[error("[{stage}] missing value for '{node_path}': no caller value and no fwd_expr")]
    MissingValue { stage: Stage, node_path: String },

    #[error("[{stage}] value for '{node_path}' matches neither an encoded form nor a description in its enum range")]
    EnumOutOfRange { stage: Stage, node_path: String },

    #[error("[{stage}] value for '{node_path}' does not fit its declared bit width: {detail}")]
    ValueOutOfRange {
        stage: Stage,
        node_path: String,
        detail: String,
    },

    #[error("[{stage}] bit stream overrun reading '{node_path}' at bit offset {bit_offset}")]
    BitStreamOverrun {
        stage: Stage,
        node_path: String,
        bit_offset: u64,
    },

    #[error("[{stage}] decoded value for '{node_path}' is absent from its declared enum")]
    EnumValidationFailed { stage: Stage, node_path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CodecError {
    pub fn stage(&self) -> Option<Stage> {
        use CodecError::*;
        match self {
            Schema { stage, .. }
            | CyclicDependency { stage, .. }
            | UnknownReference { stage, .. }
            | ExpressionSyntax { stage, .. }
            | ExpressionRuntime { stage, .. }
            | RangeOrder { stage, .. }
            | MissingValue { stage, .. }
            | EnumOutOfRange { stage, .. }
            | ValueOutOfRange { stage, .. }
            | BitStreamOverrun { stage, .. }
            | EnumValidationFailed { stage, .. } => Some(*stage),
            Io(_) | Yaml(_) => None,
        }
    }

    pub fn schema(stage: Stage, node_path: impl Into<String>, detail: impl Into<String>) -> Self {
        CodecError::Schema {
            stage,
            node_path: node_path.into(),
            detail: detail.into(),
        }
    }

    pub fn unknown_reference(
        stage: Stage,
        node_path: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        CodecError::UnknownReference {
            stage,
            node_path: node_path.into(),
            reference: reference.into(),
        }
    }

    pub fn expr_syntax(
        stage: Stage,
        node_path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        CodecError::ExpressionSyntax {
            stage,
            node_path: node_path.into(),
            detail: detail.into(),
        }
    }

    pub fn expr_runtime(
        stage: Stage,
        node_path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        CodecError::ExpressionRuntime {
            stage,
            node_path: node_path.into(),
            detail: detail.into(),
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_is_reported_for_pipeline_errors() {
        let err = CodecError::schema(Stage::Schema, "root.version", "length mismatch");
        assert_eq!(err.stage(), Some(Stage::Schema));
    }

    #[test]
    fn io_and_yaml_errors_have_no_stage() {
        let yaml_err: CodecError = serde_yaml::from_str::<i32>("not: valid: yaml: ][").unwrap_err().into();
        assert_eq!(yaml_err.stage(), None);
    }

    #[test]
    fn display_includes_node_path_and_detail() {
        let err = CodecError::expr_runtime(Stage::Derive, "checksum", "divide by zero");
        let msg = err.to_string();
        assert!(msg.contains("checksum"));
        assert!(msg.contains("divide by zero"));
    }
}

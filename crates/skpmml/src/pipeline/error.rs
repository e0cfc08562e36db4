use thiserror::Error;

use crate::pickle::{ArrayError, ClassName, FieldError};
use crate::sklearn::TaskKind;

/// Errors raised while compiling a decoded pipeline into PMML.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The pipeline or one of its steps is not usable as configured.
    #[error("{0}")]
    Configuration(String),

    /// Two dimensions that must agree do not.
    #[error("{what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// No output block declares all of the fields a post-processor reads.
    #[error("no output block declares all of {fields:?}")]
    MissingOutputField { fields: Vec<String> },

    #[error("{class} performs {task}, which has no PMML encoding")]
    UnsupportedTask { class: ClassName, task: TaskKind },

    #[error(transparent)]
    InvalidField(#[from] FieldError),

    #[error(transparent)]
    Array(#[from] ArrayError),
}

impl EncodeError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn shape(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

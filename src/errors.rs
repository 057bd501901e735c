use thiserror::Error;

/// Top-level error type surfaced across the compiler's public API.
///
/// Two kinds are locally recoverable by the planner (`WeightsTooLarge`,
/// `AllocationFailed`); the rest propagate to the caller.
#[derive(Error, Debug, Clone)]
pub enum CompilerError {
    #[error("operation(s) not supported: {reason} (failing ops: {failing_op_ids:?})")]
    NotSupported {
        reason: String,
        failing_op_ids: Vec<u32>,
    },

    #[error("weights do not fit the SRAM budget for this stripe (need {needed_bytes} bytes, budget {budget_bytes} bytes)")]
    WeightsTooLarge {
        needed_bytes: usize,
        budget_bytes: usize,
    },

    #[error("allocation failed: could not place {size} bytes ({what})")]
    AllocationFailed { size: usize, what: String },

    #[error("failed to parse mapping input: {0}")]
    ParseException(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl CompilerError {
    pub fn not_supported(reason: impl Into<String>) -> Self {
        CompilerError::NotSupported {
            reason: reason.into(),
            failing_op_ids: Vec::new(),
        }
    }

    pub fn not_supported_ops(reason: impl Into<String>, failing_op_ids: Vec<u32>) -> Self {
        CompilerError::NotSupported {
            reason: reason.into(),
            failing_op_ids,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompilerError::InternalError(msg.into())
    }
}

impl From<anyhow::Error> for CompilerError {
    fn from(e: anyhow::Error) -> Self {
        CompilerError::InternalError(e.to_string())
    }
}

pub type CResult<T> = Result<T, CompilerError>;

//! Error taxonomy of the workflow engine.

use crate::types::StepId;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by graph validation, state transitions and step execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown workflow, execution, step execution or handler type.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The depends_on relation contains a cycle.
    #[error("workflow contains circular dependencies through steps: {}", join_steps(.steps))]
    Cycle { steps: Vec<StepId> },

    /// A depends_on edge points at a step outside the workflow.
    #[error("step {step} depends on unknown step {missing}")]
    DanglingReference { step: StepId, missing: StepId },

    /// Two steps share an id.
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    /// Out-of-order or duplicate status transition.
    #[error("invalid state transition for {entity}: expected one of [{}], found {actual}", .expected.join(", "))]
    InvalidState {
        entity: String,
        expected: Vec<String>,
        actual: String,
    },

    /// A step handler returned an error.
    #[error("handler error: {message}")]
    Handler {
        message: String,
        traceback: Option<String>,
    },

    /// A step failed after exhausting its retries.
    #[error("Step '{step}' failed after {retries} retries: {message}")]
    MaxRetriesExceeded {
        step: StepId,
        retries: u32,
        message: String,
    },

    /// A step ran past its timeout_seconds.
    #[error("step {step} timed out after {timeout_seconds} seconds")]
    Timeout { step: StepId, timeout_seconds: u64 },

    /// Persistence or IO failure.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        entity: impl ToString,
        expected: &[impl ToString],
        actual: impl ToString,
    ) -> Self {
        Self::InvalidState {
            entity: entity.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
            actual: actual.to_string(),
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors raised when a workflow definition is malformed
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. } | Self::DanglingReference { .. } | Self::DuplicateStep(_)
        )
    }
}

fn join_steps(steps: &[StepId]) -> String {
    steps
        .iter()
        .map(|s| s.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

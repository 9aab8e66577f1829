use super::handler::HandlerRegistry;
use crate::error::EngineError;
use crate::types::{Payload, Step};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Result of invoking a step's handler once
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success(Payload),
    Failure(StepFailure),
}

/// Captured handler error
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub message: String,
    pub traceback: Option<String>,
    pub timed_out: bool,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
            timed_out: false,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Display for the message, Debug (with the cause chain) for the trace
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new(err.to_string()).with_traceback(format!("{:?}", err))
    }

    pub fn timeout(step: &Step) -> Self {
        let err = EngineError::Timeout {
            step: step.id.clone(),
            timeout_seconds: step.timeout_seconds,
        };
        Self {
            message: err.to_string(),
            traceback: None,
            timed_out: true,
        }
    }
}

impl From<StepFailure> for EngineError {
    fn from(failure: StepFailure) -> Self {
        EngineError::Handler {
            message: failure.message,
            traceback: failure.traceback,
        }
    }
}

/// Invokes step handlers on the blocking pool under the step's timeout
pub struct StepExecutor {
    registry: Arc<HandlerRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn execute(&self, step: &Step, input: Payload) -> StepOutcome {
        let handler = match self.registry.lookup(&step.step_type) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!("No handler for step {} of type {}", step.id, step.step_type);
                return StepOutcome::Failure(StepFailure::new(e.to_string()));
            }
        };

        tracing::debug!("Invoking {} handler for step {}", step.step_type, step.id);

        let config = step.config.clone();
        let task = tokio::task::spawn_blocking(move || handler.handle(&config, &input));

        match timeout(Duration::from_secs(step.timeout_seconds), task).await {
            Ok(Ok(Ok(result))) => StepOutcome::Success(result),
            Ok(Ok(Err(e))) => StepOutcome::Failure(StepFailure::from_error(&e)),
            Ok(Err(join_err)) => {
                tracing::error!("Handler for step {} panicked: {}", step.id, join_err);
                StepOutcome::Failure(
                    StepFailure::new(format!("handler panicked: {}", join_err))
                        .with_traceback(format!("{:?}", join_err)),
                )
            }
            Err(_) => {
                tracing::warn!(
                    "Step {} timed out after {} seconds",
                    step.id,
                    step.timeout_seconds
                );
                StepOutcome::Failure(StepFailure::timeout(step))
            }
        }
    }
}

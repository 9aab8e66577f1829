use crate::error::{EngineError, EngineResult};
use crate::types::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Side effect performed by a step of a given type
///
/// Handlers are synchronous; the executor runs them on the blocking pool.
pub trait StepHandler: Send + Sync {
    fn handle(&self, config: &Payload, input: &Payload) -> anyhow::Result<Payload>;
}

impl<F> StepHandler for F
where
    F: Fn(&Payload, &Payload) -> anyhow::Result<Payload> + Send + Sync,
{
    fn handle(&self, config: &Payload, input: &Payload) -> anyhow::Result<Payload> {
        self(config, input)
    }
}

/// Mapping from step type to handler, built at startup and handed to the orchestrator
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type replaces the earlier one
    pub fn register(&mut self, step_type: impl Into<String>, handler: impl StepHandler + 'static) {
        let step_type = step_type.into();
        if self
            .handlers
            .insert(step_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!("Replaced handler for step type {}", step_type);
        }
    }

    pub fn lookup(&self, step_type: &str) -> EngineResult<Arc<dyn StepHandler>> {
        self.handlers
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::not_found("step handler", step_type))
    }

    /// Registered step types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

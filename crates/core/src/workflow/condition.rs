use crate::types::{Payload, Step};

/// Hook deciding whether a step with a `condition` should run
///
/// Consulted at dispatch time with the input the step would receive. A `false`
/// verdict skips the step with `SkipReason::ConditionNotMet`.
pub trait ConditionEvaluator: Send + Sync {
    fn should_run(&self, step: &Step, input: &Payload) -> bool;
}

/// Default evaluator: every step runs
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRun;

impl ConditionEvaluator for AlwaysRun {
    fn should_run(&self, _step: &Step, _input: &Payload) -> bool {
        true
    }
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&Step, &Payload) -> bool + Send + Sync,
{
    fn should_run(&self, step: &Step, input: &Payload) -> bool {
        self(step, input)
    }
}

use crate::error::{EngineError, EngineResult};
use crate::storage::RunStore;
use crate::types::{
    ExecutionId, Payload, SkipReason, Step, StepExecution, StepExecutionId, StepId, StepStatus,
    Workflow,
};
use std::collections::HashMap;

/// Outcome of one resolver pass over a run snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Pending step executions whose dependencies are all resolved
    pub runnable: Vec<StepExecutionId>,
    /// Pending step executions that can never run because an upstream step failed
    pub skipped: Vec<(StepExecutionId, SkipReason)>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty() && self.skipped.is_empty()
    }
}

/// Readiness of a single dependency
enum DependencyState {
    Resolved,
    Waiting,
    Blocked(StepId),
}

/// Stateless readiness check over a snapshot of a run's step executions
///
/// Nothing is cached between calls: each pass reads statuses fresh, so
/// out-of-order completions are handled as long as the store transitions are atomic.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Classify every pending step execution of the snapshot
    pub fn resolve(workflow: &Workflow, steps: &[StepExecution]) -> Resolution {
        let by_step: HashMap<&StepId, &StepExecution> =
            steps.iter().map(|s| (&s.step_id, s)).collect();

        let mut resolution = Resolution::default();
        for step_exec in steps.iter().filter(|s| s.status == StepStatus::Pending) {
            let Some(step) = workflow.step(&step_exec.step_id) else {
                tracing::warn!(
                    "Step execution {} references step {} missing from workflow {}",
                    step_exec.id,
                    step_exec.step_id,
                    workflow.id
                );
                continue;
            };

            let mut waiting = false;
            let mut blocked_by = None;
            for dep_id in &step.depends_on {
                match dependency_state(dep_id, by_step.get(dep_id).copied()) {
                    DependencyState::Resolved => {}
                    DependencyState::Waiting => waiting = true,
                    DependencyState::Blocked(origin) => {
                        blocked_by = Some(origin);
                        break;
                    }
                }
            }

            if let Some(origin) = blocked_by {
                resolution
                    .skipped
                    .push((step_exec.id, SkipReason::UpstreamFailed { step_id: origin }));
            } else if !waiting {
                resolution.runnable.push(step_exec.id);
            }
        }
        resolution
    }

    /// Resolve a run straight from the store
    pub fn runnable(store: &dyn RunStore, execution_id: ExecutionId) -> EngineResult<Resolution> {
        let execution = store
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::not_found("workflow execution", execution_id))?;
        let workflow = store
            .get_workflow_version(execution.workflow_id, execution.workflow_version)?
            .ok_or_else(|| EngineError::not_found("workflow", execution.workflow_id))?;
        let steps = store.list_step_executions(execution_id)?;
        Ok(Self::resolve(&workflow, &steps))
    }

    /// Input handed to a dependent step: results of its dependencies keyed by step id
    pub fn dependency_input(step: &Step, steps: &[StepExecution]) -> Payload {
        let mut input = Payload::new();
        for dep_id in &step.depends_on {
            let result = steps
                .iter()
                .find(|s| &s.step_id == dep_id && s.status == StepStatus::Completed)
                .and_then(|s| s.result.clone());
            if let Some(result) = result {
                input.insert(dep_id.0.clone(), serde_json::Value::Object(result));
            }
        }
        input
    }
}

fn dependency_state(dep_id: &StepId, dep: Option<&StepExecution>) -> DependencyState {
    let Some(dep) = dep else {
        return DependencyState::Waiting;
    };
    match dep.status {
        StepStatus::Completed => DependencyState::Resolved,
        StepStatus::Failed | StepStatus::Cancelled => DependencyState::Blocked(dep_id.clone()),
        StepStatus::Skipped => match &dep.skip_reason {
            Some(SkipReason::UpstreamFailed { step_id }) => {
                DependencyState::Blocked(step_id.clone())
            }
            Some(SkipReason::ConditionNotMet) | None => DependencyState::Resolved,
        },
        StepStatus::Pending | StepStatus::Running | StepStatus::Retrying => {
            DependencyState::Waiting
        }
    }
}

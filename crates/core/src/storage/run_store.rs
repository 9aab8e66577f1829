use crate::error::{EngineError, EngineResult};
use crate::types::{
    ExecutionId, ExecutionStatus, Payload, SkipReason, StepExecution, StepExecutionId, StepId,
    StepStatus, Workflow, WorkflowExecution, WorkflowId,
};
use chrono::{DateTime, Utc};

/// Computes the patch for a step transition from the record as currently stored
pub type StepDecision<'a> = Box<dyn FnOnce(&StepExecution) -> StepPatch + 'a>;

/// Durable record of workflows, executions and step executions
///
/// `transition_step` and `transition_execution` are compare-and-set
/// operations: the current status is checked against `expected` and the patch
/// is written in one atomic unit. A status outside `expected` yields
/// `EngineError::InvalidState` and leaves the record untouched. The guards a
/// `StepPatch` carries (parent execution status, unclaimed attempt) are checked
/// inside the same unit.
pub trait RunStore: Send + Sync {
    /// Store a workflow. Saving an existing id creates version + 1;
    /// every version stays readable through `get_workflow_version`.
    fn save_workflow(&self, workflow: Workflow) -> EngineResult<Workflow>;

    /// Latest version of a workflow
    fn get_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>>;

    fn get_workflow_version(&self, id: WorkflowId, version: u32)
        -> EngineResult<Option<Workflow>>;

    fn list_workflows(&self) -> EngineResult<Vec<Workflow>>;

    /// Insert an execution together with all of its step executions
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
        steps: &[StepExecution],
    ) -> EngineResult<()>;

    fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<WorkflowExecution>>;

    /// Executions, newest first, optionally filtered by workflow
    fn list_executions(&self, workflow_id: Option<WorkflowId>)
        -> EngineResult<Vec<WorkflowExecution>>;

    fn get_step_execution(&self, id: StepExecutionId) -> EngineResult<Option<StepExecution>>;

    /// Step executions of a run, ordered by step_order
    fn list_step_executions(&self, execution_id: ExecutionId) -> EngineResult<Vec<StepExecution>>;

    fn transition_step(
        &self,
        id: StepExecutionId,
        expected: &[StepStatus],
        patch: StepPatch,
    ) -> EngineResult<StepExecution> {
        self.transition_step_with(id, expected, Box::new(move |_: &StepExecution| patch))
    }

    /// Like `transition_step`, with the patch derived from the stored record
    /// after the status check passes
    fn transition_step_with(
        &self,
        id: StepExecutionId,
        expected: &[StepStatus],
        decide: StepDecision<'_>,
    ) -> EngineResult<StepExecution>;

    /// Entering `completed` or `failed` from a non-terminal status also
    /// updates the workflow's execution statistics in the same write.
    fn transition_execution(
        &self,
        id: ExecutionId,
        expected: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> EngineResult<WorkflowExecution>;

    /// Retrying step executions whose next_retry_at is at or before `now`
    fn due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecution>>;

    /// Step executions currently in `running`
    fn running_steps(&self) -> EngineResult<Vec<StepExecution>>;
}

/// Field updates applied by a step transition
#[derive(Debug, Clone)]
pub struct StepPatch {
    pub status: StepStatus,
    pub input_data: Option<Payload>,
    pub result: Option<Payload>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the field
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// `Some(None)` releases the claim
    pub worker_id: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Parent execution must be in one of these statuses
    pub execution_in: Option<&'static [ExecutionStatus]>,
    /// Step execution must not be claimed by a worker yet
    pub require_unclaimed: bool,
}

impl StepPatch {
    pub fn to(status: StepStatus) -> Self {
        Self {
            status,
            input_data: None,
            result: None,
            error_message: None,
            error_traceback: None,
            skip_reason: None,
            retry_count: None,
            next_retry_at: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            execution_in: None,
            require_unclaimed: false,
        }
    }

    pub fn input_data(mut self, input: Payload) -> Self {
        self.input_data = Some(input);
        self
    }

    pub fn result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, message: impl Into<String>, traceback: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_traceback = traceback;
        self
    }

    pub fn skip_reason(mut self, reason: SkipReason) -> Self {
        self.skip_reason = Some(reason);
        self
    }

    pub fn retry(mut self, retry_count: u32, next_retry_at: DateTime<Utc>) -> Self {
        self.retry_count = Some(retry_count);
        self.next_retry_at = Some(Some(next_retry_at));
        self
    }

    pub fn clear_next_retry(mut self) -> Self {
        self.next_retry_at = Some(None);
        self
    }

    /// Take the current attempt for one worker; fails if another worker holds it
    pub fn claim(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(Some(worker_id.into()));
        self.require_unclaimed = true;
        self
    }

    pub fn release_claim(mut self) -> Self {
        self.worker_id = Some(None);
        self
    }

    /// Only apply while the parent execution is in one of `statuses`
    pub fn when_execution(mut self, statuses: &'static [ExecutionStatus]) -> Self {
        self.execution_in = Some(statuses);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn apply(self, step: &mut StepExecution) {
        step.status = self.status;
        if let Some(input) = self.input_data {
            step.input_data = input;
        }
        if let Some(result) = self.result {
            step.result = Some(result);
        }
        if let Some(message) = self.error_message {
            step.error_message = Some(message);
            step.error_traceback = self.error_traceback;
        }
        if let Some(reason) = self.skip_reason {
            step.skip_reason = Some(reason);
        }
        if let Some(count) = self.retry_count {
            step.retry_count = count;
        }
        if let Some(next) = self.next_retry_at {
            step.next_retry_at = next;
        }
        if let Some(worker) = self.worker_id {
            step.worker_id = worker;
        }
        if let Some(at) = self.started_at {
            step.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            step.completed_at = Some(at);
        }
    }
}

/// Field updates applied by an execution transition
#[derive(Debug, Clone)]
pub struct ExecutionPatch {
    pub status: ExecutionStatus,
    pub output_data: Option<Payload>,
    pub error_message: Option<String>,
    pub failed_step: Option<StepId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPatch {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            status,
            output_data: None,
            error_message: None,
            failed_step: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn output_data(mut self, output: Payload) -> Self {
        self.output_data = Some(output);
        self
    }

    pub fn failure(mut self, message: impl Into<String>, failed_step: Option<StepId>) -> Self {
        self.error_message = Some(message.into());
        self.failed_step = failed_step;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn apply(self, execution: &mut WorkflowExecution) {
        execution.status = self.status;
        if let Some(output) = self.output_data {
            execution.output_data = output;
        }
        if let Some(message) = self.error_message {
            execution.error_message = Some(message);
        }
        if let Some(step) = self.failed_step {
            execution.failed_step = Some(step);
        }
        if let Some(at) = self.started_at {
            execution.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            execution.completed_at = Some(at);
        }
    }
}

/// Outcome to record on the workflow when an execution finishes, if any
pub(crate) fn finished_outcome(
    before: ExecutionStatus,
    after: ExecutionStatus,
) -> Option<bool> {
    if before.is_terminal() {
        return None;
    }
    match after {
        ExecutionStatus::Completed => Some(true),
        ExecutionStatus::Failed => Some(false),
        _ => None,
    }
}

pub(crate) fn record_outcome(workflow: &mut Workflow, succeeded: bool) {
    workflow.total_executions += 1;
    if succeeded {
        workflow.successful_executions += 1;
    }
}

pub(crate) fn check_step_status(
    step: &StepExecution,
    expected: &[StepStatus],
) -> EngineResult<()> {
    if expected.contains(&step.status) {
        Ok(())
    } else {
        Err(EngineError::invalid_state(
            format!("step execution {} ({})", step.id, step.step_id),
            expected,
            step.status,
        ))
    }
}

/// Guards carried by a patch; `parent` is the step's execution as currently stored
pub(crate) fn check_step_guards(
    step: &StepExecution,
    patch: &StepPatch,
    parent: Option<&WorkflowExecution>,
) -> EngineResult<()> {
    if let Some(allowed) = patch.execution_in {
        let parent = parent
            .ok_or_else(|| EngineError::not_found("workflow execution", step.execution_id))?;
        check_execution_status(parent, allowed)?;
    }
    if patch.require_unclaimed {
        if let Some(worker) = &step.worker_id {
            return Err(EngineError::invalid_state(
                format!("step execution {} ({})", step.id, step.step_id),
                &["unclaimed"],
                format!("claimed by {}", worker),
            ));
        }
    }
    Ok(())
}

pub(crate) fn check_execution_status(
    execution: &WorkflowExecution,
    expected: &[ExecutionStatus],
) -> EngineResult<()> {
    if expected.contains(&execution.status) {
        Ok(())
    } else {
        Err(EngineError::invalid_state(
            format!("workflow execution {}", execution.id),
            expected,
            execution.status,
        ))
    }
}

/// Next version number and carried-over statistics for a saved workflow
pub(crate) fn next_version(mut workflow: Workflow, previous: Option<&Workflow>) -> Workflow {
    let now = Utc::now();
    match previous {
        Some(prev) => {
            workflow.version = prev.version + 1;
            workflow.created_at = prev.created_at;
            workflow.total_executions = prev.total_executions;
            workflow.successful_executions = prev.successful_executions;
        }
        None => {
            workflow.version = 1;
        }
    }
    workflow.updated_at = now;
    workflow
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{Step, TriggerSource};

    /// One workflow with a single step, one running execution, one pending step execution
    pub(crate) fn seed(store: &dyn RunStore) -> (Workflow, WorkflowExecution, StepExecution) {
        let workflow = store
            .save_workflow(Workflow::new("seed", vec![Step::new("a", "noop")]))
            .unwrap();
        let mut execution =
            WorkflowExecution::new(&workflow, Payload::new(), TriggerSource::Manual);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        let step = StepExecution::pending(execution.id, &workflow.steps[0], Payload::new());
        store
            .create_execution(&execution, std::slice::from_ref(&step))
            .unwrap();
        (workflow, execution, step)
    }
}

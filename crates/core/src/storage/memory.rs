use super::run_store::{
    check_execution_status, check_step_guards, check_step_status, finished_outcome, next_version,
    record_outcome, ExecutionPatch, RunStore, StepDecision,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{
    ExecutionId, ExecutionStatus, StepExecution, StepExecutionId, StepStatus, Workflow,
    WorkflowExecution, WorkflowId,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    workflows: HashMap<WorkflowId, Workflow>,
    workflow_versions: HashMap<(WorkflowId, u32), Workflow>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    step_executions: HashMap<StepExecutionId, StepExecution>,
    execution_steps: HashMap<ExecutionId, Vec<StepExecutionId>>,
}

/// In-process run store; every operation holds a single lock
#[derive(Default)]
pub struct MemoryRunStore {
    tables: Mutex<Tables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn save_workflow(&self, workflow: Workflow) -> EngineResult<Workflow> {
        let mut tables = self.tables.lock().unwrap();
        let id = workflow.id;
        let workflow = next_version(workflow, tables.workflows.get(&id));
        tables
            .workflow_versions
            .insert((workflow.id, workflow.version), workflow.clone());
        tables.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    fn get_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>> {
        Ok(self.tables.lock().unwrap().workflows.get(&id).cloned())
    }

    fn get_workflow_version(
        &self,
        id: WorkflowId,
        version: u32,
    ) -> EngineResult<Option<Workflow>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .workflow_versions
            .get(&(id, version))
            .cloned())
    }

    fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> =
            self.tables.lock().unwrap().workflows.values().cloned().collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    fn create_execution(
        &self,
        execution: &WorkflowExecution,
        steps: &[StepExecution],
    ) -> EngineResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.executions.insert(execution.id, execution.clone());
        tables
            .execution_steps
            .insert(execution.id, steps.iter().map(|s| s.id).collect());
        for step in steps {
            tables.step_executions.insert(step.id, step.clone());
        }
        Ok(())
    }

    fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<WorkflowExecution>> {
        Ok(self.tables.lock().unwrap().executions.get(&id).cloned())
    }

    fn list_executions(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self
            .tables
            .lock()
            .unwrap()
            .executions
            .values()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    fn get_step_execution(&self, id: StepExecutionId) -> EngineResult<Option<StepExecution>> {
        Ok(self.tables.lock().unwrap().step_executions.get(&id).cloned())
    }

    fn list_step_executions(&self, execution_id: ExecutionId) -> EngineResult<Vec<StepExecution>> {
        let tables = self.tables.lock().unwrap();
        let mut steps: Vec<StepExecution> = tables
            .execution_steps
            .get(&execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.step_executions.get(id).cloned())
            .collect();
        steps.sort_by(|a, b| a.step_order.cmp(&b.step_order).then(a.step_id.cmp(&b.step_id)));
        Ok(steps)
    }

    fn transition_step_with(
        &self,
        id: StepExecutionId,
        expected: &[StepStatus],
        decide: StepDecision<'_>,
    ) -> EngineResult<StepExecution> {
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        let step = tables
            .step_executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("step execution", id))?;
        check_step_status(step, expected)?;

        let patch = decide(&*step);
        check_step_guards(step, &patch, tables.executions.get(&step.execution_id))?;
        patch.apply(step);
        Ok(step.clone())
    }

    fn transition_execution(
        &self,
        id: ExecutionId,
        expected: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> EngineResult<WorkflowExecution> {
        let mut tables = self.tables.lock().unwrap();
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("workflow execution", id))?;
        check_execution_status(execution, expected)?;

        let before = execution.status;
        patch.apply(execution);
        let updated = execution.clone();

        if let Some(succeeded) = finished_outcome(before, updated.status) {
            if let Some(workflow) = tables.workflows.get_mut(&updated.workflow_id) {
                record_outcome(workflow, succeeded);
            }
        }

        Ok(updated)
    }

    fn due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecution>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .step_executions
            .values()
            .filter(|s| {
                s.status == StepStatus::Retrying && s.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect())
    }

    fn running_steps(&self) -> EngineResult<Vec<StepExecution>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .step_executions
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .cloned()
            .collect())
    }
}

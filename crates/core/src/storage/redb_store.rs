use super::run_store::{
    check_execution_status, check_step_guards, check_step_status, finished_outcome, next_version,
    record_outcome, ExecutionPatch, RunStore, StepDecision,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{
    ExecutionId, ExecutionStatus, StepExecution, StepExecutionId, StepStatus, Workflow,
    WorkflowExecution, WorkflowId,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const WORKFLOW_VERSIONS_TABLE: JsonTable = TableDefinition::new("workflow_versions");
const EXECUTIONS_TABLE: JsonTable = TableDefinition::new("executions");
const STEP_EXECUTIONS_TABLE: JsonTable = TableDefinition::new("step_executions");
const EXECUTION_STEPS_TABLE: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("execution_steps");

/// Run store backed by redb
///
/// redb admits one write transaction at a time, so each compare-and-set runs
/// its read, status check and write inside a single write transaction.
#[derive(Clone)]
pub struct RedbRunStore {
    db: Arc<Database>,
}

impl RedbRunStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Tables must exist before the first read transaction opens them
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            write_txn
                .open_table(WORKFLOW_VERSIONS_TABLE)
                .context("Failed to open workflow versions table")?;
            write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            write_txn
                .open_table(STEP_EXECUTIONS_TABLE)
                .context("Failed to open step executions table")?;
            write_txn
                .open_multimap_table(EXECUTION_STEPS_TABLE)
                .context("Failed to open execution steps table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get<T: DeserializeOwned>(
        &self,
        definition: JsonTable,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;
        read_json(&table, key)
    }

    fn scan<T: DeserializeOwned>(&self, definition: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(definition)
            .context("Failed to open table")?;

        let mut items = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            items.push(serde_json::from_slice(value.value()).context("Failed to deserialize record")?);
        }
        Ok(items)
    }
}

fn read_json<T, Tbl>(table: &Tbl, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).context("Failed to get record")? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).context("Failed to deserialize record")?,
        )),
        None => Ok(None),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("Failed to serialize record")
}

fn version_key(id: WorkflowId, version: u32) -> String {
    format!("{}@{:010}", id, version)
}

impl RunStore for RedbRunStore {
    fn save_workflow(&self, workflow: Workflow) -> EngineResult<Workflow> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let saved = {
            let mut latest = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open table")?;
            let key = workflow.id.to_string();
            let previous: Option<Workflow> = read_json(&latest, &key)?;
            let saved = next_version(workflow, previous.as_ref());
            let value = to_json(&saved)?;

            latest
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert workflow")?;

            let mut versions = write_txn
                .open_table(WORKFLOW_VERSIONS_TABLE)
                .context("Failed to open table")?;
            versions
                .insert(version_key(saved.id, saved.version).as_str(), value.as_slice())
                .context("Failed to insert workflow version")?;
            saved
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(saved)
    }

    fn get_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>> {
        Ok(self.get(WORKFLOWS_TABLE, &id.to_string())?)
    }

    fn get_workflow_version(
        &self,
        id: WorkflowId,
        version: u32,
    ) -> EngineResult<Option<Workflow>> {
        Ok(self.get(WORKFLOW_VERSIONS_TABLE, &version_key(id, version))?)
    }

    fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self.scan(WORKFLOWS_TABLE)?;
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    fn create_execution(
        &self,
        execution: &WorkflowExecution,
        steps: &[StepExecution],
    ) -> EngineResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            let key = execution.id.to_string();
            executions
                .insert(key.as_str(), to_json(execution)?.as_slice())
                .context("Failed to insert execution")?;

            let mut step_table = write_txn
                .open_table(STEP_EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            let mut index = write_txn
                .open_multimap_table(EXECUTION_STEPS_TABLE)
                .context("Failed to open table")?;
            for step in steps {
                let step_key = step.id.to_string();
                step_table
                    .insert(step_key.as_str(), to_json(step)?.as_slice())
                    .context("Failed to insert step execution")?;
                index
                    .insert(key.as_str(), step_key.as_str())
                    .context("Failed to index step execution")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<WorkflowExecution>> {
        Ok(self.get(EXECUTIONS_TABLE, &id.to_string())?)
    }

    fn list_executions(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self
            .scan::<WorkflowExecution>(EXECUTIONS_TABLE)?
            .into_iter()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    fn get_step_execution(&self, id: StepExecutionId) -> EngineResult<Option<StepExecution>> {
        Ok(self.get(STEP_EXECUTIONS_TABLE, &id.to_string())?)
    }

    fn list_step_executions(&self, execution_id: ExecutionId) -> EngineResult<Vec<StepExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let index = read_txn
            .open_multimap_table(EXECUTION_STEPS_TABLE)
            .context("Failed to open table")?;
        let step_table = read_txn
            .open_table(STEP_EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let mut steps = Vec::new();
        let key = execution_id.to_string();
        for step_key in index.get(key.as_str()).context("Failed to read index")? {
            let step_key = step_key.context("Failed to read index entry")?;
            if let Some(step) = read_json::<StepExecution, _>(&step_table, step_key.value())? {
                steps.push(step);
            }
        }
        steps.sort_by(|a, b| a.step_order.cmp(&b.step_order).then(a.step_id.cmp(&b.step_id)));
        Ok(steps)
    }

    fn transition_step_with(
        &self,
        id: StepExecutionId,
        expected: &[StepStatus],
        decide: StepDecision<'_>,
    ) -> EngineResult<StepExecution> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut table = write_txn
                .open_table(STEP_EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            let key = id.to_string();
            let mut step: StepExecution = read_json(&table, &key)?
                .ok_or_else(|| EngineError::not_found("step execution", id))?;

            // Dropping the transaction uncommitted leaves the record untouched
            check_step_status(&step, expected)?;
            let patch = decide(&step);

            let parent: Option<WorkflowExecution> = if patch.execution_in.is_some() {
                let executions = write_txn
                    .open_table(EXECUTIONS_TABLE)
                    .context("Failed to open table")?;
                read_json(&executions, &step.execution_id.to_string())?
            } else {
                None
            };
            check_step_guards(&step, &patch, parent.as_ref())?;
            patch.apply(&mut step);

            table
                .insert(key.as_str(), to_json(&step)?.as_slice())
                .context("Failed to update step execution")?;
            step
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    fn transition_execution(
        &self,
        id: ExecutionId,
        expected: &[ExecutionStatus],
        patch: ExecutionPatch,
    ) -> EngineResult<WorkflowExecution> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut table = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            let key = id.to_string();
            let mut execution: WorkflowExecution = read_json(&table, &key)?
                .ok_or_else(|| EngineError::not_found("workflow execution", id))?;
            check_execution_status(&execution, expected)?;

            let before = execution.status;
            patch.apply(&mut execution);
            table
                .insert(key.as_str(), to_json(&execution)?.as_slice())
                .context("Failed to update execution")?;

            if let Some(succeeded) = finished_outcome(before, execution.status) {
                let mut workflows = write_txn
                    .open_table(WORKFLOWS_TABLE)
                    .context("Failed to open table")?;
                let workflow_key = execution.workflow_id.to_string();
                let workflow: Option<Workflow> = read_json(&workflows, &workflow_key)?;
                if let Some(mut workflow) = workflow {
                    record_outcome(&mut workflow, succeeded);
                    workflows
                        .insert(workflow_key.as_str(), to_json(&workflow)?.as_slice())
                        .context("Failed to update workflow statistics")?;
                }
            }
            execution
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    fn due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecution>> {
        Ok(self
            .scan::<StepExecution>(STEP_EXECUTIONS_TABLE)?
            .into_iter()
            .filter(|s| {
                s.status == StepStatus::Retrying && s.next_retry_at.map_or(true, |at| at <= now)
            })
            .collect())
    }

    fn running_steps(&self) -> EngineResult<Vec<StepExecution>> {
        Ok(self
            .scan::<StepExecution>(STEP_EXECUTIONS_TABLE)?
            .into_iter()
            .filter(|s| s.status == StepStatus::Running)
            .collect())
    }
}

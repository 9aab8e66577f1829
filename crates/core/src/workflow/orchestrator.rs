use super::condition::{AlwaysRun, ConditionEvaluator};
use super::dag::WorkflowDag;
use super::handler::HandlerRegistry;
use super::queue::TaskQueue;
use super::resolver::DependencyResolver;
use super::retry::{seconds, RetryDecision, RetryScheduler};
use super::step_executor::{StepExecutor, StepFailure, StepOutcome};
use crate::error::{EngineError, EngineResult};
use crate::events::{record, Event, EventLog, EventType};
use crate::storage::{ExecutionPatch, RunStore, StepPatch};
use crate::types::{
    ExecutionId, ExecutionSnapshot, ExecutionStatus, Payload, SkipReason, StepExecution,
    StepExecutionId, StepStatus, TriggerSource, Workflow, WorkflowExecution, WorkflowId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

const NON_TERMINAL_STEPS: &[StepStatus] =
    &[StepStatus::Pending, StepStatus::Running, StepStatus::Retrying];

/// Drives workflow executions from trigger to terminal state
///
/// Every status change goes through a compare-and-set on the store, so the
/// orchestrator can be invoked concurrently for any mix of step executions.
/// Whoever loses a transition gets `InvalidState` and changes nothing.
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn EventLog>,
    executor: StepExecutor,
    retry: Arc<RetryScheduler>,
    condition: Arc<dyn ConditionEvaluator>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventLog>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let retry = Arc::new(RetryScheduler::new(
            store.clone(),
            queue.clone(),
            events.clone(),
        ));
        Self {
            store,
            queue,
            events,
            executor: StepExecutor::new(registry),
            retry,
            condition: Arc::new(AlwaysRun),
        }
    }

    pub fn with_condition_evaluator(mut self, condition: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition = condition;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn retry_scheduler(&self) -> Arc<RetryScheduler> {
        self.retry.clone()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.executor.registry()
    }

    // ------------------------------------------------------------------
    // Workflow definitions
    // ------------------------------------------------------------------

    /// Validate and store a workflow; an existing id becomes a new version
    pub fn define_workflow(&self, workflow: Workflow) -> EngineResult<Workflow> {
        WorkflowDag::validate(&workflow)?;
        let saved = self.store.save_workflow(workflow)?;
        tracing::info!(
            "Defined workflow {} ({}) version {} with {} steps",
            saved.name,
            saved.id,
            saved.version,
            saved.steps.len()
        );
        Ok(saved)
    }

    pub fn get_workflow(&self, id: WorkflowId) -> EngineResult<Workflow> {
        self.store
            .get_workflow(id)?
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    pub fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
        self.store.list_workflows()
    }

    // ------------------------------------------------------------------
    // Execution lifecycle
    // ------------------------------------------------------------------

    /// Trigger a run of the latest version of a workflow
    pub async fn start(
        &self,
        workflow_id: WorkflowId,
        input: Payload,
        trigger_source: TriggerSource,
    ) -> EngineResult<ExecutionId> {
        let workflow = self.get_workflow(workflow_id)?;
        if !workflow.is_active {
            return Err(EngineError::invalid_state(
                format!("workflow {}", workflow.id),
                &["active"],
                "inactive",
            ));
        }
        WorkflowDag::validate(&workflow)?;

        let execution = WorkflowExecution::new(&workflow, input.clone(), trigger_source);
        let steps: Vec<StepExecution> = workflow
            .steps
            .iter()
            .map(|step| {
                let step_input = if step.is_root() {
                    input.clone()
                } else {
                    Payload::new()
                };
                StepExecution::pending(execution.id, step, step_input)
            })
            .collect();
        self.store.create_execution(&execution, &steps)?;
        self.mark_started(&execution).await?;
        self.progress(execution.id).await?;
        Ok(execution.id)
    }

    /// Record a successful step run and move the execution forward
    ///
    /// Rejected with `InvalidState` unless the step is `running` and its run
    /// still accepts reports, both checked in the same store write.
    pub async fn on_step_completed(
        &self,
        step_execution_id: StepExecutionId,
        result: Payload,
    ) -> EngineResult<StepExecution> {
        let completed = self.store.transition_step(
            step_execution_id,
            &[StepStatus::Running],
            StepPatch::to(StepStatus::Completed)
                .result(result)
                .completed_at(Utc::now())
                .when_execution(ExecutionStatus::ACCEPTING_REPORTS),
        )?;

        tracing::info!(
            "Step {} of execution {} completed",
            completed.step_id,
            completed.execution_id
        );
        self.emit(
            completed.execution_id,
            EventType::StepCompleted {
                step_id: completed.step_id.clone(),
                duration_ms: completed.duration().map(|d| d.num_milliseconds()),
            },
        )
        .await;

        self.progress(completed.execution_id).await?;
        Ok(completed)
    }

    /// Record a failed step run; retries it or fails the execution
    pub async fn on_step_failed(
        &self,
        step_execution_id: StepExecutionId,
        failure: StepFailure,
    ) -> EngineResult<RetryDecision> {
        let step_exec = self.load_step(step_execution_id)?;
        let execution = self.load_execution(step_exec.execution_id)?;
        let workflow = self.workflow_for(&execution)?;
        let step = workflow
            .step(&step_exec.step_id)
            .ok_or_else(|| EngineError::not_found("step", &step_exec.step_id))?;

        let decision = self
            .retry
            .on_failure(step_execution_id, step, &failure, Utc::now())
            .await?;

        if let RetryDecision::Terminate(failed) = &decision {
            self.fail_execution(&workflow, failed).await?;
        }
        Ok(decision)
    }

    /// Run the handler of a dispatched step execution and report its outcome
    ///
    /// The attempt is claimed first; a redelivered task for an attempt some
    /// worker already holds fails with `InvalidState` without running the handler.
    pub async fn execute_step(
        &self,
        step_execution_id: StepExecutionId,
        worker_id: &str,
    ) -> EngineResult<()> {
        let step_exec = self.store.transition_step(
            step_execution_id,
            &[StepStatus::Running],
            StepPatch::to(StepStatus::Running)
                .claim(worker_id)
                .when_execution(ExecutionStatus::ACCEPTING_REPORTS),
        )?;
        let execution = self.load_execution(step_exec.execution_id)?;
        let workflow = self.workflow_for(&execution)?;
        let step = workflow
            .step(&step_exec.step_id)
            .ok_or_else(|| EngineError::not_found("step", &step_exec.step_id))?;

        tracing::debug!(
            "Worker {} executing step {} (attempt {})",
            worker_id,
            step.id,
            step_exec.retry_count + 1
        );

        match self.executor.execute(step, step_exec.input_data.clone()).await {
            StepOutcome::Success(result) => {
                self.on_step_completed(step_execution_id, result).await?;
            }
            StepOutcome::Failure(failure) => {
                self.on_step_failed(step_execution_id, failure).await?;
            }
        }
        Ok(())
    }

    /// Cancel a run and every step execution that has not finished
    ///
    /// Handlers already running are not interrupted; their late reports are rejected.
    pub async fn cancel(
        &self,
        execution_id: ExecutionId,
        reason: Option<String>,
    ) -> EngineResult<WorkflowExecution> {
        let reason = reason.unwrap_or_else(|| "cancelled by request".to_string());
        let cancelled = self.store.transition_execution(
            execution_id,
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
            ],
            ExecutionPatch::to(ExecutionStatus::Cancelled).completed_at(Utc::now()),
        )?;

        tracing::info!("Cancelled execution {}: {}", execution_id, reason);
        self.emit(execution_id, EventType::ExecutionCancelled { reason })
            .await;

        self.cancel_remaining_steps(execution_id).await?;
        Ok(cancelled)
    }

    pub async fn pause(&self, execution_id: ExecutionId) -> EngineResult<WorkflowExecution> {
        let paused = self.store.transition_execution(
            execution_id,
            &[ExecutionStatus::Running],
            ExecutionPatch::to(ExecutionStatus::Paused),
        )?;
        tracing::info!("Paused execution {}", execution_id);
        self.emit(execution_id, EventType::ExecutionPaused).await;
        Ok(paused)
    }

    /// Resume a paused run, dispatching whatever became runnable meanwhile
    pub async fn resume(&self, execution_id: ExecutionId) -> EngineResult<WorkflowExecution> {
        self.store.transition_execution(
            execution_id,
            &[ExecutionStatus::Paused],
            ExecutionPatch::to(ExecutionStatus::Running),
        )?;
        tracing::info!("Resumed execution {}", execution_id);
        self.emit(execution_id, EventType::ExecutionResumed).await;

        self.progress(execution_id).await?;
        self.load_execution(execution_id)
    }

    /// `pending -> running`; a run the recovery sweep already started is left as is
    async fn mark_started(&self, execution: &WorkflowExecution) -> EngineResult<bool> {
        match self.store.transition_execution(
            execution.id,
            &[ExecutionStatus::Pending],
            ExecutionPatch::to(ExecutionStatus::Running).started_at(Utc::now()),
        ) {
            Ok(_) => {}
            Err(e) if e.is_invalid_state() => return Ok(false),
            Err(e) => return Err(e),
        }

        tracing::info!(
            "Started execution {} of workflow {} v{}",
            execution.id,
            execution.workflow_id,
            execution.workflow_version
        );
        self.emit(
            execution.id,
            EventType::ExecutionStarted {
                workflow_id: execution.workflow_id,
                workflow_version: execution.workflow_version,
                trigger_source: execution.trigger_source,
            },
        )
        .await;
        Ok(true)
    }

    /// Drive every unfinished run forward from its stored state
    ///
    /// A crash between a step transition and the resolver pass after it leaves
    /// dependents pending with nothing to dispatch them, and a crash inside
    /// `start` leaves the run pending. This sweep picks both up. Runs at
    /// startup and on every watchdog tick. Returns the dispatched step executions.
    pub async fn recover(&self) -> EngineResult<Vec<StepExecutionId>> {
        let mut dispatched = Vec::new();

        for execution in self.store.list_executions(None)? {
            if execution.status.is_terminal() || execution.status == ExecutionStatus::Paused {
                continue;
            }
            match self.recover_execution(&execution).await {
                Ok(ids) => dispatched.extend(ids),
                Err(e) => tracing::warn!("Recovery of execution {} failed: {}", execution.id, e),
            }
        }

        Ok(dispatched)
    }

    async fn recover_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> EngineResult<Vec<StepExecutionId>> {
        if execution.status == ExecutionStatus::Pending {
            self.mark_started(execution).await?;
        }

        let ids = self.advance(execution.id).await?;
        if !ids.is_empty() {
            tracing::info!(
                "Recovered execution {}: dispatched {} stalled steps",
                execution.id,
                ids.len()
            );
        }
        self.check_completion(execution.id).await?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Resolution and finalisation
    // ------------------------------------------------------------------

    async fn progress(&self, execution_id: ExecutionId) -> EngineResult<()> {
        self.advance(execution_id).await?;
        self.check_completion(execution_id).await?;
        Ok(())
    }

    /// Resolver pass plus dispatch, repeated while skips keep unlocking steps
    ///
    /// Only acts on running executions. Returns the dispatched step executions.
    pub async fn advance(&self, execution_id: ExecutionId) -> EngineResult<Vec<StepExecutionId>> {
        let mut dispatched = Vec::new();

        loop {
            let execution = self.load_execution(execution_id)?;
            if execution.status != ExecutionStatus::Running {
                return Ok(dispatched);
            }
            let workflow = self.workflow_for(&execution)?;
            let steps = self.store.list_step_executions(execution_id)?;
            let resolution = DependencyResolver::resolve(&workflow, &steps);
            if resolution.is_empty() {
                break;
            }

            let mut skipped_any = false;
            for (id, reason) in resolution.skipped {
                skipped_any |= self.skip_step(id, reason).await?;
            }

            for id in resolution.runnable {
                let Some(step_exec) = steps.iter().find(|s| s.id == id) else {
                    continue;
                };
                let Some(step) = workflow.step(&step_exec.step_id) else {
                    continue;
                };

                let input = if step.is_root() {
                    step_exec.input_data.clone()
                } else {
                    DependencyResolver::dependency_input(step, &steps)
                };

                if step.condition.is_some() && !self.condition.should_run(step, &input) {
                    tracing::info!("Condition not met for step {}, skipping", step.id);
                    skipped_any |= self.skip_step(id, SkipReason::ConditionNotMet).await?;
                    continue;
                }

                let running = match self.store.transition_step(
                    id,
                    &[StepStatus::Pending],
                    StepPatch::to(StepStatus::Running)
                        .input_data(input)
                        .started_at(Utc::now())
                        .when_execution(ExecutionStatus::DISPATCHING),
                ) {
                    Ok(step) => step,
                    Err(e) if e.is_invalid_state() => {
                        tracing::debug!("Step {} not dispatched: {}", step.id, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                tracing::info!(
                    "Dispatching step {} of execution {}",
                    running.step_id,
                    execution_id
                );
                self.emit(
                    execution_id,
                    EventType::StepDispatched {
                        step_id: running.step_id.clone(),
                        step_execution_id: running.id,
                        attempt: running.retry_count + 1,
                    },
                )
                .await;

                if let Err(e) = self.queue.enqueue(running.id).await {
                    tracing::error!("Failed to enqueue step {}: {:#}", running.step_id, e);
                    continue;
                }
                dispatched.push(running.id);
            }

            if !skipped_any {
                break;
            }
        }

        Ok(dispatched)
    }

    /// Finalise a running execution once every step execution is terminal
    ///
    /// Returns the finalised execution, or `None` when the run is not finished
    /// or was already finalised. Calling it again after finalisation is a no-op.
    pub async fn check_completion(
        &self,
        execution_id: ExecutionId,
    ) -> EngineResult<Option<WorkflowExecution>> {
        let execution = self.load_execution(execution_id)?;
        if execution.status != ExecutionStatus::Running {
            return Ok(None);
        }

        let steps = self.store.list_step_executions(execution_id)?;
        if !steps.iter().all(|s| s.status.is_terminal()) {
            return Ok(None);
        }

        let now = Utc::now();
        let failed = steps.iter().find(|s| s.status == StepStatus::Failed);
        let (patch, event) = match failed {
            Some(step) => {
                let message = terminal_failure_message(step);
                (
                    ExecutionPatch::to(ExecutionStatus::Failed)
                        .failure(message.clone(), Some(step.step_id.clone()))
                        .completed_at(now),
                    EventType::ExecutionFailed {
                        error: message,
                        failed_step: Some(step.step_id.clone()),
                    },
                )
            }
            None => {
                let output: Payload = steps
                    .iter()
                    .filter_map(|s| {
                        s.result
                            .clone()
                            .map(|r| (s.step_id.0.clone(), serde_json::Value::Object(r)))
                    })
                    .collect();
                let duration_secs = execution
                    .started_at
                    .map_or(0, |started| (now - started).num_seconds());
                (
                    ExecutionPatch::to(ExecutionStatus::Completed)
                        .output_data(output)
                        .completed_at(now),
                    EventType::ExecutionCompleted { duration_secs },
                )
            }
        };

        let finalised = match self.store.transition_execution(
            execution_id,
            &[ExecutionStatus::Running],
            patch,
        ) {
            Ok(execution) => execution,
            Err(e) if e.is_invalid_state() => return Ok(None),
            Err(e) => return Err(e),
        };

        tracing::info!("Execution {} finished: {}", execution_id, finalised.status);
        self.emit(execution_id, event).await;
        Ok(Some(finalised))
    }

    /// A step failed for good: cascade skips, fail the run, cancel the rest
    async fn fail_execution(&self, workflow: &Workflow, failed: &StepExecution) -> EngineResult<()> {
        let execution_id = failed.execution_id;
        self.cascade_skips(workflow, execution_id).await?;

        let downstream =
            WorkflowDag::from_workflow(workflow)?.transitive_dependents(&failed.step_id)?;
        let stranded = self
            .store
            .list_step_executions(execution_id)?
            .into_iter()
            .filter(|s| downstream.contains(&s.step_id) && !s.status.is_terminal())
            .count();
        if stranded > 0 {
            tracing::warn!(
                "{} dependents of step {} left unresolved by the cascade",
                stranded,
                failed.step_id
            );
        }

        let message = terminal_failure_message(failed);
        match self.store.transition_execution(
            execution_id,
            ExecutionStatus::ACCEPTING_REPORTS,
            ExecutionPatch::to(ExecutionStatus::Failed)
                .failure(message.clone(), Some(failed.step_id.clone()))
                .completed_at(Utc::now()),
        ) {
            Ok(_) => {}
            Err(e) if e.is_invalid_state() => {
                tracing::debug!("Execution {} already finalised", execution_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        tracing::warn!("Execution {} failed: {}", execution_id, message);
        self.emit(
            execution_id,
            EventType::ExecutionFailed {
                error: message,
                failed_step: Some(failed.step_id.clone()),
            },
        )
        .await;

        self.cancel_remaining_steps(execution_id).await
    }

    /// Resolver passes that only apply skips, until nothing changes
    async fn cascade_skips(&self, workflow: &Workflow, execution_id: ExecutionId) -> EngineResult<()> {
        loop {
            let steps = self.store.list_step_executions(execution_id)?;
            let resolution = DependencyResolver::resolve(workflow, &steps);
            let mut skipped_any = false;
            for (id, reason) in resolution.skipped {
                skipped_any |= self.skip_step(id, reason).await?;
            }
            if !skipped_any {
                return Ok(());
            }
        }
    }

    async fn skip_step(&self, id: StepExecutionId, reason: SkipReason) -> EngineResult<bool> {
        let skipped = match self.store.transition_step(
            id,
            &[StepStatus::Pending],
            StepPatch::to(StepStatus::Skipped)
                .skip_reason(reason.clone())
                .completed_at(Utc::now())
                .when_execution(ExecutionStatus::ACCEPTING_REPORTS),
        ) {
            Ok(step) => step,
            Err(e) if e.is_invalid_state() => return Ok(false),
            Err(e) => return Err(e),
        };

        tracing::info!("Skipped step {} ({:?})", skipped.step_id, reason);
        self.emit(
            skipped.execution_id,
            EventType::StepSkipped {
                step_id: skipped.step_id.clone(),
                reason,
            },
        )
        .await;
        Ok(true)
    }

    async fn cancel_remaining_steps(&self, execution_id: ExecutionId) -> EngineResult<()> {
        let now = Utc::now();
        for step in self.store.list_step_executions(execution_id)? {
            if step.status.is_terminal() {
                continue;
            }
            match self.store.transition_step(
                step.id,
                NON_TERMINAL_STEPS,
                StepPatch::to(StepStatus::Cancelled)
                    .clear_next_retry()
                    .completed_at(now),
            ) {
                Ok(cancelled) => {
                    self.emit(
                        execution_id,
                        EventType::StepCancelled {
                            step_id: cancelled.step_id,
                        },
                    )
                    .await;
                }
                Err(e) if e.is_invalid_state() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Fail every running step execution past its step's timeout through the retry path
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecutionId>> {
        let mut timed_out = Vec::new();

        for step_exec in self.store.running_steps()? {
            let Some(started_at) = step_exec.started_at else {
                continue;
            };
            let Some(execution) = self.store.get_execution(step_exec.execution_id)? else {
                continue;
            };
            let workflow = self.workflow_for(&execution)?;
            let Some(step) = workflow.step(&step_exec.step_id) else {
                continue;
            };

            let deadline = started_at.checked_add_signed(seconds(step.timeout_seconds));
            if deadline.map_or(true, |deadline| deadline > now) {
                continue;
            }

            match self
                .on_step_failed(step_exec.id, StepFailure::timeout(step))
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        "Step {} of execution {} timed out after {}s",
                        step.id,
                        execution.id,
                        step.timeout_seconds
                    );
                    self.emit(
                        execution.id,
                        EventType::StepTimedOut {
                            step_id: step.id.clone(),
                            timeout_seconds: step.timeout_seconds,
                        },
                    )
                    .await;
                    timed_out.push(step_exec.id);
                }
                Err(e) if e.is_invalid_state() => {
                    tracing::debug!("Step execution {} finished before timeout", step_exec.id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(timed_out)
    }

    /// Run `check_timeouts` and `recover` on a fixed interval until the task is aborted
    pub fn spawn_timeout_watchdog(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.check_timeouts(Utc::now()).await {
                    tracing::error!("Timeout watchdog failed: {}", e);
                }
                if let Err(e) = self.recover().await {
                    tracing::error!("Recovery sweep failed: {}", e);
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn query_status(&self, execution_id: ExecutionId) -> EngineResult<ExecutionSnapshot> {
        let execution = self.load_execution(execution_id)?;
        let steps = self.store.list_step_executions(execution_id)?;
        Ok(ExecutionSnapshot { execution, steps })
    }

    pub fn list_executions(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        self.store.list_executions(workflow_id)
    }

    /// Audit trail of one execution
    pub async fn execution_events(&self, execution_id: ExecutionId) -> EngineResult<Vec<Event>> {
        self.load_execution(execution_id)?;
        Ok(self.events.get_execution_events(execution_id).await?)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn load_execution(&self, id: ExecutionId) -> EngineResult<WorkflowExecution> {
        self.store
            .get_execution(id)?
            .ok_or_else(|| EngineError::not_found("workflow execution", id))
    }

    fn load_step(&self, id: StepExecutionId) -> EngineResult<StepExecution> {
        self.store
            .get_step_execution(id)?
            .ok_or_else(|| EngineError::not_found("step execution", id))
    }

    /// The exact workflow version an execution was started from
    fn workflow_for(&self, execution: &WorkflowExecution) -> EngineResult<Workflow> {
        self.store
            .get_workflow_version(execution.workflow_id, execution.workflow_version)?
            .ok_or_else(|| {
                EngineError::not_found(
                    "workflow",
                    format!("{}@{}", execution.workflow_id, execution.workflow_version),
                )
            })
    }

    async fn emit(&self, execution_id: ExecutionId, event_type: EventType) {
        record(self.events.as_ref(), Event::new(execution_id, event_type)).await;
    }
}

fn terminal_failure_message(step: &StepExecution) -> String {
    EngineError::MaxRetriesExceeded {
        step: step.step_id.clone(),
        retries: step.retry_count,
        message: step
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::storage::{MemoryRunStore, StepDecision};
    use crate::types::{Step, StepId};
    use crate::workflow::builtin::register_builtin;
    use crate::workflow::queue::RecordingTaskQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<MemoryRunStore>,
        queue: Arc<RecordingTaskQueue>,
        events: Arc<MemoryEventLog>,
    }

    fn harness_with(
        condition: Option<Arc<dyn ConditionEvaluator>>,
        register: impl FnOnce(&mut HandlerRegistry),
    ) -> Harness {
        let store = Arc::new(MemoryRunStore::new());
        let queue = Arc::new(RecordingTaskQueue::new());
        let events = Arc::new(MemoryEventLog::new());

        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry);
        registry.register("fail", |_: &Payload, _: &Payload| {
            Err::<Payload, _>(anyhow::anyhow!("provider unavailable"))
        });
        register(&mut registry);

        let mut orchestrator = Orchestrator::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(registry),
        );
        if let Some(condition) = condition {
            orchestrator = orchestrator.with_condition_evaluator(condition);
        }

        Harness {
            orchestrator: Arc::new(orchestrator),
            store,
            queue,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(None, |_| {})
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn diamond(max_retries: u32) -> Workflow {
        Workflow::new(
            "diamond",
            vec![
                Step::new("a", "noop").with_retries(max_retries, 60),
                Step::new("b", "noop").depends_on(["a"]).with_order(1),
                Step::new("c", "noop").depends_on(["a"]).with_order(2),
                Step::new("d", "noop").depends_on(["b", "c"]).with_order(3),
            ],
        )
    }

    impl Harness {
        fn step(&self, execution_id: ExecutionId, step_id: &str) -> StepExecution {
            self.orchestrator
                .query_status(execution_id)
                .unwrap()
                .step(&StepId::new(step_id))
                .cloned()
                .unwrap()
        }

        fn execution(&self, execution_id: ExecutionId) -> WorkflowExecution {
            self.orchestrator.query_status(execution_id).unwrap().execution
        }

        /// Step ids enqueued since the last call, sorted
        fn dispatched(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .queue
                .drain()
                .into_iter()
                .map(|id| {
                    self.store
                        .get_step_execution(id)
                        .unwrap()
                        .unwrap()
                        .step_id
                        .0
                })
                .collect();
            names.sort();
            names
        }

        async fn complete(&self, execution_id: ExecutionId, step_id: &str) {
            let step = self.step(execution_id, step_id);
            self.orchestrator
                .on_step_completed(step.id, payload(json!({ "done": step_id })))
                .await
                .unwrap();
        }

        async fn start(&self, workflow: Workflow) -> ExecutionId {
            let workflow = self.orchestrator.define_workflow(workflow).unwrap();
            self.orchestrator
                .start(workflow.id, payload(json!({"patient": "ada"})), TriggerSource::Manual)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_diamond_runs_in_dependency_order() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        assert_eq!(h.dispatched(), vec!["a"]);
        assert_eq!(h.step(execution_id, "a").input_data["patient"], json!("ada"));

        h.complete(execution_id, "a").await;
        assert_eq!(h.dispatched(), vec!["b", "c"]);

        h.complete(execution_id, "b").await;
        assert!(h.dispatched().is_empty());
        assert_eq!(h.step(execution_id, "d").status, StepStatus::Pending);

        h.complete(execution_id, "c").await;
        assert_eq!(h.dispatched(), vec!["d"]);
        let d = h.step(execution_id, "d");
        assert_eq!(d.input_data["b"], json!({"done": "b"}));
        assert_eq!(d.input_data["c"], json!({"done": "c"}));

        h.complete(execution_id, "d").await;
        let execution = h.execution(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(execution.output_data[id], json!({ "done": id }));
        }

        let workflow = h.orchestrator.get_workflow(execution.workflow_id).unwrap();
        assert_eq!(workflow.total_executions, 1);
        assert_eq!(workflow.successful_executions, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_dependents() {
        let h = harness();
        let execution_id = h.start(diamond(0)).await;
        h.dispatched();

        let a = h.step(execution_id, "a");
        let decision = h
            .orchestrator
            .on_step_failed(a.id, StepFailure::new("boom"))
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::Terminate(_)));

        for id in ["b", "c", "d"] {
            let step = h.step(execution_id, id);
            assert_eq!(step.status, StepStatus::Skipped);
            assert_eq!(
                step.skip_reason,
                Some(SkipReason::UpstreamFailed {
                    step_id: StepId::new("a")
                })
            );
        }

        let execution = h.execution(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_step, Some(StepId::new("a")));
        assert_eq!(
            execution.error_message.as_deref(),
            Some("Step 'a' failed after 0 retries: boom")
        );
        assert!(h.dispatched().is_empty());

        let workflow = h.orchestrator.get_workflow(execution.workflow_id).unwrap();
        assert_eq!(workflow.total_executions, 1);
        assert_eq!(workflow.successful_executions, 0);
    }

    #[tokio::test]
    async fn test_retry_backoff_then_terminal_failure() {
        let h = harness();
        let execution_id = h.start(diamond(2)).await;
        h.dispatched();
        let retry = h.orchestrator.retry_scheduler();

        let a = h.step(execution_id, "a");
        let before = Utc::now();
        let decision = h
            .orchestrator
            .on_step_failed(a.id, StepFailure::new("boom"))
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::Retry { delay, .. } if delay.num_seconds() == 60));

        let a = h.step(execution_id, "a");
        assert_eq!(a.status, StepStatus::Retrying);
        assert_eq!(a.retry_count, 1);
        let next = a.next_retry_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(60));

        assert!(retry.dispatch_due(Utc::now()).await.unwrap().is_empty());
        let ids = retry.dispatch_due(next).await.unwrap();
        assert_eq!(ids, vec![a.id]);
        assert_eq!(h.dispatched(), vec!["a"]);
        assert_eq!(h.step(execution_id, "a").status, StepStatus::Running);

        let decision = h
            .orchestrator
            .on_step_failed(a.id, StepFailure::new("boom"))
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::Retry { delay, .. } if delay.num_seconds() == 120));

        let next = h.step(execution_id, "a").next_retry_at.unwrap();
        retry.dispatch_due(next).await.unwrap();
        let decision = h
            .orchestrator
            .on_step_failed(a.id, StepFailure::new("still down"))
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::Terminate(_)));

        let execution = h.execution(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error_message.as_deref(),
            Some("Step 'a' failed after 2 retries: still down")
        );
    }

    #[tokio::test]
    async fn test_duplicate_completion_has_no_side_effect() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        h.dispatched();
        h.complete(execution_id, "a").await;
        assert_eq!(h.dispatched(), vec!["b", "c"]);
        let events_before = h.events.get_execution_events(execution_id).await.unwrap().len();

        let a = h.step(execution_id, "a");
        let err = h
            .orchestrator
            .on_step_completed(a.id, payload(json!({"done": "again"})))
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());

        assert!(h.dispatched().is_empty());
        assert_eq!(h.step(execution_id, "a").result, Some(payload(json!({"done": "a"}))));
        let events_after = h.events.get_execution_events(execution_id).await.unwrap().len();
        assert_eq!(events_before, events_after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_have_one_winner() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        h.dispatched();
        let a = h.step(execution_id, "a");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .on_step_completed(a.id, Payload::new())
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.dispatched(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_check_completion_is_idempotent() {
        let h = harness();
        let execution_id = h.start(Workflow::new("single", vec![Step::new("a", "noop")])).await;
        h.complete(execution_id, "a").await;

        let finished = h.execution(execution_id);
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert!(h
            .orchestrator
            .check_completion(execution_id)
            .await
            .unwrap()
            .is_none());

        let again = h.execution(execution_id);
        assert_eq!(again.output_data, finished.output_data);
        assert_eq!(again.completed_at, finished.completed_at);
        let workflow = h.orchestrator.get_workflow(finished.workflow_id).unwrap();
        assert_eq!(workflow.total_executions, 1);
    }

    #[tokio::test]
    async fn test_cancel_ignores_late_completion() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        h.dispatched();

        let cancelled = h
            .orchestrator
            .cancel(execution_id, Some("operator request".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(h.step(execution_id, id).status, StepStatus::Cancelled);
        }

        let a = h.step(execution_id, "a");
        let err = h
            .orchestrator
            .on_step_completed(a.id, Payload::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
        assert!(h.orchestrator.cancel(execution_id, None).await.is_err());

        let workflow = h.orchestrator.get_workflow(cancelled.workflow_id).unwrap();
        assert_eq!(workflow.total_executions, 0);
    }

    #[tokio::test]
    async fn test_pause_holds_dispatch_until_resume() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        h.dispatched();

        h.orchestrator.pause(execution_id).await.unwrap();
        h.complete(execution_id, "a").await;
        assert_eq!(h.step(execution_id, "a").status, StepStatus::Completed);
        assert!(h.dispatched().is_empty());
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Paused);

        let resumed = h.orchestrator.resume(execution_id).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert_eq!(h.dispatched(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_cyclic_and_unknown_workflows_rejected() {
        let h = harness();
        let cyclic = Workflow::new(
            "cyclic",
            vec![
                Step::new("a", "noop").depends_on(["b"]),
                Step::new("b", "noop").depends_on(["a"]),
            ],
        );
        let id = cyclic.id;
        let err = h.orchestrator.define_workflow(cyclic).unwrap_err();
        assert!(matches!(err, EngineError::Cycle { .. }));

        let err = h
            .orchestrator
            .start(id, Payload::new(), TriggerSource::Manual)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(h.orchestrator.list_executions(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_workflow_cannot_start() {
        let h = harness();
        let mut workflow = Workflow::new("inactive", vec![Step::new("a", "noop")]);
        workflow.is_active = false;
        let workflow = h.orchestrator.define_workflow(workflow).unwrap();

        let err = h
            .orchestrator
            .start(workflow.id, Payload::new(), TriggerSource::Webhook)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_condition_skip_lets_dependents_run() {
        let condition: Arc<dyn ConditionEvaluator> =
            Arc::new(|step: &Step, _: &Payload| step.id.0 != "reminder");
        let h = harness_with(Some(condition), |_| {});
        let mut reminder = Step::new("reminder", "noop").depends_on(["intake"]);
        reminder.condition = Some(payload(json!({"field": "opted_in", "equals": true})));
        let workflow = Workflow::new(
            "conditional",
            vec![
                Step::new("intake", "noop"),
                reminder,
                Step::new("followup", "noop").depends_on(["reminder"]),
            ],
        );

        let execution_id = h.start(workflow).await;
        h.dispatched();
        h.complete(execution_id, "intake").await;

        let reminder = h.step(execution_id, "reminder");
        assert_eq!(reminder.status, StepStatus::Skipped);
        assert_eq!(reminder.skip_reason, Some(SkipReason::ConditionNotMet));
        assert_eq!(h.dispatched(), vec!["followup"]);

        h.complete(execution_id, "followup").await;
        let execution = h.execution(execution_id);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(!execution.output_data.contains_key("reminder"));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_independent_branch() {
        let h = harness();
        let workflow = Workflow::new(
            "branches",
            vec![
                Step::new("charge", "noop").with_retries(0, 1),
                Step::new("receipt", "noop").depends_on(["charge"]),
                Step::new("notify", "noop"),
            ],
        );
        let execution_id = h.start(workflow).await;
        assert_eq!(h.dispatched(), vec!["charge", "notify"]);

        let charge = h.step(execution_id, "charge");
        h.orchestrator
            .on_step_failed(charge.id, StepFailure::new("card declined"))
            .await
            .unwrap();

        assert_eq!(h.step(execution_id, "receipt").status, StepStatus::Skipped);
        let notify = h.step(execution_id, "notify");
        assert_eq!(notify.status, StepStatus::Cancelled);
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Failed);

        let err = h
            .orchestrator
            .on_step_completed(notify.id, Payload::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_execute_step_runs_handlers_end_to_end() {
        let h = harness();
        let workflow = Workflow::new(
            "onboarding",
            vec![
                Step::new("register", "create_patient")
                    .with_config(payload(json!({"name": "Ada Lovelace"}))),
                Step::new("welcome", "noop").depends_on(["register"]),
            ],
        );
        let execution_id = h.start(workflow).await;

        loop {
            let ids = h.queue.drain();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                h.orchestrator.execute_step(id, "worker-1").await.unwrap();
            }
        }

        let snapshot = h.orchestrator.query_status(execution_id).unwrap();
        assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
        let welcome = snapshot.step(&StepId::new("welcome")).unwrap();
        assert_eq!(welcome.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(
            welcome.input_data["register"]["name"],
            json!("Ada Lovelace")
        );
        assert_eq!(
            snapshot.execution.output_data["register"]["patient_created"],
            json!(true)
        );
    }

    #[tokio::test]
    async fn test_failing_handler_goes_through_retry_path() {
        let h = harness();
        let workflow = Workflow::new("flaky", vec![Step::new("call", "fail").with_retries(1, 30)]);
        let execution_id = h.start(workflow).await;

        let id = h.queue.drain()[0];
        h.orchestrator.execute_step(id, "worker-1").await.unwrap();
        let call = h.step(execution_id, "call");
        assert_eq!(call.status, StepStatus::Retrying);
        assert_eq!(call.error_message.as_deref(), Some("provider unavailable"));
        assert!(call.error_traceback.is_some());

        // a stale delivery of the same task is rejected
        let err = h.orchestrator.execute_step(id, "worker-2").await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_timed_out_step_is_retried() {
        let h = harness();
        let workflow = Workflow::new("slow", vec![Step::new("a", "noop").with_timeout(30)]);
        let execution_id = h.start(workflow).await;
        h.dispatched();

        let now = Utc::now();
        assert!(h.orchestrator.check_timeouts(now).await.unwrap().is_empty());

        let timed_out = h
            .orchestrator
            .check_timeouts(now + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(timed_out.len(), 1);
        let a = h.step(execution_id, "a");
        assert_eq!(a.status, StepStatus::Retrying);
        assert!(a.error_message.unwrap().contains("timed out after 30 seconds"));

        let events = h.events.get_execution_events(execution_id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.event_type, EventType::StepTimedOut { .. })));
    }

    #[tokio::test]
    async fn test_runs_keep_their_workflow_version() {
        let h = harness();
        let workflow = h
            .orchestrator
            .define_workflow(Workflow::new("versioned", vec![Step::new("a", "noop")]))
            .unwrap();
        let first = h
            .orchestrator
            .start(workflow.id, Payload::new(), TriggerSource::Manual)
            .await
            .unwrap();

        let mut edited = workflow.clone();
        edited.steps.push(Step::new("b", "noop").depends_on(["a"]));
        let edited = h.orchestrator.define_workflow(edited).unwrap();
        assert_eq!(edited.version, 2);

        h.complete(first, "a").await;
        let execution = h.execution(first);
        assert_eq!(execution.workflow_version, 1);
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let second = h
            .orchestrator
            .start(workflow.id, Payload::new(), TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(h.orchestrator.query_status(second).unwrap().steps.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redelivered_task_runs_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let h = harness_with(None, move |registry| {
            registry.register("charge", move |_: &Payload, _: &Payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(200));
                Ok::<_, anyhow::Error>(Payload::new())
            });
        });
        let execution_id = h
            .start(Workflow::new("billing", vec![Step::new("charge", "charge")]))
            .await;
        let id = h.queue.drain()[0];

        let deliveries: Vec<_> = (0..2)
            .map(|n| {
                let orchestrator = h.orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .execute_step(id, &format!("worker-{}", n))
                        .await
                })
            })
            .collect();

        let mut succeeded = 0;
        for delivery in deliveries {
            match delivery.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(e) => assert!(e.is_invalid_state()),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_attempt_can_be_claimed_again() {
        let h = harness();
        let workflow = Workflow::new("flaky", vec![Step::new("call", "fail").with_retries(1, 30)]);
        let execution_id = h.start(workflow).await;

        let id = h.queue.drain()[0];
        h.orchestrator.execute_step(id, "worker-1").await.unwrap();
        assert!(h.step(execution_id, "call").worker_id.is_none());

        let next = h.step(execution_id, "call").next_retry_at.unwrap();
        h.orchestrator.retry_scheduler().dispatch_due(next).await.unwrap();
        assert_eq!(h.queue.drain(), vec![id]);
        h.orchestrator.execute_step(id, "worker-2").await.unwrap();

        let call = h.step(execution_id, "call");
        assert_eq!(call.status, StepStatus::Failed);
        assert_eq!(call.worker_id.as_deref(), Some("worker-2"));
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sibling_completions_dispatch_join_once() {
        for _ in 0..20 {
            let h = harness();
            let execution_id = h.start(diamond(3)).await;
            h.dispatched();
            h.complete(execution_id, "a").await;
            assert_eq!(h.dispatched(), vec!["b", "c"]);

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let siblings: Vec<_> = ["b", "c"]
                .into_iter()
                .map(|step_id| {
                    let orchestrator = h.orchestrator.clone();
                    let barrier = barrier.clone();
                    let id = h.step(execution_id, step_id).id;
                    tokio::spawn(async move {
                        barrier.wait().await;
                        orchestrator
                            .on_step_completed(id, payload(json!({ "done": step_id })))
                            .await
                    })
                })
                .collect();
            for sibling in siblings {
                sibling.await.unwrap().unwrap();
            }

            assert_eq!(h.dispatched(), vec!["d"]);
            h.complete(execution_id, "d").await;

            let execution = h.execution(execution_id);
            assert_eq!(execution.status, ExecutionStatus::Completed);
            let workflow = h.orchestrator.get_workflow(execution.workflow_id).unwrap();
            assert_eq!(workflow.total_executions, 1);
            let finished = h
                .events
                .get_execution_events(execution_id)
                .await
                .unwrap()
                .iter()
                .filter(|e| matches!(e.event_type, EventType::ExecutionCompleted { .. }))
                .count();
            assert_eq!(finished, 1);
        }
    }

    #[tokio::test]
    async fn test_recover_dispatches_stranded_dependents() {
        let h = harness();
        let execution_id = h.start(diamond(3)).await;
        h.dispatched();

        // completion stored, resolver pass lost
        let a = h.step(execution_id, "a");
        h.store
            .transition_step(
                a.id,
                &[StepStatus::Running],
                StepPatch::to(StepStatus::Completed).result(payload(json!({"done": "a"}))),
            )
            .unwrap();
        assert!(h.dispatched().is_empty());

        let recovered = h.orchestrator.recover().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(h.dispatched(), vec!["b", "c"]);
        assert!(h.orchestrator.recover().await.unwrap().is_empty());

        h.complete(execution_id, "b").await;
        h.complete(execution_id, "c").await;
        assert_eq!(h.dispatched(), vec!["d"]);
        let d = h.step(execution_id, "d");
        h.store
            .transition_step(d.id, &[StepStatus::Running], StepPatch::to(StepStatus::Completed))
            .unwrap();
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Running);

        h.orchestrator.recover().await.unwrap();
        assert_eq!(h.execution(execution_id).status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_recover_starts_interrupted_run() {
        let h = harness();
        let workflow = h.orchestrator.define_workflow(diamond(3)).unwrap();
        let execution = WorkflowExecution::new(&workflow, Payload::new(), TriggerSource::Schedule);
        let steps: Vec<StepExecution> = workflow
            .steps
            .iter()
            .map(|step| StepExecution::pending(execution.id, step, Payload::new()))
            .collect();
        h.store.create_execution(&execution, &steps).unwrap();

        h.orchestrator.recover().await.unwrap();
        assert_eq!(h.execution(execution.id).status, ExecutionStatus::Running);
        assert_eq!(h.dispatched(), vec!["a"]);

        let started = h
            .events
            .get_execution_events(execution.id)
            .await
            .unwrap()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::ExecutionStarted { .. }))
            .count();
        assert_eq!(started, 1);
    }

    /// Cancels the run of one chosen step execution just before that step's next write
    struct CancelBeforeStepWrite {
        inner: MemoryRunStore,
        target: Mutex<Option<StepExecutionId>>,
    }

    impl RunStore for CancelBeforeStepWrite {
        fn save_workflow(&self, workflow: Workflow) -> EngineResult<Workflow> {
            self.inner.save_workflow(workflow)
        }

        fn get_workflow(&self, id: WorkflowId) -> EngineResult<Option<Workflow>> {
            self.inner.get_workflow(id)
        }

        fn get_workflow_version(
            &self,
            id: WorkflowId,
            version: u32,
        ) -> EngineResult<Option<Workflow>> {
            self.inner.get_workflow_version(id, version)
        }

        fn list_workflows(&self) -> EngineResult<Vec<Workflow>> {
            self.inner.list_workflows()
        }

        fn create_execution(
            &self,
            execution: &WorkflowExecution,
            steps: &[StepExecution],
        ) -> EngineResult<()> {
            self.inner.create_execution(execution, steps)
        }

        fn get_execution(&self, id: ExecutionId) -> EngineResult<Option<WorkflowExecution>> {
            self.inner.get_execution(id)
        }

        fn list_executions(
            &self,
            workflow_id: Option<WorkflowId>,
        ) -> EngineResult<Vec<WorkflowExecution>> {
            self.inner.list_executions(workflow_id)
        }

        fn get_step_execution(&self, id: StepExecutionId) -> EngineResult<Option<StepExecution>> {
            self.inner.get_step_execution(id)
        }

        fn list_step_executions(
            &self,
            execution_id: ExecutionId,
        ) -> EngineResult<Vec<StepExecution>> {
            self.inner.list_step_executions(execution_id)
        }

        fn transition_step_with(
            &self,
            id: StepExecutionId,
            expected: &[StepStatus],
            decide: StepDecision<'_>,
        ) -> EngineResult<StepExecution> {
            let hit = {
                let mut target = self.target.lock().unwrap();
                if *target == Some(id) {
                    *target = None;
                    true
                } else {
                    false
                }
            };
            if hit {
                let step = self.inner.get_step_execution(id)?.unwrap();
                self.inner.transition_execution(
                    step.execution_id,
                    &[ExecutionStatus::Running],
                    ExecutionPatch::to(ExecutionStatus::Cancelled),
                )?;
            }
            self.inner.transition_step_with(id, expected, decide)
        }

        fn transition_execution(
            &self,
            id: ExecutionId,
            expected: &[ExecutionStatus],
            patch: ExecutionPatch,
        ) -> EngineResult<WorkflowExecution> {
            self.inner.transition_execution(id, expected, patch)
        }

        fn due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecution>> {
            self.inner.due_retries(now)
        }

        fn running_steps(&self) -> EngineResult<Vec<StepExecution>> {
            self.inner.running_steps()
        }
    }

    #[tokio::test]
    async fn test_report_racing_cancel_is_rejected() {
        let store = Arc::new(CancelBeforeStepWrite {
            inner: MemoryRunStore::new(),
            target: Mutex::new(None),
        });
        let queue = Arc::new(RecordingTaskQueue::new());
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry);
        let orchestrator = Orchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(MemoryEventLog::new()),
            Arc::new(registry),
        );

        let workflow = orchestrator
            .define_workflow(Workflow::new("single", vec![Step::new("a", "noop")]))
            .unwrap();
        let execution_id = orchestrator
            .start(workflow.id, Payload::new(), TriggerSource::Manual)
            .await
            .unwrap();
        let a = queue.drain()[0];

        *store.target.lock().unwrap() = Some(a);
        let err = orchestrator
            .on_step_completed(a, payload(json!({"late": true})))
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());

        let snapshot = orchestrator.query_status(execution_id).unwrap();
        assert_eq!(snapshot.execution.status, ExecutionStatus::Cancelled);
        assert_eq!(snapshot.steps[0].status, StepStatus::Running);
        assert!(snapshot.steps[0].result.is_none());
        assert_eq!(
            orchestrator.get_workflow(workflow.id).unwrap().total_executions,
            0
        );
    }
}

use super::queue::TaskQueue;
use super::step_executor::StepFailure;
use crate::error::EngineResult;
use crate::events::{record, Event, EventLog, EventType};
use crate::storage::{RunStore, StepPatch};
use crate::types::{ExecutionStatus, Step, StepExecution, StepExecutionId, StepStatus};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Whole seconds as a chrono duration, clamped to the representable range
pub(crate) fn seconds(secs: u64) -> Duration {
    let max = (i64::MAX / 1000) as u64;
    Duration::seconds(secs.min(max) as i64)
}

/// Verdict for one failure report
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// The step execution is `retrying` and will be re-dispatched at `next_retry_at`
    Retry {
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    },
    /// The step execution is `failed` for good
    Terminate(StepExecution),
}

/// Exponential backoff policy plus the poller that re-dispatches due retries
///
/// Retries are durable `next_retry_at` records in the store, so a restart
/// loses nothing; the poller reads them back on every tick.
pub struct RetryScheduler {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn EventLog>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    /// `retry_delay_seconds * 2^retry_count`
    pub fn backoff(step: &Step, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        seconds(step.retry_delay_seconds.saturating_mul(factor))
    }

    /// Adjudicate a failure of a running step execution
    ///
    /// The move out of `running` is the de-duplication guard: a second report
    /// for the same attempt fails with `InvalidState` and schedules nothing.
    /// The verdict is taken from the retry count as stored, inside the same
    /// write, and only while the run still accepts reports.
    pub async fn on_failure(
        &self,
        step_execution_id: StepExecutionId,
        step: &Step,
        failure: &StepFailure,
        now: DateTime<Utc>,
    ) -> EngineResult<RetryDecision> {
        let updated = self.store.transition_step_with(
            step_execution_id,
            &[StepStatus::Running],
            Box::new(|current: &StepExecution| {
                let patch = if current.retry_count < step.max_retries {
                    let next_retry_at = now
                        .checked_add_signed(Self::backoff(step, current.retry_count))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    StepPatch::to(StepStatus::Retrying)
                        .retry(current.retry_count + 1, next_retry_at)
                        .release_claim()
                } else {
                    StepPatch::to(StepStatus::Failed).completed_at(now)
                };
                patch
                    .error(failure.message.clone(), failure.traceback.clone())
                    .when_execution(ExecutionStatus::ACCEPTING_REPORTS)
            }),
        )?;

        if updated.status == StepStatus::Retrying {
            let attempt = updated.retry_count;
            let delay = Self::backoff(step, attempt.saturating_sub(1));
            let next_retry_at = updated.next_retry_at.unwrap_or(now);

            tracing::info!(
                "Step {} failed (attempt {}), retrying in {}s",
                step.id,
                attempt,
                delay.num_seconds()
            );

            record(
                self.events.as_ref(),
                Event::new(
                    updated.execution_id,
                    EventType::StepFailed {
                        step_id: step.id.clone(),
                        error: failure.message.clone(),
                        attempt,
                        will_retry: true,
                    },
                ),
            )
            .await;
            record(
                self.events.as_ref(),
                Event::new(
                    updated.execution_id,
                    EventType::StepRetryScheduled {
                        step_id: step.id.clone(),
                        retry_count: updated.retry_count,
                        next_retry_at,
                    },
                ),
            )
            .await;

            return Ok(RetryDecision::Retry {
                next_retry_at,
                delay,
            });
        }

        tracing::warn!(
            "Step {} failed permanently after {} retries: {}",
            step.id,
            updated.retry_count,
            failure.message
        );

        record(
            self.events.as_ref(),
            Event::new(
                updated.execution_id,
                EventType::StepFailed {
                    step_id: step.id.clone(),
                    error: failure.message.clone(),
                    attempt: updated.retry_count + 1,
                    will_retry: false,
                },
            ),
        )
        .await;

        Ok(RetryDecision::Terminate(updated))
    }

    /// Re-dispatch every retry whose time has come
    ///
    /// Retries of paused runs stay `retrying` until the run resumes.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> EngineResult<Vec<StepExecutionId>> {
        let mut dispatched = Vec::new();

        for due in self.store.due_retries(now)? {
            let running = match self.store.transition_step(
                due.id,
                &[StepStatus::Retrying],
                StepPatch::to(StepStatus::Running)
                    .started_at(now)
                    .clear_next_retry()
                    .release_claim()
                    .when_execution(ExecutionStatus::DISPATCHING),
            ) {
                Ok(step) => step,
                Err(e) if e.is_invalid_state() => {
                    tracing::debug!(
                        "Retry of step execution {} not dispatched: {}",
                        due.id,
                        e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            record(
                self.events.as_ref(),
                Event::new(
                    running.execution_id,
                    EventType::StepDispatched {
                        step_id: running.step_id.clone(),
                        step_execution_id: running.id,
                        attempt: running.retry_count + 1,
                    },
                ),
            )
            .await;

            if let Err(e) = self.queue.enqueue(running.id).await {
                tracing::error!("Failed to enqueue retry of step {}: {:#}", running.step_id, e);
                continue;
            }
            dispatched.push(running.id);
        }

        Ok(dispatched)
    }

    /// Run `dispatch_due` on a fixed interval until the task is aborted
    pub fn spawn_poller(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.dispatch_due(Utc::now()).await {
                    Ok(ids) if !ids.is_empty() => {
                        tracing::debug!("Re-dispatched {} due retries", ids.len());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Retry poller failed: {}", e),
                }
            }
        })
    }
}

use super::orchestrator::Orchestrator;
use crate::types::StepExecutionId;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Drains a channel task queue with bounded concurrency
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    name: String,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            name: "worker".to_string(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run until the sending side of the queue is dropped
    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<StepExecutionId>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut seq: usize = 0;

        tracing::info!(
            "Worker pool {} started with concurrency {}",
            self.name,
            self.concurrency
        );

        while let Some(step_execution_id) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker_id = format!("{}-{}", self.name, seq % self.concurrency);
            seq = seq.wrapping_add(1);

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match orchestrator
                    .execute_step(step_execution_id, &worker_id)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_invalid_state() => {
                        tracing::debug!(
                            "Ignoring stale task for step execution {}: {}",
                            step_execution_id,
                            e
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            "Worker {} failed on step execution {}: {}",
                            worker_id,
                            step_execution_id,
                            e
                        );
                    }
                }
            });
        }

        tracing::info!("Worker pool {} stopped", self.name);
    }

    pub fn spawn(self, receiver: mpsc::UnboundedReceiver<StepExecutionId>) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::storage::MemoryRunStore;
    use crate::types::{ExecutionStatus, Payload, Step, TriggerSource, Workflow};
    use crate::workflow::builtin::register_builtin;
    use crate::workflow::handler::HandlerRegistry;
    use crate::workflow::queue::ChannelTaskQueue;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_drives_workflow_to_completion() {
        let (queue, receiver) = ChannelTaskQueue::new();
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(queue),
            Arc::new(MemoryEventLog::new()),
            Arc::new(registry),
        ));
        let pool = WorkerPool::new(orchestrator.clone(), 2).spawn(receiver);

        let workflow = orchestrator
            .define_workflow(Workflow::new(
                "fan-out",
                vec![
                    Step::new("a", "noop"),
                    Step::new("b", "noop").depends_on(["a"]),
                    Step::new("c", "noop").depends_on(["a"]),
                    Step::new("d", "noop").depends_on(["b", "c"]),
                ],
            ))
            .unwrap();
        let execution_id = orchestrator
            .start(workflow.id, Payload::new(), TriggerSource::Manual)
            .await
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = orchestrator.query_status(execution_id).unwrap();
                if snapshot.execution.status.is_terminal() {
                    return snapshot.execution.status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(status, ExecutionStatus::Completed);
        let snapshot = orchestrator.query_status(execution_id).unwrap();
        assert!(snapshot
            .steps
            .iter()
            .all(|s| s.worker_id.as_deref().is_some_and(|w| w.starts_with("worker-"))));
        pool.abort();
    }
}

use crate::types::StepExecutionId;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Boundary to the task transport that eventually runs a step execution
///
/// Delivery is at-least-once; the step execution's status guards re-delivery.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, step_execution_id: StepExecutionId) -> anyhow::Result<()>;
}

/// In-process queue feeding a [`WorkerPool`](super::worker::WorkerPool)
pub struct ChannelTaskQueue {
    sender: mpsc::UnboundedSender<StepExecutionId>,
}

impl ChannelTaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StepExecutionId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, step_execution_id: StepExecutionId) -> anyhow::Result<()> {
        self.sender
            .send(step_execution_id)
            .map_err(|_| anyhow::anyhow!("task queue closed"))
    }
}

/// Queue that only records what was enqueued, for an external drain or tests
#[derive(Default)]
pub struct RecordingTaskQueue {
    enqueued: Mutex<Vec<StepExecutionId>>,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every id enqueued since the last drain
    pub fn drain(&self) -> Vec<StepExecutionId> {
        std::mem::take(&mut *self.enqueued.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.enqueued.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl TaskQueue for RecordingTaskQueue {
    async fn enqueue(&self, step_execution_id: StepExecutionId) -> anyhow::Result<()> {
        self.enqueued.lock().unwrap().push(step_execution_id);
        Ok(())
    }
}

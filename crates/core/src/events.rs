use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// An entry in the audit log of a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(execution_id: ExecutionId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// State transitions recorded in the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Execution lifecycle events
    ExecutionStarted {
        workflow_id: WorkflowId,
        workflow_version: u32,
        trigger_source: TriggerSource,
    },
    ExecutionCompleted {
        duration_secs: i64,
    },
    ExecutionFailed {
        error: String,
        failed_step: Option<StepId>,
    },
    ExecutionCancelled {
        reason: String,
    },
    ExecutionPaused,
    ExecutionResumed,

    // Step lifecycle events
    StepDispatched {
        step_id: StepId,
        step_execution_id: StepExecutionId,
        attempt: u32,
    },
    StepCompleted {
        step_id: StepId,
        duration_ms: Option<i64>,
    },
    StepFailed {
        step_id: StepId,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepRetryScheduled {
        step_id: StepId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    StepTimedOut {
        step_id: StepId,
        timeout_seconds: u64,
    },
    StepSkipped {
        step_id: StepId,
        reason: SkipReason,
    },
    StepCancelled {
        step_id: StepId,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for an execution, oldest first
    async fn get_execution_events(&self, execution_id: ExecutionId) -> anyhow::Result<Vec<Event>>;
}

/// Append an event, logging instead of propagating a write failure
pub(crate) async fn record(log: &dyn EventLog, event: Event) {
    let execution_id = event.execution_id;
    if let Err(e) = log.append(event).await {
        tracing::error!(
            "Failed to append event for execution {}: {:#}",
            execution_id,
            e
        );
    }
}

/// Event log kept in process memory
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<HashMap<ExecutionId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .entry(event.execution_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

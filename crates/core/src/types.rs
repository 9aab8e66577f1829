use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key-value payload (step config, input data, results)
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a workflow template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one run of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one run of a step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepExecutionId(pub Uuid);

impl StepExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a step, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    /// Statuses in which step reports are still recorded
    pub const ACCEPTING_REPORTS: &'static [ExecutionStatus] = &[Self::Running, Self::Paused];

    /// Statuses in which new steps may be dispatched
    pub const DISPATCHING: &'static [ExecutionStatus] = &[Self::Running];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Status of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
    Retrying,
}

impl StepStatus {
    /// Terminal steps never change status again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Why a step execution was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// The conditional hook decided the step should not run.
    /// Counts as resolved for downstream readiness.
    ConditionNotMet,
    /// A transitive dependency failed or was cancelled.
    UpstreamFailed { step_id: StepId },
}

/// How an execution was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Webhook,
    Schedule,
    Retry,
}

/// Workflow template: a DAG of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub total_executions: u64,
    #[serde(default)]
    pub successful_executions: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: String::new(),
            version: 1,
            is_active: true,
            steps,
            total_executions: 0,
            successful_executions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step by its id
    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Percentage of finished executions that completed successfully
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / self.total_executions as f64 * 100.0
    }
}

/// One node of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    /// Selects the handler in the registry
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub step_order: u32,
    #[serde(default)]
    pub config: Payload,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Opaque condition consumed by the conditional hook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Payload>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_timeout() -> u64 {
    300
}

impl Step {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId(id),
            step_type: step_type.into(),
            step_order: 0,
            config: Payload::new(),
            depends_on: Vec::new(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: default_timeout(),
            condition: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(|d| StepId(d.into())).collect();
        self
    }

    pub fn with_config(mut self, config: Payload) -> Self {
        self.config = config;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_order(mut self, step_order: u32) -> Self {
        self.step_order = step_order;
        self
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// One run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub trigger_source: TriggerSource,
    pub input_data: Payload,
    pub output_data: Payload,
    pub error_message: Option<String>,
    pub failed_step: Option<StepId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// A pending run of the given workflow version
    pub fn new(workflow: &Workflow, input_data: Payload, trigger_source: TriggerSource) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            status: ExecutionStatus::Pending,
            trigger_source,
            input_data,
            output_data: Payload::new(),
            error_message: None,
            failed_step: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - started)
    }
}

/// One run of a step within a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub step_order: u32,
    pub status: StepStatus,
    pub input_data: Payload,
    pub result: Option<Payload>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn pending(execution_id: ExecutionId, step: &Step, input_data: Payload) -> Self {
        Self {
            id: StepExecutionId::new(),
            execution_id,
            step_id: step.id.clone(),
            step_order: step.step_order,
            status: StepStatus::Pending,
            input_data,
            result: None,
            error_message: None,
            error_traceback: None,
            skip_reason: None,
            retry_count: 0,
            next_retry_at: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - started)
    }
}

/// Read-only projection of a run with its nested step statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution: WorkflowExecution,
    pub steps: Vec<StepExecution>,
}

impl ExecutionSnapshot {
    pub fn step(&self, step_id: &StepId) -> Option<&StepExecution> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }
}

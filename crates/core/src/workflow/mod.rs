pub mod builtin;
pub mod condition;
pub mod dag;
pub mod handler;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod step_executor;
pub mod worker;

pub use builtin::register_builtin;
pub use condition::{AlwaysRun, ConditionEvaluator};
pub use dag::WorkflowDag;
pub use handler::{HandlerRegistry, StepHandler};
pub use orchestrator::Orchestrator;
pub use queue::{ChannelTaskQueue, RecordingTaskQueue, TaskQueue};
pub use resolver::{DependencyResolver, Resolution};
pub use retry::{RetryDecision, RetryScheduler};
pub use step_executor::{StepExecutor, StepFailure, StepOutcome};
pub use worker::WorkerPool;

pub mod event_log;
pub mod memory;
pub mod redb_store;
pub mod run_store;

pub use event_log::JsonlEventLog;
pub use memory::MemoryRunStore;
pub use redb_store::RedbRunStore;
pub use run_store::{ExecutionPatch, RunStore, StepDecision, StepPatch};

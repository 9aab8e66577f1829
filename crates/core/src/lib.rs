// Core of the FlowPilot workflow engine: DAG model, run state, orchestration

pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use types::*;

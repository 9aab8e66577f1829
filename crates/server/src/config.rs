use anyhow::{Context, Result};
use flowpilot_core::events::EventLog;
use flowpilot_core::storage::{JsonlEventLog, RedbRunStore, RunStore};
use flowpilot_core::types::StepExecutionId;
use flowpilot_core::workflow::{
    register_builtin, ChannelTaskQueue, HandlerRegistry, Orchestrator, TaskQueue, WorkerPool,
};
use flowpilot_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "flowpilot.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn from_parts(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry);
        tracing::info!("Registered step handlers: {:?}", registry.types());

        let orchestrator = Arc::new(Orchestrator::new(store, queue, events, Arc::new(registry)));
        Self { orchestrator }
    }
}

/// Everything the server process runs: shared state plus background tasks
pub struct Engine {
    pub state: AppState,
    pub event_log: Arc<JsonlEventLog>,
    receiver: Option<UnboundedReceiver<StepExecutionId>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let store = Arc::new(
            RedbRunStore::new(config.index_path()).context("Failed to create run store")?,
        );

        let (queue, receiver) = ChannelTaskQueue::new();
        let state = AppState::from_parts(store, Arc::new(queue), event_log.clone());

        Ok(Self {
            state,
            event_log,
            receiver: Some(receiver),
            config: config.engine.clone(),
        })
    }

    /// Start the worker pool, retry poller and timeout watchdog
    pub fn spawn_background(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let orchestrator = self.state.orchestrator.clone();

        if let Some(receiver) = self.receiver.take() {
            handles.push(
                WorkerPool::new(orchestrator.clone(), self.config.worker_concurrency)
                    .spawn(receiver),
            );
        }
        handles.push(
            orchestrator
                .retry_scheduler()
                .spawn_poller(self.config.retry_poll_interval()),
        );
        handles.push(orchestrator.spawn_timeout_watchdog(self.config.timeout_check_interval()));

        tracing::info!(
            "Engine started: {} workers, retry poll every {}s, timeout check every {}s",
            self.config.worker_concurrency,
            self.config.retry_poll_interval_secs,
            self.config.timeout_check_interval_secs
        );
        handles
    }
}

//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by both CLI and REST API.
//! Services are generic over the repository and dispatcher traits; AppState
//! pins them to [`WorkflowStore`] and the echo dispatcher.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use swdl_core::event::EventBus;
use swdl_core::repository::{ExecutionFilter, InMemoryWorkflowRepository, WorkflowRepository};
use swdl_core::service::WorkflowService;
use swdl_core::workflow::dispatch::EchoDispatcher;
use swdl_core::workflow::executor::{ExecutionConfig, ExecutionService};
use swdl_infra::config::{data_dir, load_global_config};
use swdl_infra::sqlite::{DatabasePool, SqliteWorkflowRepository};
use swdl_types::config::GlobalConfig;
use swdl_types::error::RepositoryError;
use swdl_types::execution::{ExecutionEvent, ExecutionEventType, ExecutionStep, WorkflowExecution};
use swdl_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Storage selected at startup: the SQLite database in the data directory,
/// or a process-local store for `--ephemeral`.
#[derive(Clone)]
pub enum WorkflowStore {
    Sqlite(SqliteWorkflowRepository),
    Memory(InMemoryWorkflowRepository),
}

impl WorkflowRepository for WorkflowStore {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.create_definition(def).await,
            Self::Memory(repo) => repo.create_definition(def).await,
        }
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.get_definition(id).await,
            Self::Memory(repo) => repo.get_definition(id).await,
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_definitions().await,
            Self::Memory(repo) => repo.list_definitions().await,
        }
    }

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.update_definition(def).await,
            Self::Memory(repo) => repo.update_definition(def).await,
        }
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.delete_definition(id).await,
            Self::Memory(repo) => repo.delete_definition(id).await,
        }
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.create_execution(execution).await,
            Self::Memory(repo) => repo.create_execution(execution).await,
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.get_execution(id).await,
            Self::Memory(repo) => repo.get_execution(id).await,
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_executions(filter).await,
            Self::Memory(repo) => repo.list_executions(filter).await,
        }
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.update_execution(execution).await,
            Self::Memory(repo) => repo.update_execution(execution).await,
        }
    }

    async fn update_step(&self, execution_id: &Uuid, step: &ExecutionStep) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.update_step(execution_id, step).await,
            Self::Memory(repo) => repo.update_step(execution_id, step).await,
        }
    }

    async fn append_event(
        &self,
        execution_id: &Uuid,
        event_type: ExecutionEventType,
        payload: Value,
    ) -> Result<ExecutionEvent, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.append_event(execution_id, event_type, payload).await,
            Self::Memory(repo) => repo.append_event(execution_id, event_type, payload).await,
        }
    }

    async fn list_events(
        &self,
        execution_id: &Uuid,
        after_sequence: u64,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        match self {
            Self::Sqlite(repo) => repo.list_events(execution_id, after_sequence).await,
            Self::Memory(repo) => repo.list_events(execution_id, after_sequence).await,
        }
    }
}

/// Concrete type aliases for the service generics.
pub type ConcreteWorkflowService = WorkflowService<WorkflowStore>;

pub type ConcreteExecutionService = ExecutionService<WorkflowStore, EchoDispatcher>;

/// Shared application state holding all services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow_service: Arc<ConcreteWorkflowService>,
    pub execution_service: Arc<ConcreteExecutionService>,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: load config, open storage, wire
    /// services.
    pub async fn init(ephemeral: bool) -> anyhow::Result<Self> {
        let data_dir = data_dir();
        let config = load_global_config(&data_dir).await;

        let store = if ephemeral {
            tracing::debug!("using in-memory workflow store");
            WorkflowStore::Memory(InMemoryWorkflowRepository::new())
        } else {
            tokio::fs::create_dir_all(&data_dir).await?;
            let pool = DatabasePool::open(&data_dir).await?;
            WorkflowStore::Sqlite(SqliteWorkflowRepository::new(pool))
        };

        Ok(Self::from_parts(store, config, data_dir))
    }

    pub fn from_parts(store: WorkflowStore, config: GlobalConfig, data_dir: PathBuf) -> Self {
        let repo = Arc::new(store);
        let bus = EventBus::new(config.event_buffer);
        let execution_service = ExecutionService::new(
            Arc::clone(&repo),
            Arc::new(EchoDispatcher),
            bus,
            ExecutionConfig::from(&config),
        );

        Self {
            workflow_service: Arc::new(WorkflowService::new(repo)),
            execution_service: Arc::new(execution_service),
            config: Arc::new(config),
            data_dir,
        }
    }

    /// Ephemeral state with default configuration.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::from_parts(
            WorkflowStore::Memory(InMemoryWorkflowRepository::new()),
            GlobalConfig::default(),
            PathBuf::from("."),
        )
    }

    /// Page size for execution listings: the request's own, else the
    /// configured default.
    pub fn list_limit(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.config.default_list_limit)
    }
}

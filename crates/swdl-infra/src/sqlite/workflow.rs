//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `swdl-core` using sqlx with split
//! read/write pools. Definitions and execution snapshots are stored as JSON
//! documents; steps and events get their own rows so single transitions
//! stay cheap.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use swdl_core::repository::workflow::{ExecutionFilter, WorkflowRepository};
use swdl_types::error::RepositoryError;
use swdl_types::execution::{
    ExecutionEvent, ExecutionEventType, ExecutionStatus, ExecutionStep, StepStatus,
    WorkflowExecution,
};
use swdl_types::workflow::{StageType, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    parameters: String,
    definition_snapshot: String,
    started_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            parameters: row.try_get("parameters")?,
            definition_snapshot: row.try_get("definition_snapshot")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }

    /// Steps are attached separately.
    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Corrupt(e))?;

        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status,
            parameters: from_json(&self.parameters, "parameters")?,
            definition_snapshot: from_json(&self.definition_snapshot, "definition snapshot")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error_message: self.error_message,
            steps: Vec::new(),
        })
    }
}

struct StepRow {
    stage_id: String,
    stage_name: String,
    stage_type: String,
    batch_index: i64,
    status: String,
    attempt: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    output: Option<String>,
    error_message: Option<String>,
    gate_deadline: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            stage_id: row.try_get("stage_id")?,
            stage_name: row.try_get("stage_name")?,
            stage_type: row.try_get("stage_type")?,
            batch_index: row.try_get("batch_index")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            gate_deadline: row.try_get("gate_deadline")?,
        })
    }

    fn into_step(self) -> Result<ExecutionStep, RepositoryError> {
        let status: StepStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Corrupt(e))?;
        let stage_type: StageType = serde_json::from_value(Value::String(self.stage_type.clone()))
            .map_err(|_| RepositoryError::Corrupt(format!("stage type: {}", self.stage_type)))?;

        Ok(ExecutionStep {
            stage_id: self.stage_id,
            stage_name: self.stage_name,
            stage_type,
            batch_index: self.batch_index as u32,
            status,
            attempt: self.attempt as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "step output"))
                .transpose()?,
            error_message: self.error_message,
            gate_deadline: self.gate_deadline.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct EventRow {
    execution_id: String,
    sequence: i64,
    event_type: String,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            sequence: row.try_get("sequence")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<ExecutionEvent, RepositoryError> {
        let event_type: ExecutionEventType = self
            .event_type
            .parse()
            .map_err(|e: String| RepositoryError::Corrupt(e))?;
        Ok(ExecutionEvent {
            execution_id: parse_uuid(&self.execution_id)?,
            sequence: self.sequence as u64,
            event_type,
            payload: from_json(&self.payload, "event payload")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RepositoryError::Unavailable(e.to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Corrupt(format!("UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Corrupt(format!("{what} JSON: {e}")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

impl SqliteWorkflowRepository {
    async fn load_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM execution_steps WHERE execution_id = ? ORDER BY position ASC")
            .bind(execution_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(query_err)?.into_step())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            "INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&def.version)
        .bind(to_json(def, "definition")?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("workflow '{}' already exists", def.id))
            } else {
                query_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("definition").map_err(query_err)?;
                Ok(Some(from_json(&json, "workflow definition")?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let json: String = row.try_get("definition").map_err(query_err)?;
                from_json(&json, "workflow definition")
            })
            .collect()
    }

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflows SET name = ?, version = ?, definition = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&def.name)
        .bind(&def.version)
        .bind(to_json(def, "definition")?)
        .bind(format_datetime(&Utc::now()))
        .bind(&def.id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, workflow_name, status, parameters, definition_snapshot,
                started_at, completed_at, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(to_json(&execution.parameters, "parameters")?)
        .bind(to_json(&execution.definition_snapshot, "definition snapshot")?)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error_message)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("execution '{}' already exists", execution.id))
            } else {
                query_err(e)
            }
        })?;

        for (position, step) in execution.steps.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO execution_steps
                   (execution_id, stage_id, position, stage_name, stage_type, batch_index, status,
                    attempt, started_at, completed_at, output, error_message, gate_deadline)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(execution.id.to_string())
            .bind(&step.stage_id)
            .bind(position as i64)
            .bind(&step.stage_name)
            .bind(step.stage_type.as_str())
            .bind(step.batch_index as i64)
            .bind(step.status.as_str())
            .bind(step.attempt as i64)
            .bind(step.started_at.as_ref().map(format_datetime))
            .bind(step.completed_at.as_ref().map(format_datetime))
            .bind(step.output.as_ref().map(|o| to_json(o, "step output")).transpose()?)
            .bind(&step.error_message)
            .bind(step.gate_deadline.as_ref().map(format_datetime))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut execution = ExecutionRow::from_row(&row)
            .map_err(query_err)?
            .into_execution()?;
        execution.steps = self.load_steps(&id.to_string()).await?;
        Ok(Some(execution))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM executions WHERE 1 = 1");
        if let Some(workflow_id) = &filter.workflow_id {
            qb.push(" AND workflow_id = ").push_bind(workflow_id.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY started_at DESC, id DESC");
        if filter.limit > 0 {
            qb.push(" LIMIT ").push_bind(filter.limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut execution = ExecutionRow::from_row(row)
                .map_err(query_err)?
                .into_execution()?;
            execution.steps = self.load_steps(&execution.id.to_string()).await?;
            executions.push(execution);
        }
        Ok(executions)
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions
               SET status = ?, parameters = ?, started_at = ?, completed_at = ?, error_message = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(to_json(&execution.parameters, "parameters")?)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error_message)
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_step(&self, execution_id: &Uuid, step: &ExecutionStep) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE execution_steps
               SET status = ?, attempt = ?, started_at = ?, completed_at = ?, output = ?,
                   error_message = ?, gate_deadline = ?
               WHERE execution_id = ? AND stage_id = ?"#,
        )
        .bind(step.status.as_str())
        .bind(step.attempt as i64)
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.output.as_ref().map(|o| to_json(o, "step output")).transpose()?)
        .bind(&step.error_message)
        .bind(step.gate_deadline.as_ref().map(format_datetime))
        .bind(execution_id.to_string())
        .bind(&step.stage_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn append_event(
        &self,
        execution_id: &Uuid,
        event_type: ExecutionEventType,
        payload: Value,
    ) -> Result<ExecutionEvent, RepositoryError> {
        let id = execution_id.to_string();
        let created_at = Utc::now();
        let payload_json = to_json(&payload, "event payload")?;

        // The writer pool has one connection, so read-then-insert inside this
        // transaction cannot interleave with another append.
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let exists = sqlx::query("SELECT 1 FROM executions WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM execution_events WHERE execution_id = ?",
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;
        let sequence = last + 1;

        sqlx::query(
            "INSERT INTO execution_events (execution_id, sequence, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(sequence)
        .bind(event_type.as_str())
        .bind(&payload_json)
        .bind(format_datetime(&created_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;

        Ok(ExecutionEvent {
            execution_id: *execution_id,
            sequence: sequence as u64,
            event_type,
            payload,
            created_at,
        })
    }

    async fn list_events(
        &self,
        execution_id: &Uuid,
        after_sequence: u64,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_events WHERE execution_id = ? AND sequence > ? ORDER BY sequence ASC",
        )
        .bind(execution_id.to_string())
        .bind(after_sequence as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| EventRow::from_row(row).map_err(query_err)?.into_event())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Execution tracking types: executions, their per-stage steps, and the
//! append-only event log that records every state transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{StageType, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    WaitingForApproval,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::WaitingForApproval => "waiting_for_approval",
        }
    }

    /// States that release the batch barrier.
    pub fn is_settled(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// States a step never leaves.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "skipped" => Ok(StepStatus::Skipped),
            "failed" => Ok(StepStatus::Failed),
            "waiting_for_approval" => Ok(StepStatus::WaitingForApproval),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: String,
    /// Denormalized for display.
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Caller parameters merged with declared defaults.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Defaulted definition captured at start. Later edits do not affect it.
    pub definition_snapshot: WorkflowDefinition,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// One step per stage, in declaration order. Never reordered.
    pub steps: Vec<ExecutionStep>,
}

impl WorkflowExecution {
    pub fn step(&self, stage_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn step_mut(&mut self, stage_id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.stage_id == stage_id)
    }

    /// Gate steps currently waiting for a decision.
    pub fn waiting_gates(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::WaitingForApproval)
    }
}

/// Execution record for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub stage_id: String,
    /// Denormalized for display.
    pub stage_name: String,
    pub stage_type: StageType,
    pub batch_index: u32,
    pub status: StepStatus,
    /// Dispatch attempts so far (0 until first dispatch).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When a waiting gate applies its `on_timeout` action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_deadline: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    /// A fresh pending step.
    pub fn pending(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        stage_type: StageType,
        batch_index: u32,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            stage_name: stage_name.into(),
            stage_type,
            batch_index,
            status: StepStatus::Pending,
            attempt: 0,
            started_at: None,
            completed_at: None,
            output: None,
            error_message: None,
            gate_deadline: None,
        }
    }
}

/// Per-run adjustments supplied when starting an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOverrides {
    /// Per-stage model/timeout overrides keyed by stage id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageOverride>,
    /// Extra environment merged over `config.env`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Replaces the workflow-level timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Kinds of recorded execution events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionEventType {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.paused")]
    ExecutionPaused,
    #[serde(rename = "execution.resumed")]
    ExecutionResumed,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "batch.started")]
    BatchStarted,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    #[serde(rename = "gate.waiting")]
    GateWaiting,
    #[serde(rename = "gate.approved")]
    GateApproved,
    #[serde(rename = "gate.rejected")]
    GateRejected,
    #[serde(rename = "hook.triggered")]
    HookTriggered,
}

impl ExecutionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEventType::ExecutionStarted => "execution.started",
            ExecutionEventType::ExecutionPaused => "execution.paused",
            ExecutionEventType::ExecutionResumed => "execution.resumed",
            ExecutionEventType::ExecutionCompleted => "execution.completed",
            ExecutionEventType::ExecutionFailed => "execution.failed",
            ExecutionEventType::ExecutionCancelled => "execution.cancelled",
            ExecutionEventType::BatchStarted => "batch.started",
            ExecutionEventType::StageStarted => "stage.started",
            ExecutionEventType::StageCompleted => "stage.completed",
            ExecutionEventType::StageFailed => "stage.failed",
            ExecutionEventType::StageRetrying => "stage.retrying",
            ExecutionEventType::StageSkipped => "stage.skipped",
            ExecutionEventType::GateWaiting => "gate.waiting",
            ExecutionEventType::GateApproved => "gate.approved",
            ExecutionEventType::GateRejected => "gate.rejected",
            ExecutionEventType::HookTriggered => "hook.triggered",
        }
    }

    /// Execution-level status this event establishes, if any.
    pub fn execution_status(&self) -> Option<ExecutionStatus> {
        match self {
            ExecutionEventType::ExecutionStarted | ExecutionEventType::ExecutionResumed => {
                Some(ExecutionStatus::Running)
            }
            ExecutionEventType::ExecutionPaused => Some(ExecutionStatus::Paused),
            ExecutionEventType::ExecutionCompleted => Some(ExecutionStatus::Completed),
            ExecutionEventType::ExecutionFailed => Some(ExecutionStatus::Failed),
            ExecutionEventType::ExecutionCancelled => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// Step-level status this event establishes, if any.
    pub fn step_status(&self) -> Option<StepStatus> {
        match self {
            ExecutionEventType::StageStarted | ExecutionEventType::StageRetrying => {
                Some(StepStatus::Running)
            }
            ExecutionEventType::StageCompleted | ExecutionEventType::GateApproved => {
                Some(StepStatus::Completed)
            }
            ExecutionEventType::StageFailed | ExecutionEventType::GateRejected => {
                Some(StepStatus::Failed)
            }
            ExecutionEventType::StageSkipped => Some(StepStatus::Skipped),
            ExecutionEventType::GateWaiting => Some(StepStatus::WaitingForApproval),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ExecutionEventType; 16] = [
            ExecutionEventType::ExecutionStarted,
            ExecutionEventType::ExecutionPaused,
            ExecutionEventType::ExecutionResumed,
            ExecutionEventType::ExecutionCompleted,
            ExecutionEventType::ExecutionFailed,
            ExecutionEventType::ExecutionCancelled,
            ExecutionEventType::BatchStarted,
            ExecutionEventType::StageStarted,
            ExecutionEventType::StageCompleted,
            ExecutionEventType::StageFailed,
            ExecutionEventType::StageRetrying,
            ExecutionEventType::StageSkipped,
            ExecutionEventType::GateWaiting,
            ExecutionEventType::GateApproved,
            ExecutionEventType::GateRejected,
            ExecutionEventType::HookTriggered,
        ];
        ALL.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// One append-only event log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    /// Strictly increasing per execution, starting at 1.
    pub sequence: u64,
    pub event_type: ExecutionEventType,
    /// Structured detail. Stage events carry `stage_id`.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ExecutionEvent {
    /// The stage an event refers to, when it carries one.
    pub fn stage_id(&self) -> Option<&str> {
        self.payload.get("stage_id").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

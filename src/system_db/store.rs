//! `SystemDatabase` trait and row types (spec.md §3, §6).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbosError;

/// `workflow_status.status` (spec.md §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Pending,
    Success,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Success => "SUCCESS",
            WorkflowStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Success | WorkflowStatus::Error)
    }

    pub fn parse(s: &str) -> Result<Self, DbosError> {
        match s {
            "PENDING" => Ok(WorkflowStatus::Pending),
            "SUCCESS" => Ok(WorkflowStatus::Success),
            "ERROR" => Ok(WorkflowStatus::Error),
            other => Err(DbosError::Unsupported(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// `workflow_status` row (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusRow {
    pub workflow_uuid: String,
    pub status: WorkflowStatus,
    pub name: String,
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,
    pub request: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executor_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub application_version: Option<String>,
    pub application_id: Option<String>,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub recovery_attempts: i64,
    pub queue_name: Option<String>,
}

impl WorkflowStatusRow {
    pub fn is_temp(&self) -> bool {
        self.name.starts_with("<temp>")
    }
}

/// Fields supplied by the executor when dispatching a workflow
/// (spec.md §4.2 step 1-2).
#[derive(Debug, Clone)]
pub struct NewWorkflowStatus {
    pub workflow_uuid: String,
    pub name: String,
    pub executor_id: Option<String>,
    pub application_version: Option<String>,
    pub application_id: Option<String>,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub queue_name: Option<String>,
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,
    pub request: Option<String>,
}

/// `operation_outputs` row (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutputRow {
    pub workflow_uuid: String,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOperationOutput {
    pub workflow_uuid: String,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Trait implemented by each dialect adapter plus the in-memory test
/// double. Method boundaries mirror the operations named in spec.md §3-§6.
#[async_trait]
pub trait SystemDatabase: Send + Sync + 'static {
    /// Create the `dbos` schema and all system tables if absent.
    async fn install_schema(&self) -> Result<(), DbosError>;

    // --- workflow_status / workflow_inputs (spec.md §4.2 steps 1-4) ---

    /// Insert-if-absent with the update-on-conflict semantics of
    /// spec.md §4.2 step 2: if the row exists, increment
    /// `recovery_attempts`, set `status = PENDING` only if it is
    /// currently `PENDING`, and never touch a terminal row. Returns the
    /// row as it stands *after* the write, for the caller to inspect.
    async fn insert_or_recover_workflow_status(
        &self,
        input: &NewWorkflowStatus,
    ) -> Result<WorkflowStatusRow, DbosError>;

    async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, DbosError>;

    /// Insert `workflow_inputs`, ignoring the row if the parent
    /// `workflow_status` row does not exist (temp-workflow FK skip rule,
    /// spec.md §4.5/§9). Returns whether the row was inserted.
    async fn insert_workflow_inputs(
        &self,
        workflow_uuid: &str,
        inputs: &str,
    ) -> Result<bool, DbosError>;

    async fn get_workflow_inputs(&self, workflow_uuid: &str) -> Result<Option<String>, DbosError>;

    /// Write a workflow's final status. Called by the write buffer's
    /// flusher, never directly by the executor (spec.md §4.5). Must not
    /// overwrite an already-terminal row.
    async fn write_terminal_status(
        &self,
        workflow_uuid: &str,
        status: WorkflowStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DbosError>;

    async fn list_pending(
        &self,
        executor_ids: Option<&[String]>,
    ) -> Result<Vec<WorkflowStatusRow>, DbosError>;

    async fn list_since(&self, since_epoch_ms: i64) -> Result<Vec<WorkflowStatusRow>, DbosError>;

    // --- operation_outputs (spec.md §4.2 step algorithm, step/send/recv/sleep) ---

    async fn get_operation_output(
        &self,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, DbosError>;

    /// Insert-only; a conflict means another dispatch already recorded
    /// this function id (OAOO replay wins the race) and is not an error
    /// — the caller re-reads via `get_operation_output`.
    async fn insert_operation_output(
        &self,
        row: &NewOperationOutput,
    ) -> Result<bool, DbosError>;

    // --- notifications (send/recv) ---

    async fn insert_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
        message: &str,
    ) -> Result<(), DbosError>;

    /// Pop the oldest matching notification, if any.
    async fn consume_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
    ) -> Result<Option<String>, DbosError>;

    /// Block until a matching notification might be available, or the
    /// timeout elapses. Returns `true` if something may have arrived (the
    /// caller still re-polls `consume_notification`, since this may be a
    /// spurious wakeup). Dialects that expose a notification channel
    /// (Postgres `LISTEN`/`NOTIFY`) override this; others fall back to
    /// the default bounded-backoff poll.
    async fn await_notification(&self, _destination_uuid: &str, timeout: Duration) -> bool {
        tokio::time::sleep(poll_backoff(timeout)).await;
        true
    }

    // --- workflow_events (set_event/get_event) ---

    async fn upsert_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbosError>;

    async fn get_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
    ) -> Result<Option<String>, DbosError>;

    async fn await_event(&self, _workflow_uuid: &str, timeout: Duration) -> bool {
        tokio::time::sleep(poll_backoff(timeout)).await;
        true
    }

    // --- scheduler_state ---

    async fn upsert_scheduler_state(
        &self,
        workflow_fn_name: &str,
        last_run_time: i64,
    ) -> Result<(), DbosError>;

    async fn get_scheduler_state(
        &self,
        workflow_fn_name: &str,
    ) -> Result<Option<i64>, DbosError>;

    // --- workflow_queue ---

    async fn enqueue(&self, workflow_uuid: &str, queue_name: &str) -> Result<(), DbosError>;

    async fn mark_queue_started(&self, workflow_uuid: &str) -> Result<(), DbosError>;

    async fn mark_queue_completed(&self, workflow_uuid: &str) -> Result<(), DbosError>;

    /// Current epoch milliseconds, per the dialect's server clock where
    /// meaningful; the in-memory store and the default trait methods use
    /// the caller's wall clock.
    fn now_epoch_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A short bounded backoff used by dialects without a push notification
/// channel, capped at the caller's timeout.
fn poll_backoff(timeout: Duration) -> Duration {
    timeout.min(Duration::from_millis(200))
}

pub(crate) fn epoch_millis_now() -> i64 {
    let now: DateTime<Utc> = Utc::now();
    now.timestamp_millis()
}

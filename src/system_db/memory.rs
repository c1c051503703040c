//! In-memory `SystemDatabase`, used by the OAOO/recovery/retry/temp-workflow
//! scenario tests (spec.md §8) so they run without a live Postgres/MySQL.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::store::{
    epoch_millis_now, NewOperationOutput, NewWorkflowStatus, OperationOutputRow, SystemDatabase,
    WorkflowStatus, WorkflowStatusRow,
};
use crate::error::DbosError;

#[derive(Default)]
struct State {
    status: HashMap<String, WorkflowStatusRow>,
    inputs: HashMap<String, String>,
    operation_outputs: HashMap<(String, i64), OperationOutputRow>,
    notifications: HashMap<(String, Option<String>), VecDeque<String>>,
    events: HashMap<(String, String), String>,
    scheduler_state: HashMap<String, i64>,
    queue_started: HashMap<String, bool>,
}

/// In-memory implementation of [`SystemDatabase`]. Not for production use
/// (it is not persistent, and state is process-local), mirroring the
/// teacher's `InMemoryWorkflowEventStore` test double.
#[derive(Default)]
pub struct InMemorySystemDatabase {
    state: Mutex<State>,
}

impl InMemorySystemDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SystemDatabase for InMemorySystemDatabase {
    async fn install_schema(&self) -> Result<(), DbosError> {
        Ok(())
    }

    async fn insert_or_recover_workflow_status(
        &self,
        input: &NewWorkflowStatus,
    ) -> Result<WorkflowStatusRow, DbosError> {
        let mut state = self.state.lock();
        let now = epoch_millis_now();
        if let Some(existing) = state.status.get_mut(&input.workflow_uuid) {
            existing.recovery_attempts += 1;
            if existing.status == WorkflowStatus::Pending {
                existing.updated_at = now;
            }
            return Ok(existing.clone());
        }
        let row = WorkflowStatusRow {
            workflow_uuid: input.workflow_uuid.clone(),
            status: WorkflowStatus::Pending,
            name: input.name.clone(),
            authenticated_user: input.authenticated_user.clone(),
            assumed_role: input.assumed_role.clone(),
            authenticated_roles: input.authenticated_roles.clone(),
            request: input.request.clone(),
            output: None,
            error: None,
            executor_id: input.executor_id.clone(),
            created_at: now,
            updated_at: now,
            application_version: input.application_version.clone(),
            application_id: input.application_id.clone(),
            class_name: input.class_name.clone(),
            config_name: input.config_name.clone(),
            recovery_attempts: 1,
            queue_name: input.queue_name.clone(),
        };
        state.status.insert(input.workflow_uuid.clone(), row.clone());
        Ok(row)
    }

    async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, DbosError> {
        Ok(self.state.lock().status.get(workflow_uuid).cloned())
    }

    async fn insert_workflow_inputs(
        &self,
        workflow_uuid: &str,
        inputs: &str,
    ) -> Result<bool, DbosError> {
        let mut state = self.state.lock();
        if !state.status.contains_key(workflow_uuid) {
            return Ok(false);
        }
        state
            .inputs
            .entry(workflow_uuid.to_string())
            .or_insert_with(|| inputs.to_string());
        Ok(true)
    }

    async fn get_workflow_inputs(&self, workflow_uuid: &str) -> Result<Option<String>, DbosError> {
        Ok(self.state.lock().inputs.get(workflow_uuid).cloned())
    }

    async fn write_terminal_status(
        &self,
        workflow_uuid: &str,
        status: WorkflowStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DbosError> {
        let mut state = self.state.lock();
        let now = epoch_millis_now();
        if let Some(row) = state.status.get_mut(workflow_uuid) {
            if row.status.is_terminal() {
                return Ok(());
            }
            row.status = status;
            row.output = output.map(|s| s.to_string());
            row.error = error.map(|s| s.to_string());
            row.updated_at = now;
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        executor_ids: Option<&[String]>,
    ) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let state = self.state.lock();
        Ok(state
            .status
            .values()
            .filter(|row| row.status == WorkflowStatus::Pending)
            .filter(|row| match executor_ids {
                None => true,
                Some(ids) => row
                    .executor_id
                    .as_deref()
                    .map(|id| ids.iter().any(|candidate| candidate == id))
                    .unwrap_or(false),
            })
            .cloned()
            .collect())
    }

    async fn list_since(&self, since_epoch_ms: i64) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let state = self.state.lock();
        Ok(state
            .status
            .values()
            .filter(|row| row.created_at >= since_epoch_ms)
            .cloned()
            .collect())
    }

    async fn get_operation_output(
        &self,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, DbosError> {
        Ok(self
            .state
            .lock()
            .operation_outputs
            .get(&(workflow_uuid.to_string(), function_id))
            .cloned())
    }

    async fn insert_operation_output(
        &self,
        row: &NewOperationOutput,
    ) -> Result<bool, DbosError> {
        let mut state = self.state.lock();
        let key = (row.workflow_uuid.clone(), row.function_id);
        if state.operation_outputs.contains_key(&key) {
            return Ok(false);
        }
        state.operation_outputs.insert(
            key,
            OperationOutputRow {
                workflow_uuid: row.workflow_uuid.clone(),
                function_id: row.function_id,
                output: row.output.clone(),
                error: row.error.clone(),
            },
        );
        Ok(true)
    }

    async fn insert_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
        message: &str,
    ) -> Result<(), DbosError> {
        let mut state = self.state.lock();
        state
            .notifications
            .entry((destination_uuid.to_string(), topic.map(|t| t.to_string())))
            .or_default()
            .push_back(message.to_string());
        Ok(())
    }

    async fn consume_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
    ) -> Result<Option<String>, DbosError> {
        let mut state = self.state.lock();
        let key = (destination_uuid.to_string(), topic.map(|t| t.to_string()));
        Ok(state
            .notifications
            .get_mut(&key)
            .and_then(|queue| queue.pop_front()))
    }

    async fn upsert_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbosError> {
        self.state
            .lock()
            .events
            .insert((workflow_uuid.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn get_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
    ) -> Result<Option<String>, DbosError> {
        Ok(self
            .state
            .lock()
            .events
            .get(&(workflow_uuid.to_string(), key.to_string()))
            .cloned())
    }

    async fn upsert_scheduler_state(
        &self,
        workflow_fn_name: &str,
        last_run_time: i64,
    ) -> Result<(), DbosError> {
        self.state
            .lock()
            .scheduler_state
            .insert(workflow_fn_name.to_string(), last_run_time);
        Ok(())
    }

    async fn get_scheduler_state(
        &self,
        workflow_fn_name: &str,
    ) -> Result<Option<i64>, DbosError> {
        Ok(self
            .state
            .lock()
            .scheduler_state
            .get(workflow_fn_name)
            .copied())
    }

    async fn enqueue(&self, workflow_uuid: &str, _queue_name: &str) -> Result<(), DbosError> {
        self.state
            .lock()
            .queue_started
            .entry(workflow_uuid.to_string())
            .or_insert(false);
        Ok(())
    }

    async fn mark_queue_started(&self, workflow_uuid: &str) -> Result<(), DbosError> {
        self.state
            .lock()
            .queue_started
            .insert(workflow_uuid.to_string(), true);
        Ok(())
    }

    async fn mark_queue_completed(&self, _workflow_uuid: &str) -> Result<(), DbosError> {
        Ok(())
    }
}

//! In-memory `ApplicationDatabase`, used by scenario tests (spec.md §8)
//! so they run without a live Postgres/MySQL. `begin`/`commit`/`rollback`
//! are no-ops that hand out [`SqlSession::Memory`]; user transaction
//! bodies running against it must not touch `session.as_postgres_mut()`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::session::SqlSession;
use super::store::{ApplicationDatabase, IsolationLevel, RecordedResult, TransactionOutputInsert};
use crate::error::DbosError;

#[derive(Default)]
pub struct InMemoryApplicationDatabase {
    outputs: Mutex<HashMap<(String, i64), RecordedResult>>,
}

impl InMemoryApplicationDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationDatabase for InMemoryApplicationDatabase {
    async fn ensure_database_exists(&self) -> Result<(), DbosError> {
        Ok(())
    }

    async fn install_schema(&self) -> Result<(), DbosError> {
        Ok(())
    }

    async fn begin(&self, _isolation: IsolationLevel) -> Result<SqlSession, DbosError> {
        Ok(SqlSession::Memory)
    }

    async fn check_transaction_execution(
        &self,
        _session: &mut SqlSession,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<RecordedResult>, DbosError> {
        Ok(self
            .outputs
            .lock()
            .get(&(workflow_uuid.to_string(), function_id))
            .cloned())
    }

    async fn record_transaction_output(
        &self,
        _session: &mut SqlSession,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError> {
        let key = (row.workflow_uuid.clone(), row.function_id);
        let mut outputs = self.outputs.lock();
        if outputs.contains_key(&key) {
            return Err(DbosError::WorkflowConflictID(row.workflow_uuid.clone()));
        }
        outputs.insert(
            key,
            RecordedResult {
                output: row.output.clone(),
                error: row.error.clone(),
            },
        );
        Ok(())
    }

    async fn commit(&self, _session: SqlSession) -> Result<(), DbosError> {
        Ok(())
    }

    async fn rollback(&self, _session: SqlSession) -> Result<(), DbosError> {
        Ok(())
    }

    async fn record_transaction_error(
        &self,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError> {
        let key = (row.workflow_uuid.clone(), row.function_id);
        let mut outputs = self.outputs.lock();
        if outputs.contains_key(&key) {
            return Err(DbosError::WorkflowConflictID(row.workflow_uuid.clone()));
        }
        outputs.insert(
            key,
            RecordedResult {
                output: None,
                error: row.error.clone(),
            },
        );
        Ok(())
    }
}

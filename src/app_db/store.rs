//! `ApplicationDatabase` trait and supporting types (spec.md §4.4).

use async_trait::async_trait;

use super::session::SqlSession;
use crate::error::DbosError;

/// Isolation level accepted by `invoke_transaction` (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A checkpoint to record in `transaction_outputs` (spec.md §6).
#[derive(Debug, Clone)]
pub struct TransactionOutputInsert {
    pub workflow_uuid: String,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub txn_snapshot: Option<String>,
    pub executor_id: Option<String>,
}

/// What a replayed transaction finds already checkpointed.
#[derive(Debug, Clone)]
pub struct RecordedResult {
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Adapter over the application database: creates it if absent, installs
/// the colocated `transaction_outputs` table, and checkpoints/retrieves
/// transaction results from inside the user's own transaction (spec.md
/// §4.4).
#[async_trait]
pub trait ApplicationDatabase: Send + Sync + 'static {
    /// Dialect-specific `CREATE DATABASE IF NOT EXISTS` (or the
    /// Postgres `pg_database` probe-then-create), run once against a
    /// maintenance connection (spec.md §4.4).
    async fn ensure_database_exists(&self) -> Result<(), DbosError>;

    /// Create the `dbos` schema and `transaction_outputs` table.
    async fn install_schema(&self) -> Result<(), DbosError>;

    /// Begin a transaction at the given isolation level, to be handed to
    /// the user's transaction body via `ExecutionContext::sql_session`.
    async fn begin(&self, isolation: IsolationLevel) -> Result<SqlSession, DbosError>;

    /// Check, *inside* the still-open transaction, whether this
    /// `(workflow_uuid, function_id)` was already checkpointed by a prior
    /// attempt (spec.md §4.2 step a).
    async fn check_transaction_execution(
        &self,
        session: &mut SqlSession,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<RecordedResult>, DbosError>;

    /// Insert the checkpoint row inside the still-open transaction (spec.md
    /// §4.2 step c). A unique-constraint violation here means another
    /// worker already committed this checkpoint and must be surfaced as
    /// [`DbosError::WorkflowConflictID`].
    async fn record_transaction_output(
        &self,
        session: &mut SqlSession,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError>;

    /// Commit the transaction (after a successful `record_transaction_output`).
    async fn commit(&self, session: SqlSession) -> Result<(), DbosError>;

    /// Roll back the transaction (the user body raised).
    async fn rollback(&self, session: SqlSession) -> Result<(), DbosError>;

    /// Record a transaction's *error* result in a fresh, short
    /// transaction — separate from the rolled-back one, so the checkpoint
    /// survives (spec.md §4.2 step "If the transaction raises...", §7).
    async fn record_transaction_error(
        &self,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError>;
}

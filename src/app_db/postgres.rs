//! PostgreSQL [`ApplicationDatabase`] (spec.md §4.4, §6).

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use super::session::SqlSession;
use super::store::{ApplicationDatabase, IsolationLevel, RecordedResult, TransactionOutputInsert};
use crate::dialect::Dialect;
use crate::error::DbosError;

const SCHEMA_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS dbos;

CREATE TABLE IF NOT EXISTS dbos.transaction_outputs (
    workflow_uuid VARCHAR(100) NOT NULL,
    function_id INTEGER NOT NULL,
    output TEXT,
    error TEXT,
    txn_id VARCHAR(128),
    txn_snapshot TEXT,
    executor_id VARCHAR(128),
    created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint,
    PRIMARY KEY (workflow_uuid, function_id)
);
CREATE INDEX IF NOT EXISTS transaction_outputs_created_at_index
    ON dbos.transaction_outputs (created_at);
"#;

/// A pool of connections to the application database, plus a maintenance
/// connection string used only to create the database itself if absent.
#[derive(Clone)]
pub struct PostgresApplicationDatabase {
    pool: PgPool,
    /// Pool connected to the `postgres` maintenance database, for the
    /// `CREATE DATABASE IF NOT EXISTS` probe in `ensure_database_exists`.
    maintenance_pool: Option<PgPool>,
    app_db_name: String,
}

impl PostgresApplicationDatabase {
    pub fn new(pool: PgPool, app_db_name: impl Into<String>) -> Self {
        Self {
            pool,
            maintenance_pool: None,
            app_db_name: app_db_name.into(),
        }
    }

    pub fn with_maintenance_pool(mut self, maintenance_pool: PgPool) -> Self {
        self.maintenance_pool = Some(maintenance_pool);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn do_begin(&self, isolation: IsolationLevel) -> Result<SqlSession, DbosError> {
        let mut tx = self.pool.begin().await?;
        let stmt = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&stmt).execute(&mut *tx).await?;
        Ok(SqlSession::Postgres(tx))
    }
}

fn map_conflict(err: sqlx::Error, workflow_uuid: &str) -> DbosError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(Dialect::Postgres.expressions().unique_violation_code)
        {
            return DbosError::WorkflowConflictID(workflow_uuid.to_string());
        }
    }
    DbosError::Database(err)
}

#[async_trait]
impl ApplicationDatabase for PostgresApplicationDatabase {
    #[instrument(skip(self))]
    async fn ensure_database_exists(&self) -> Result<(), DbosError> {
        let Some(maintenance) = &self.maintenance_pool else {
            return Ok(());
        };
        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
                .bind(&self.app_db_name)
                .fetch_optional(maintenance)
                .await?;
        if exists.is_none() {
            let create = format!("CREATE DATABASE \"{}\"", self.app_db_name.replace('"', ""));
            sqlx::raw_sql(&create).execute(maintenance).await?;
            debug!(db = %self.app_db_name, "created application database");
        }
        Ok(())
    }

    async fn install_schema(&self) -> Result<(), DbosError> {
        sqlx::raw_sql(SCHEMA_DDL).execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<SqlSession, DbosError> {
        self.do_begin(isolation).await
    }

    async fn check_transaction_execution(
        &self,
        session: &mut SqlSession,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<RecordedResult>, DbosError> {
        let tx = session
            .as_postgres_mut()
            .ok_or_else(|| DbosError::Unsupported("session is not a postgres transaction".into()))?;
        let row = sqlx::query(
            "SELECT output, error FROM dbos.transaction_outputs \
             WHERE workflow_uuid = $1 AND function_id = $2",
        )
        .bind(workflow_uuid)
        .bind(function_id as i32)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|r| RecordedResult {
            output: r.get("output"),
            error: r.get("error"),
        }))
    }

    async fn record_transaction_output(
        &self,
        session: &mut SqlSession,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError> {
        let tx = session
            .as_postgres_mut()
            .ok_or_else(|| DbosError::Unsupported("session is not a postgres transaction".into()))?;
        let txid_expr = Dialect::Postgres.current_txid_expr();
        let sql = format!(
            "INSERT INTO dbos.transaction_outputs \
             (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id) \
             VALUES ($1, $2, $3, $4, {txid_expr}, $5, $6)"
        );
        sqlx::query(&sql)
            .bind(&row.workflow_uuid)
            .bind(row.function_id as i32)
            .bind(&row.output)
            .bind(&row.error)
            .bind(&row.txn_snapshot)
            .bind(&row.executor_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_conflict(e, &row.workflow_uuid))?;
        Ok(())
    }

    async fn commit(&self, session: SqlSession) -> Result<(), DbosError> {
        match session {
            SqlSession::Postgres(tx) => Ok(tx.commit().await?),
            _ => Err(DbosError::Unsupported("session is not a postgres transaction".into())),
        }
    }

    async fn rollback(&self, session: SqlSession) -> Result<(), DbosError> {
        match session {
            SqlSession::Postgres(tx) => Ok(tx.rollback().await?),
            _ => Err(DbosError::Unsupported("session is not a postgres transaction".into())),
        }
    }

    async fn record_transaction_error(
        &self,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError> {
        let mut tx = self.pool.begin().await?;
        let txid_expr = Dialect::Postgres.current_txid_expr();
        let sql = format!(
            "INSERT INTO dbos.transaction_outputs \
             (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id) \
             VALUES ($1, $2, NULL, $3, {txid_expr}, $4, $5)"
        );
        sqlx::query(&sql)
            .bind(&row.workflow_uuid)
            .bind(row.function_id as i32)
            .bind(&row.error)
            .bind(&row.txn_snapshot)
            .bind(&row.executor_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_conflict(e, &row.workflow_uuid))?;
        tx.commit().await?;
        Ok(())
    }
}

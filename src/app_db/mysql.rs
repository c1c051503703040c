//! MySQL [`ApplicationDatabase`] (spec.md §4.4, §6).
//!
//! MySQL has no `RETURNING` and exposes the current transaction id only
//! via `INFORMATION_SCHEMA.INNODB_TRX`, read from inside the open
//! transaction (spec.md §3 invariant 5).

use async_trait::async_trait;
use sqlx::{MySqlPool, Row, Transaction};
use tracing::debug;

use super::session::SqlSession;
use super::store::{ApplicationDatabase, IsolationLevel, RecordedResult, TransactionOutputInsert};
use crate::dialect::Dialect;
use crate::error::DbosError;

const SCHEMA_DDL: &str = r#"CREATE TABLE IF NOT EXISTS transaction_outputs (
    workflow_uuid VARCHAR(100) NOT NULL,
    function_id INT NOT NULL,
    output TEXT,
    error TEXT,
    txn_id VARCHAR(128),
    txn_snapshot TEXT,
    executor_id VARCHAR(128),
    created_at BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP(NOW(3)) * 1000),
    PRIMARY KEY (workflow_uuid, function_id),
    INDEX transaction_outputs_created_at_index (created_at)
) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#;

/// A pool of connections to the application database, plus a maintenance
/// pool (connected to a server without a default database selected) used
/// only to create the database itself if absent.
#[derive(Clone)]
pub struct MySqlApplicationDatabase {
    pool: MySqlPool,
    maintenance_pool: Option<MySqlPool>,
    app_db_name: String,
}

impl MySqlApplicationDatabase {
    pub fn new(pool: MySqlPool, app_db_name: impl Into<String>) -> Self {
        Self {
            pool,
            maintenance_pool: None,
            app_db_name: app_db_name.into(),
        }
    }

    pub fn with_maintenance_pool(mut self, maintenance_pool: MySqlPool) -> Self {
        self.maintenance_pool = Some(maintenance_pool);
        self
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn do_begin(&self, isolation: IsolationLevel) -> Result<SqlSession, DbosError> {
        // MySQL's SET TRANSACTION ISOLATION LEVEL applies only to the next
        // transaction opened on the *same* connection, so the SET and the
        // BEGIN must share one connection rather than going through
        // `pool.begin()`, which could hand back a different one.
        let mut conn = self.pool.acquire().await?;
        let stmt = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&stmt).execute(&mut *conn).await?;
        let tx = Transaction::begin(conn, None).await?;
        Ok(SqlSession::MySql(tx))
    }
}

fn map_conflict(err: sqlx::Error, workflow_uuid: &str) -> DbosError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(Dialect::MySql.expressions().unique_violation_code) {
            return DbosError::WorkflowConflictID(workflow_uuid.to_string());
        }
    }
    DbosError::Database(err)
}

#[async_trait]
impl ApplicationDatabase for MySqlApplicationDatabase {
    async fn ensure_database_exists(&self) -> Result<(), DbosError> {
        let Some(maintenance) = &self.maintenance_pool else {
            return Ok(());
        };
        let create = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_bin",
            self.app_db_name.replace('`', "")
        );
        sqlx::raw_sql(&create).execute(maintenance).await?;
        debug!(db = %self.app_db_name, "ensured application database exists");
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
            .as_mysql_mut()
            .ok_or_else(|| DbosError::Unsupported("session is not a mysql transaction".into()))?;
        let row = sqlx::query(
            "SELECT output, error FROM transaction_outputs \
             WHERE workflow_uuid = ? AND function_id = ?",
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
            .as_mysql_mut()
            .ok_or_else(|| DbosError::Unsupported("session is not a mysql transaction".into()))?;
        let txid_expr = Dialect::MySql.current_txid_expr();
        let sql = format!(
            "INSERT INTO transaction_outputs \
             (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id) \
             VALUES (?, ?, ?, ?, {txid_expr}, ?, ?)"
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
            SqlSession::MySql(tx) => Ok(tx.commit().await?),
            _ => Err(DbosError::Unsupported("session is not a mysql transaction".into())),
        }
    }

    async fn rollback(&self, session: SqlSession) -> Result<(), DbosError> {
        match session {
            SqlSession::MySql(tx) => Ok(tx.rollback().await?),
            _ => Err(DbosError::Unsupported("session is not a mysql transaction".into())),
        }
    }

    async fn record_transaction_error(
        &self,
        row: &TransactionOutputInsert,
    ) -> Result<(), DbosError> {
        let mut tx = self.pool.begin().await?;
        let txid_expr = Dialect::MySql.current_txid_expr();
        let sql = format!(
            "INSERT INTO transaction_outputs \
             (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id) \
             VALUES (?, ?, NULL, ?, {txid_expr}, ?, ?)"
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

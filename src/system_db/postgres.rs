//! PostgreSQL implementation of [`SystemDatabase`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::{
    NewOperationOutput, NewWorkflowStatus, OperationOutputRow, SystemDatabase, WorkflowStatus,
    WorkflowStatusRow,
};
use crate::error::DbosError;

const SCHEMA_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS dbos;

CREATE TABLE IF NOT EXISTS dbos.workflow_status (
    workflow_uuid VARCHAR(100) PRIMARY KEY,
    status VARCHAR(20),
    name VARCHAR(128),
    authenticated_user VARCHAR(32),
    assumed_role VARCHAR(32),
    authenticated_roles VARCHAR(128),
    request TEXT,
    output TEXT,
    error TEXT,
    executor_id VARCHAR(128),
    created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint,
    updated_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint,
    application_version VARCHAR(128),
    application_id VARCHAR(128),
    class_name VARCHAR(255),
    config_name VARCHAR(255),
    recovery_attempts BIGINT DEFAULT 0,
    queue_name VARCHAR(128)
);
CREATE INDEX IF NOT EXISTS workflow_status_created_at_index ON dbos.workflow_status (created_at);
CREATE INDEX IF NOT EXISTS workflow_status_executor_id_index ON dbos.workflow_status (executor_id);

CREATE TABLE IF NOT EXISTS dbos.operation_outputs (
    workflow_uuid VARCHAR(100) NOT NULL REFERENCES dbos.workflow_status (workflow_uuid) ON UPDATE CASCADE ON DELETE CASCADE,
    function_id INTEGER NOT NULL,
    output TEXT,
    error TEXT,
    PRIMARY KEY (workflow_uuid, function_id)
);

CREATE TABLE IF NOT EXISTS dbos.workflow_inputs (
    workflow_uuid VARCHAR(100) PRIMARY KEY REFERENCES dbos.workflow_status (workflow_uuid) ON UPDATE CASCADE ON DELETE CASCADE,
    inputs TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dbos.notifications (
    destination_uuid VARCHAR(36) NOT NULL REFERENCES dbos.workflow_status (workflow_uuid) ON UPDATE CASCADE ON DELETE CASCADE,
    topic VARCHAR(128),
    message TEXT NOT NULL,
    created_at_epoch_ms BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint,
    message_uuid VARCHAR(36) NOT NULL DEFAULT gen_random_uuid()::text
);
CREATE INDEX IF NOT EXISTS idx_workflow_topic ON dbos.notifications (destination_uuid, topic);

CREATE TABLE IF NOT EXISTS dbos.workflow_events (
    workflow_uuid VARCHAR(100) NOT NULL REFERENCES dbos.workflow_status (workflow_uuid) ON UPDATE CASCADE ON DELETE CASCADE,
    key VARCHAR(128) NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (workflow_uuid, key)
);

CREATE TABLE IF NOT EXISTS dbos.scheduler_state (
    workflow_fn_name VARCHAR(255) PRIMARY KEY,
    last_run_time BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS dbos.workflow_queue (
    workflow_uuid VARCHAR(100) PRIMARY KEY REFERENCES dbos.workflow_status (workflow_uuid) ON UPDATE CASCADE ON DELETE CASCADE,
    executor_id VARCHAR(128),
    queue_name VARCHAR(128) NOT NULL,
    created_at_epoch_ms BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint,
    started_at_epoch_ms BIGINT,
    completed_at_epoch_ms BIGINT
);
"#;

/// PostgreSQL-backed [`SystemDatabase`]. Uses a bounded connection pool
/// (spec.md §5 defaults: size 20, overflow 5, timeout 30s — configured by
/// the caller via [`crate::config::DbosConfig::build_postgres_pool`]).
#[derive(Clone)]
pub struct PostgresSystemDatabase {
    pool: PgPool,
}

impl PostgresSystemDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_conflict(err: sqlx::Error, workflow_uuid: &str) -> DbosError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return DbosError::WorkflowConflictID(workflow_uuid.to_string());
            }
        }
        DbosError::Database(err)
    }
}

fn row_to_status(row: sqlx::postgres::PgRow) -> Result<WorkflowStatusRow, DbosError> {
    let status_str: String = row.try_get("status")?;
    Ok(WorkflowStatusRow {
        workflow_uuid: row.try_get("workflow_uuid")?,
        status: WorkflowStatus::parse(&status_str)?,
        name: row.try_get("name")?,
        authenticated_user: row.try_get("authenticated_user")?,
        assumed_role: row.try_get("assumed_role")?,
        authenticated_roles: row.try_get("authenticated_roles")?,
        request: row.try_get("request")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        executor_id: row.try_get("executor_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        application_version: row.try_get("application_version")?,
        application_id: row.try_get("application_id")?,
        class_name: row.try_get("class_name")?,
        config_name: row.try_get("config_name")?,
        recovery_attempts: row.try_get("recovery_attempts")?,
        queue_name: row.try_get("queue_name")?,
    })
}

#[async_trait]
impl SystemDatabase for PostgresSystemDatabase {
    #[instrument(skip(self))]
    async fn install_schema(&self) -> Result<(), DbosError> {
        sqlx::raw_sql(SCHEMA_DDL).execute(&self.pool).await?;
        debug!("installed system database schema");
        Ok(())
    }

    #[instrument(skip(self, input))]
    async fn insert_or_recover_workflow_status(
        &self,
        input: &NewWorkflowStatus,
    ) -> Result<WorkflowStatusRow, DbosError> {
        let row = sqlx::query(
            r#"
            INSERT INTO dbos.workflow_status
                (workflow_uuid, status, name, authenticated_user, assumed_role,
                 authenticated_roles, request, executor_id, application_version,
                 application_id, class_name, config_name, recovery_attempts, queue_name)
            VALUES ($1, 'PENDING', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1, $12)
            ON CONFLICT (workflow_uuid) DO UPDATE SET
                recovery_attempts = dbos.workflow_status.recovery_attempts + 1,
                updated_at = CASE WHEN dbos.workflow_status.status = 'PENDING'
                    THEN (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint
                    ELSE dbos.workflow_status.updated_at END
            RETURNING *
            "#,
        )
        .bind(&input.workflow_uuid)
        .bind(&input.name)
        .bind(&input.authenticated_user)
        .bind(&input.assumed_role)
        .bind(&input.authenticated_roles)
        .bind(&input.request)
        .bind(&input.executor_id)
        .bind(&input.application_version)
        .bind(&input.application_id)
        .bind(&input.class_name)
        .bind(&input.config_name)
        .bind(&input.queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to dispatch workflow status: {e}");
            DbosError::Database(e)
        })?;

        row_to_status(row)
    }

    async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, DbosError> {
        let row = sqlx::query("SELECT * FROM dbos.workflow_status WHERE workflow_uuid = $1")
            .bind(workflow_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_status).transpose()
    }

    async fn insert_workflow_inputs(
        &self,
        workflow_uuid: &str,
        inputs: &str,
    ) -> Result<bool, DbosError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dbos.workflow_inputs (workflow_uuid, inputs)
            SELECT $1, $2 WHERE EXISTS (
                SELECT 1 FROM dbos.workflow_status WHERE workflow_uuid = $1
            )
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_uuid)
        .bind(inputs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_workflow_inputs(&self, workflow_uuid: &str) -> Result<Option<String>, DbosError> {
        let row = sqlx::query("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
            .bind(workflow_uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("inputs")))
    }

    #[instrument(skip(self, output, error))]
    async fn write_terminal_status(
        &self,
        workflow_uuid: &str,
        status: WorkflowStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DbosError> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = $2, output = $3, error = $4,
                updated_at = (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_uuid)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        executor_ids: Option<&[String]>,
    ) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let rows = match executor_ids {
            Some(ids) => {
                sqlx::query(
                    "SELECT * FROM dbos.workflow_status WHERE status = 'PENDING' AND executor_id = ANY($1)",
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM dbos.workflow_status WHERE status = 'PENDING'")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_status).collect()
    }

    async fn list_since(&self, since_epoch_ms: i64) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let rows = sqlx::query("SELECT * FROM dbos.workflow_status WHERE created_at >= $1")
            .bind(since_epoch_ms)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_status).collect()
    }

    async fn get_operation_output(
        &self,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, DbosError> {
        let row = sqlx::query(
            "SELECT workflow_uuid, function_id, output, error FROM dbos.operation_outputs \
             WHERE workflow_uuid = $1 AND function_id = $2",
        )
        .bind(workflow_uuid)
        .bind(function_id as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| OperationOutputRow {
            workflow_uuid: r.get("workflow_uuid"),
            function_id: r.get::<i32, _>("function_id") as i64,
            output: r.get("output"),
            error: r.get("error"),
        }))
    }

    async fn insert_operation_output(
        &self,
        row: &NewOperationOutput,
    ) -> Result<bool, DbosError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, error)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_uuid, function_id) DO NOTHING
            "#,
        )
        .bind(&row.workflow_uuid)
        .bind(row.function_id as i32)
        .bind(&row.output)
        .bind(&row.error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
        message: &str,
    ) -> Result<(), DbosError> {
        sqlx::query(
            "INSERT INTO dbos.notifications (destination_uuid, topic, message) VALUES ($1, $2, $3)",
        )
        .bind(destination_uuid)
        .bind(topic)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_conflict(e, destination_uuid))?;

        // Best-effort wakeup for any `recv`/`get_event` waiter parked on
        // LISTEN; a missed notify is harmless since waiters also poll.
        let channel = notify_channel(destination_uuid);
        let _ = sqlx::query("SELECT pg_notify($1, '')")
            .bind(&channel)
            .execute(&self.pool)
            .await;
        Ok(())
    }

    async fn consume_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
    ) -> Result<Option<String>, DbosError> {
        let row = sqlx::query(
            r#"
            DELETE FROM dbos.notifications
            WHERE ctid = (
                SELECT ctid FROM dbos.notifications
                WHERE destination_uuid = $1 AND topic IS NOT DISTINCT FROM $2
                ORDER BY created_at_epoch_ms ASC
                LIMIT 1
            )
            RETURNING message
            "#,
        )
        .bind(destination_uuid)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("message")))
    }

    async fn await_notification(&self, destination_uuid: &str, timeout: Duration) -> bool {
        let channel = notify_channel(destination_uuid);
        let Ok(mut listener) = PgListener::connect_with(&self.pool).await else {
            tokio::time::sleep(timeout.min(Duration::from_millis(200))).await;
            return true;
        };
        if listener.listen(&channel).await.is_err() {
            tokio::time::sleep(timeout.min(Duration::from_millis(200))).await;
            return true;
        }
        tokio::time::timeout(timeout, listener.recv()).await.is_ok()
    }

    async fn upsert_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbosError> {
        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_events (workflow_uuid, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(workflow_uuid)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
    ) -> Result<Option<String>, DbosError> {
        let row = sqlx::query(
            "SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2",
        )
        .bind(workflow_uuid)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn upsert_scheduler_state(
        &self,
        workflow_fn_name: &str,
        last_run_time: i64,
    ) -> Result<(), DbosError> {
        sqlx::query(
            r#"
            INSERT INTO dbos.scheduler_state (workflow_fn_name, last_run_time)
            VALUES ($1, $2)
            ON CONFLICT (workflow_fn_name) DO UPDATE SET last_run_time = EXCLUDED.last_run_time
            "#,
        )
        .bind(workflow_fn_name)
        .bind(last_run_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scheduler_state(
        &self,
        workflow_fn_name: &str,
    ) -> Result<Option<i64>, DbosError> {
        let row = sqlx::query(
            "SELECT last_run_time FROM dbos.scheduler_state WHERE workflow_fn_name = $1",
        )
        .bind(workflow_fn_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("last_run_time")))
    }

    async fn enqueue(&self, workflow_uuid: &str, queue_name: &str) -> Result<(), DbosError> {
        sqlx::query(
            "INSERT INTO dbos.workflow_queue (workflow_uuid, queue_name) VALUES ($1, $2) \
             ON CONFLICT (workflow_uuid) DO NOTHING",
        )
        .bind(workflow_uuid)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_queue_started(&self, workflow_uuid: &str) -> Result<(), DbosError> {
        sqlx::query(
            "UPDATE dbos.workflow_queue SET started_at_epoch_ms = (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint \
             WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_queue_completed(&self, workflow_uuid: &str) -> Result<(), DbosError> {
        sqlx::query(
            "UPDATE dbos.workflow_queue SET completed_at_epoch_ms = (EXTRACT(EPOCH FROM NOW()) * 1000)::bigint \
             WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn notify_channel(destination_uuid: &str) -> String {
    format!("dbos_notify_{}", destination_uuid.replace('-', "_"))
}

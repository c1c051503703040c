//! MySQL implementation of [`SystemDatabase`].
//!
//! MySQL has no `RETURNING` clause and no `LISTEN`/`NOTIFY` channel, so
//! the insert-then-read and notification paths take one extra round trip
//! compared to the Postgres adapter; `await_notification`/`await_event`
//! fall back to the trait's default bounded-backoff poll.

use async_trait::async_trait;
use sqlx::{MySqlPool, Row};
use tracing::{debug, instrument};

use super::store::{
    NewOperationOutput, NewWorkflowStatus, OperationOutputRow, SystemDatabase, WorkflowStatus,
    WorkflowStatusRow,
};
use crate::error::DbosError;

const SCHEMA_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS workflow_status (
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
        created_at BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP(NOW(3)) * 1000),
        updated_at BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP(NOW(3)) * 1000),
        application_version VARCHAR(128),
        application_id VARCHAR(128),
        class_name VARCHAR(255),
        config_name VARCHAR(255),
        recovery_attempts BIGINT DEFAULT 0,
        queue_name VARCHAR(128),
        INDEX workflow_status_created_at_index (created_at),
        INDEX workflow_status_executor_id_index (executor_id)
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS operation_outputs (
        workflow_uuid VARCHAR(100) NOT NULL,
        function_id INT NOT NULL,
        output TEXT,
        error TEXT,
        PRIMARY KEY (workflow_uuid, function_id),
        FOREIGN KEY (workflow_uuid) REFERENCES workflow_status (workflow_uuid)
            ON UPDATE CASCADE ON DELETE CASCADE
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_inputs (
        workflow_uuid VARCHAR(100) PRIMARY KEY,
        inputs TEXT NOT NULL,
        FOREIGN KEY (workflow_uuid) REFERENCES workflow_status (workflow_uuid)
            ON UPDATE CASCADE ON DELETE CASCADE
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS notifications (
        destination_uuid VARCHAR(36) NOT NULL,
        topic VARCHAR(128),
        message TEXT NOT NULL,
        created_at_epoch_ms BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP(NOW(3)) * 1000),
        message_uuid VARCHAR(36) NOT NULL DEFAULT (UUID()),
        INDEX idx_workflow_topic (destination_uuid, topic),
        FOREIGN KEY (destination_uuid) REFERENCES workflow_status (workflow_uuid)
            ON UPDATE CASCADE ON DELETE CASCADE
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_events (
        workflow_uuid VARCHAR(100) NOT NULL,
        `key` VARCHAR(128) NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (workflow_uuid, `key`),
        FOREIGN KEY (workflow_uuid) REFERENCES workflow_status (workflow_uuid)
            ON UPDATE CASCADE ON DELETE CASCADE
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS scheduler_state (
        workflow_fn_name VARCHAR(255) PRIMARY KEY,
        last_run_time BIGINT NOT NULL
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_queue (
        workflow_uuid VARCHAR(100) PRIMARY KEY,
        executor_id VARCHAR(128),
        queue_name VARCHAR(128) NOT NULL,
        created_at_epoch_ms BIGINT NOT NULL DEFAULT (UNIX_TIMESTAMP(NOW(3)) * 1000),
        started_at_epoch_ms BIGINT,
        completed_at_epoch_ms BIGINT,
        FOREIGN KEY (workflow_uuid) REFERENCES workflow_status (workflow_uuid)
            ON UPDATE CASCADE ON DELETE CASCADE
    ) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin"#,
];

/// MySQL-backed [`SystemDatabase`].
#[derive(Clone)]
pub struct MySqlSystemDatabase {
    pool: MySqlPool,
}

impl MySqlSystemDatabase {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn row_to_status(row: sqlx::mysql::MySqlRow) -> Result<WorkflowStatusRow, DbosError> {
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
impl SystemDatabase for MySqlSystemDatabase {
    #[instrument(skip(self))]
    async fn install_schema(&self) -> Result<(), DbosError> {
        for statement in SCHEMA_DDL {
            sqlx::raw_sql(statement).execute(&self.pool).await?;
        }
        debug!("installed system database schema");
        Ok(())
    }

    async fn insert_or_recover_workflow_status(
        &self,
        input: &NewWorkflowStatus,
    ) -> Result<WorkflowStatusRow, DbosError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_status
                (workflow_uuid, status, name, authenticated_user, assumed_role,
                 authenticated_roles, request, executor_id, application_version,
                 application_id, class_name, config_name, recovery_attempts, queue_name)
            VALUES (?, 'PENDING', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON DUPLICATE KEY UPDATE
                recovery_attempts = recovery_attempts + 1,
                updated_at = IF(status = 'PENDING', (UNIX_TIMESTAMP(NOW(3)) * 1000), updated_at)
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
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM workflow_status WHERE workflow_uuid = ?")
            .bind(&input.workflow_uuid)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        row_to_status(row)
    }

    async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, DbosError> {
        let row = sqlx::query("SELECT * FROM workflow_status WHERE workflow_uuid = ?")
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
            INSERT INTO workflow_inputs (workflow_uuid, inputs)
            SELECT * FROM (SELECT ? AS workflow_uuid, ? AS inputs) AS tmp
            WHERE EXISTS (SELECT 1 FROM workflow_status WHERE workflow_uuid = ?)
            ON DUPLICATE KEY UPDATE workflow_uuid = workflow_uuid
            "#,
        )
        .bind(workflow_uuid)
        .bind(inputs)
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_workflow_inputs(&self, workflow_uuid: &str) -> Result<Option<String>, DbosError> {
        let row = sqlx::query("SELECT inputs FROM workflow_inputs WHERE workflow_uuid = ?")
            .bind(workflow_uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("inputs")))
    }

    async fn write_terminal_status(
        &self,
        workflow_uuid: &str,
        status: WorkflowStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DbosError> {
        sqlx::query(
            r#"
            UPDATE workflow_status
            SET status = ?, output = ?, error = ?, updated_at = (UNIX_TIMESTAMP(NOW(3)) * 1000)
            WHERE workflow_uuid = ? AND status = 'PENDING'
            "#,
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        executor_ids: Option<&[String]>,
    ) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let rows = match executor_ids {
            Some(ids) if !ids.is_empty() => {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT * FROM workflow_status WHERE status = 'PENDING' AND executor_id IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                query.fetch_all(&self.pool).await?
            }
            Some(_) => vec![],
            None => {
                sqlx::query("SELECT * FROM workflow_status WHERE status = 'PENDING'")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_status).collect()
    }

    async fn list_since(&self, since_epoch_ms: i64) -> Result<Vec<WorkflowStatusRow>, DbosError> {
        let rows = sqlx::query("SELECT * FROM workflow_status WHERE created_at >= ?")
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
            "SELECT workflow_uuid, function_id, output, error FROM operation_outputs \
             WHERE workflow_uuid = ? AND function_id = ?",
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
            "INSERT IGNORE INTO operation_outputs (workflow_uuid, function_id, output, error) \
             VALUES (?, ?, ?, ?)",
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
        sqlx::query("INSERT INTO notifications (destination_uuid, topic, message) VALUES (?, ?, ?)")
            .bind(destination_uuid)
            .bind(topic)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_notification(
        &self,
        destination_uuid: &str,
        topic: Option<&str>,
    ) -> Result<Option<String>, DbosError> {
        let mut tx = self.pool.begin().await?;
        let found = sqlx::query(
            r#"
            SELECT message_uuid, message FROM notifications
            WHERE destination_uuid = ? AND topic <=> ?
            ORDER BY created_at_epoch_ms ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(destination_uuid)
        .bind(topic)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = found else {
            tx.commit().await?;
            return Ok(None);
        };
        let message_uuid: String = row.get("message_uuid");
        let message: String = row.get("message");
        sqlx::query("DELETE FROM notifications WHERE message_uuid = ?")
            .bind(&message_uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(message))
    }

    async fn upsert_workflow_event(
        &self,
        workflow_uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbosError> {
        sqlx::query(
            "INSERT INTO workflow_events (workflow_uuid, `key`, value) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE value = VALUES(value)",
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
            "SELECT value FROM workflow_events WHERE workflow_uuid = ? AND `key` = ?",
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
            "INSERT INTO scheduler_state (workflow_fn_name, last_run_time) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE last_run_time = VALUES(last_run_time)",
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
        let row = sqlx::query("SELECT last_run_time FROM scheduler_state WHERE workflow_fn_name = ?")
            .bind(workflow_fn_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("last_run_time")))
    }

    async fn enqueue(&self, workflow_uuid: &str, queue_name: &str) -> Result<(), DbosError> {
        sqlx::query(
            "INSERT IGNORE INTO workflow_queue (workflow_uuid, queue_name) VALUES (?, ?)",
        )
        .bind(workflow_uuid)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_queue_started(&self, workflow_uuid: &str) -> Result<(), DbosError> {
        sqlx::query(
            "UPDATE workflow_queue SET started_at_epoch_ms = (UNIX_TIMESTAMP(NOW(3)) * 1000) \
             WHERE workflow_uuid = ?",
        )
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_queue_completed(&self, workflow_uuid: &str) -> Result<(), DbosError> {
        sqlx::query(
            "UPDATE workflow_queue SET completed_at_epoch_ms = (UNIX_TIMESTAMP(NOW(3)) * 1000) \
             WHERE workflow_uuid = ?",
        )
        .bind(workflow_uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Runtime configuration and top-level lifecycle (spec.md §5, §9).
//!
//! [`DbosConfig`] holds the pool sizing and identity fields every dialect
//! adapter needs; [`DbosRuntime`] wires a concrete `SystemDatabase` +
//! `ApplicationDatabase` pair, the write buffer, and the registry into one
//! `WorkflowExecutor` and drives startup recovery.

use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool};
use tracing::info;

use crate::app_db::{ApplicationDatabase, MySqlApplicationDatabase, PostgresApplicationDatabase};
use crate::buffers::BufferManager;
use crate::error::DbosError;
use crate::executor::WorkflowExecutor;
use crate::registry::WorkflowRegistry;
use crate::system_db::{MySqlSystemDatabase, PostgresSystemDatabase, SystemDatabase};

/// Pool and identity configuration shared by both dialects (spec.md §5
/// defaults: pool size 20, overflow 5, acquire timeout 30s).
#[derive(Debug, Clone)]
pub struct DbosConfig {
    pub system_database_url: String,
    pub application_database_url: Option<String>,
    pub application_db_name: Option<String>,
    pub pool_size: u32,
    pub pool_overflow: u32,
    pub pool_acquire_timeout: Duration,
    pub executor_id: String,
    pub application_id: Option<String>,
    pub application_version: Option<String>,
    /// How often the write buffer flushes on its own, absent an explicit
    /// `wait_for_buffer_flush` call (spec.md §4.5 default 50ms).
    pub flush_interval: Duration,
    /// Run `recover_pending_workflows` once at startup (spec.md §9).
    pub recover_on_init: bool,
}

impl DbosConfig {
    pub fn new(system_database_url: impl Into<String>) -> Self {
        Self {
            system_database_url: system_database_url.into(),
            application_database_url: None,
            application_db_name: None,
            pool_size: 20,
            pool_overflow: 5,
            pool_acquire_timeout: Duration::from_secs(30),
            executor_id: "local".to_string(),
            application_id: None,
            application_version: None,
            flush_interval: Duration::from_millis(50),
            recover_on_init: true,
        }
    }

    pub fn with_application_database(mut self, url: impl Into<String>, db_name: impl Into<String>) -> Self {
        self.application_database_url = Some(url.into());
        self.application_db_name = Some(db_name.into());
        self
    }

    pub fn with_executor_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    pub fn with_application_identity(mut self, application_id: impl Into<String>, version: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self.application_version = Some(version.into());
        self
    }

    fn max_connections(&self) -> u32 {
        self.pool_size + self.pool_overflow
    }

    pub async fn build_postgres_pool(&self, database_url: &str) -> Result<PgPool, DbosError> {
        PgPoolOptions::new()
            .max_connections(self.max_connections())
            .min_connections(self.pool_size)
            .acquire_timeout(self.pool_acquire_timeout)
            .connect(database_url)
            .await
            .map_err(DbosError::from)
    }

    pub async fn build_mysql_pool(&self, database_url: &str) -> Result<MySqlPool, DbosError> {
        MySqlPoolOptions::new()
            .max_connections(self.max_connections())
            .min_connections(self.pool_size)
            .acquire_timeout(self.pool_acquire_timeout)
            .connect(database_url)
            .await
            .map_err(DbosError::from)
    }
}

/// A fully wired runtime: system/application databases, write buffer,
/// registry, and the executor built from them. `S`/`A` are left generic so
/// `DbosRuntime` works identically over the Postgres pair, the MySQL pair,
/// or the in-memory test doubles.
pub struct DbosRuntime<S, A> {
    pub executor: WorkflowExecutor<S, A>,
    system_db: Arc<S>,
    buffers: Arc<BufferManager<S>>,
}

impl<S: SystemDatabase, A: ApplicationDatabase> DbosRuntime<S, A> {
    /// Assemble a runtime from already-constructed adapters. Schema
    /// installation is the caller's responsibility (call
    /// `install_schema`/`ensure_database_exists` on each adapter first) —
    /// `init` never runs DDL implicitly so a read replica or a
    /// restricted-privilege connection string can be used safely.
    pub fn new(system_db: Arc<S>, app_db: Arc<A>, config: &DbosConfig) -> Self {
        let buffers = BufferManager::spawn(system_db.clone(), config.flush_interval);
        let registry = Arc::new(WorkflowRegistry::new());
        let executor = WorkflowExecutor::new(system_db.clone(), app_db, buffers.clone(), registry, config);
        Self {
            executor,
            system_db,
            buffers,
        }
    }

    /// Run startup recovery, re-dispatching every `PENDING` workflow owned
    /// by `config.executor_id` (spec.md §9). Call after registering every
    /// workflow the process can replay.
    pub async fn recover(&self) -> Result<usize, DbosError> {
        let handles = self.executor.recover_pending_workflows(None).await?;
        info!(count = handles.len(), "recovered pending workflows");
        Ok(handles.len())
    }

    /// Flush any buffered writes and let the background flusher keep
    /// running; callers that need a clean shutdown point should await this
    /// before dropping the runtime.
    pub async fn destroy(&self) {
        self.buffers.wait_for_buffer_flush().await;
    }

    pub fn system_db(&self) -> &Arc<S> {
        &self.system_db
    }
}

impl DbosRuntime<PostgresSystemDatabase, PostgresApplicationDatabase> {
    pub async fn connect_postgres(config: &DbosConfig) -> Result<Self, DbosError> {
        let system_pool = config.build_postgres_pool(&config.system_database_url).await?;
        let system_db = Arc::new(PostgresSystemDatabase::new(system_pool));
        system_db.install_schema().await?;

        let app_url = config
            .application_database_url
            .as_deref()
            .unwrap_or(&config.system_database_url);
        let app_pool = config.build_postgres_pool(app_url).await?;
        let app_db_name = config
            .application_db_name
            .clone()
            .unwrap_or_else(|| "dbos_app".to_string());
        let app_db = Arc::new(PostgresApplicationDatabase::new(app_pool, app_db_name));
        app_db.install_schema().await?;

        let runtime = Self::new(system_db, app_db, config);
        if config.recover_on_init {
            runtime.recover().await?;
        }
        Ok(runtime)
    }
}

impl DbosRuntime<MySqlSystemDatabase, MySqlApplicationDatabase> {
    pub async fn connect_mysql(config: &DbosConfig) -> Result<Self, DbosError> {
        let system_pool = config.build_mysql_pool(&config.system_database_url).await?;
        let system_db = Arc::new(MySqlSystemDatabase::new(system_pool));
        system_db.install_schema().await?;

        let app_url = config
            .application_database_url
            .as_deref()
            .unwrap_or(&config.system_database_url);
        let app_pool = config.build_mysql_pool(app_url).await?;
        let app_db_name = config
            .application_db_name
            .clone()
            .unwrap_or_else(|| "dbos_app".to_string());
        let app_db = Arc::new(MySqlApplicationDatabase::new(app_pool, app_db_name));
        app_db.install_schema().await?;

        let runtime = Self::new(system_db, app_db, config);
        if config.recover_on_init {
            runtime.recover().await?;
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_connections_adds_overflow_to_pool_size() {
        let config = DbosConfig::new("postgres://localhost/dbos");
        assert_eq!(config.max_connections(), 25);
    }

    #[test]
    fn defaults_match_spec() {
        let config = DbosConfig::new("postgres://localhost/dbos");
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.pool_overflow, 5);
        assert_eq!(config.flush_interval, Duration::from_millis(50));
        assert!(config.recover_on_init);
    }
}

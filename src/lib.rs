//! # Durable Workflow Execution Runtime
//!
//! Exactly-once, crash-recoverable workflow execution against PostgreSQL
//! or MySQL, in the style of DBOS: workflows, transactions, and steps all
//! checkpoint their progress so a crash mid-execution resumes from the
//! last completed step rather than re-running work that already committed.
//!
//! ## Features
//!
//! - **OAOO checkpointing**: workflow results, transaction outputs, and
//!   step outputs are recorded once and replayed on every subsequent
//!   dispatch of the same workflow id
//! - **Crash recovery**: `PENDING` workflows are re-dispatched from
//!   persisted inputs, either eagerly at startup or via a periodic
//!   [`recovery::RecoveryLoop`]
//! - **Inter-workflow signalling**: `send`/`recv` and `set_event`/`get_event`
//! - **Durable sleep**: a sleeping workflow resumes counting down from its
//!   originally recorded wake time after a crash, not from zero
//! - **Buffered writes**: terminal workflow status and workflow inputs are
//!   batched by a background flusher for throughput (spec'd ordering:
//!   status before inputs, to respect the foreign key between them)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (dispatch/transaction/step algorithms, signalling, sleep)   │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                           │
//!                   ▼                           ▼
//! ┌─────────────────────────────┐   ┌─────────────────────────────┐
//! │        SystemDatabase        │   │     ApplicationDatabase      │
//! │ workflow_status, inputs,     │   │ transaction_outputs,         │
//! │ operation_outputs,           │   │ colocated with the user's    │
//! │ notifications, events        │   │ own schema                   │
//! └─────────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use workflow_runtime::prelude::*;
//!
//! let system_db = Arc::new(InMemorySystemDatabase::new());
//! let app_db = Arc::new(InMemoryApplicationDatabase::new());
//! let config = DbosConfig::new("memory://");
//! let runtime = DbosRuntime::new(system_db, app_db, &config);
//!
//! let handle = runtime
//!     .executor
//!     .start_workflow("greet", "alice".to_string(), |name| async move {
//!         Ok::<_, DbosError>(format!("hello {name}"))
//!     })
//!     .await?;
//! assert_eq!(handle.get_result().await?, "hello alice");
//! ```

pub mod app_db;
pub mod buffers;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod handle;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod serialize;
pub mod system_db;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::app_db::{
        ApplicationDatabase, InMemoryApplicationDatabase, IsolationLevel, MySqlApplicationDatabase,
        PostgresApplicationDatabase, SqlSession,
    };
    pub use crate::config::{DbosConfig, DbosRuntime};
    pub use crate::context::{ExecutionContext, SetWorkflowId};
    pub use crate::dialect::Dialect;
    pub use crate::error::DbosError;
    pub use crate::executor::WorkflowExecutor;
    pub use crate::handle::WorkflowHandle;
    pub use crate::recovery::RecoveryLoop;
    pub use crate::registry::WorkflowRegistry;
    pub use crate::retry::RetryPolicy;
    pub use crate::system_db::{
        InMemorySystemDatabase, MySqlSystemDatabase, PostgresSystemDatabase, SystemDatabase,
        WorkflowStatus, WorkflowStatusRow,
    };
}

pub use app_db::{ApplicationDatabase, IsolationLevel, SqlSession};
pub use config::{DbosConfig, DbosRuntime};
pub use context::ExecutionContext;
pub use dialect::Dialect;
pub use error::DbosError;
pub use executor::WorkflowExecutor;
pub use handle::WorkflowHandle;
pub use recovery::RecoveryLoop;
pub use registry::WorkflowRegistry;
pub use retry::RetryPolicy;
pub use system_db::{SystemDatabase, WorkflowStatus, WorkflowStatusRow};

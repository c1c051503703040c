//! Error taxonomy for the durable execution runtime

use serde_json::Value;

/// Errors surfaced by the system database, application database adapter,
/// and workflow executor.
#[derive(Debug, thiserror::Error)]
pub enum DbosError {
    /// An insert raced another worker recording the same checkpoint; the
    /// caller should re-read and use the existing row.
    #[error("workflow conflict for id {0}")]
    WorkflowConflictID(String),

    /// `retrieve_workflow` (or `execute_workflow_id`) was called with an
    /// id that has no `workflow_status` row.
    #[error("workflow does not exist: {0}")]
    NonExistentWorkflow(String),

    /// A step exhausted its retry budget.
    #[error("step {function_id} exceeded max retries: {source}")]
    MaxStepRetriesExceeded {
        function_id: i64,
        #[source]
        source: Box<DbosError>,
    },

    /// The requested dialect or feature is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Underlying database error, propagated unwrapped except for the
    /// dialect's unique-constraint-violation SQLSTATE, which is mapped to
    /// `WorkflowConflictID` by the caller before it reaches here.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failure encoding/decoding a checkpointed value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A user-supplied workflow/transaction/step body returned an error
    /// (or panicked). Captured, serialized into the relevant `_outputs`
    /// table, and re-raised on first execution and on every replay.
    #[error("user error: {message}")]
    User {
        message: String,
        payload: Option<Value>,
    },
}

impl DbosError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
            payload: None,
        }
    }

    pub fn user_with_payload(message: impl Into<String>, payload: Value) -> Self {
        Self::User {
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// True if this error's SQLSTATE (when it wraps a `sqlx::Error`)
    /// matches the dialect's unique-constraint-violation code (`23505`).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbosError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

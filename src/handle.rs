//! [`WorkflowHandle`]: the value returned by `start_workflow`,
//! `retrieve_workflow`, and the replay entry points (spec.md §4.2).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::error::DbosError;
use crate::serialize::{decode, EncodedError};
use crate::system_db::{SystemDatabase, WorkflowStatus, WorkflowStatusRow};

enum Inner {
    /// A workflow dispatched in this process: its result is already on
    /// its way back over a `JoinHandle`, no polling required.
    Local(JoinHandle<Result<String, DbosError>>),
    /// A workflow looked up by id (`retrieve_workflow`) that may be
    /// running in a different process entirely; its result must be
    /// polled for out of `workflow_status`.
    Remote,
}

/// A handle to a dispatched or retrieved workflow. `T` is the type the
/// caller expects to decode the eventual result as.
pub struct WorkflowHandle<S, T> {
    workflow_id: String,
    system_db: Arc<S>,
    inner: Inner,
    _marker: PhantomData<fn() -> T>,
}

impl<S: SystemDatabase, T: DeserializeOwned> WorkflowHandle<S, T> {
    pub(crate) fn local(
        workflow_id: String,
        system_db: Arc<S>,
        join: JoinHandle<Result<String, DbosError>>,
    ) -> Self {
        Self {
            workflow_id,
            system_db,
            inner: Inner::Local(join),
            _marker: PhantomData,
        }
    }

    pub(crate) fn remote(workflow_id: String, system_db: Arc<S>) -> Self {
        Self {
            workflow_id,
            system_db,
            inner: Inner::Remote,
            _marker: PhantomData,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub async fn get_status(&self) -> Result<WorkflowStatusRow, DbosError> {
        self.system_db
            .get_workflow_status(&self.workflow_id)
            .await?
            .ok_or_else(|| DbosError::NonExistentWorkflow(self.workflow_id.clone()))
    }

    /// Block until the workflow reaches a terminal state and return its
    /// result (spec.md §4.2 "get_result() accepts no timeout and waits
    /// until terminal"). Consumes the handle: a `Local` handle's
    /// `JoinHandle` can only be awaited once.
    pub async fn get_result(self) -> Result<T, DbosError> {
        let encoded = match self.inner {
            Inner::Local(join) => join
                .await
                .map_err(|e| DbosError::Unsupported(format!("workflow task panicked: {e}")))??,
            Inner::Remote => self.poll_until_terminal().await?,
        };
        decode(&encoded)
    }

    async fn poll_until_terminal(&self) -> Result<String, DbosError> {
        loop {
            let row = self.get_status().await?;
            match row.status {
                WorkflowStatus::Success => {
                    return row
                        .output
                        .ok_or_else(|| DbosError::Unsupported(format!("workflow {} is SUCCESS with no output", self.workflow_id)));
                }
                WorkflowStatus::Error => {
                    let encoded = row.error.ok_or_else(|| {
                        DbosError::Unsupported(format!("workflow {} is ERROR with no error", self.workflow_id))
                    })?;
                    return Err(EncodedError::decode(&encoded)?.into_dbos_error());
                }
                WorkflowStatus::Pending => {
                    self.system_db
                        .await_event(&self.workflow_id, Duration::from_millis(100))
                        .await;
                }
            }
        }
    }
}

//! The background recovery loop (spec.md §4.3). Eager recovery at startup
//! is [`crate::config::DbosRuntime::recover`]; this is the optional
//! periodic sweep, for processes that stay up long enough for a peer
//! executor's crash to need picking up without a restart.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app_db::ApplicationDatabase;
use crate::error::DbosError;
use crate::executor::WorkflowExecutor;
use crate::handle::WorkflowHandle;
use crate::system_db::SystemDatabase;

/// Periodically re-dispatches `PENDING` workflows matching `executor_ids`
/// (`None` means every executor). Ticking is off until [`RecoveryLoop::spawn`]
/// is called; `tick_once` is exposed separately for tests and for callers
/// that want manual control over when a sweep runs.
pub struct RecoveryLoop<S, A> {
    executor: WorkflowExecutor<S, A>,
    executor_ids: Option<Vec<String>>,
}

impl<S: SystemDatabase, A: ApplicationDatabase> RecoveryLoop<S, A> {
    pub fn new(executor: WorkflowExecutor<S, A>, executor_ids: Option<Vec<String>>) -> Self {
        Self {
            executor,
            executor_ids,
        }
    }

    /// Run one recovery sweep, returning the handles of every workflow it
    /// re-dispatched.
    pub async fn tick_once(&self) -> Result<Vec<WorkflowHandle<S, serde_json::Value>>, DbosError> {
        let handles = self
            .executor
            .recover_pending_workflows(self.executor_ids.as_deref())
            .await?;
        debug!(count = handles.len(), "recovery sweep dispatched pending workflows");
        Ok(handles)
    }

    /// Spawn a `tokio` task that calls `tick_once` on `interval`, logging
    /// (not propagating) sweep failures so one bad sweep doesn't kill the
    /// loop. Returns the task's `JoinHandle`; dropping or aborting it stops
    /// the loop.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        S: 'static,
        A: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick_once().await {
                    warn!(%err, "recovery sweep failed");
                }
            }
        })
    }
}

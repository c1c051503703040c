//! Write buffers for `workflow_status` terminal writes and
//! `workflow_inputs` (spec.md §4.5).
//!
//! The initial `PENDING` insert (step 2 of the dispatch algorithm) is
//! written synchronously by the executor — OAOO's insert-if-absent race
//! detection and the `recovery_attempts` visibility guarantee (spec.md §9
//! open question) both need the write committed before the caller
//! proceeds. Only the two writes spec.md §4.5 names explicitly are
//! buffered: a workflow's *final* status, and its inputs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::system_db::{SystemDatabase, WorkflowStatus};

#[derive(Clone)]
struct StatusWrite {
    status: WorkflowStatus,
    output: Option<String>,
    error: Option<String>,
}

/// Batches `workflow_status` terminal writes and `workflow_inputs`
/// inserts behind a background flusher, draining both on an interval and
/// on-demand via [`BufferManager::wait_for_buffer_flush`].
pub struct BufferManager<S> {
    system_db: Arc<S>,
    status: DashMap<String, StatusWrite>,
    inputs: DashMap<String, String>,
    flush_request: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl<S: SystemDatabase> BufferManager<S> {
    /// Spawn the background flusher and return a handle shared by every
    /// workflow dispatched against `system_db`.
    pub fn spawn(system_db: Arc<S>, flush_interval: Duration) -> Arc<Self> {
        let (flush_request, mut flush_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let manager = Arc::new(Self {
            system_db,
            status: DashMap::new(),
            inputs: DashMap::new(),
            flush_request,
        });

        let background = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        background.flush_once().await;
                    }
                    request = flush_rx.recv() => {
                        match request {
                            Some(ack) => {
                                background.flush_once().await;
                                let _ = ack.send(());
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        manager
    }

    /// Queue a final (`SUCCESS`/`ERROR`) status write. Last write wins
    /// per `workflow_uuid` — a workflow only ever reaches one terminal
    /// state, so this only matters if the same id is somehow dispatched
    /// twice concurrently before the first flush.
    pub fn enqueue_status(
        &self,
        workflow_uuid: String,
        status: WorkflowStatus,
        output: Option<String>,
        error: Option<String>,
    ) {
        self.status.insert(
            workflow_uuid,
            StatusWrite {
                status,
                output,
                error,
            },
        );
    }

    /// Queue an inputs write. First write wins: inputs are recorded once
    /// per workflow and never change on replay.
    pub fn enqueue_inputs(&self, workflow_uuid: String, inputs: String) {
        self.inputs.entry(workflow_uuid).or_insert(inputs);
    }

    /// Block until every currently-queued write has been drained,
    /// round-tripping through the flusher task rather than sleeping a
    /// fixed duration (spec.md §8 scenario 4).
    pub async fn wait_for_buffer_flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.flush_request.send(tx).is_ok() {
            let _ = rx.await;
        }
    }

    async fn flush_once(&self) {
        // Status first, inputs second: workflow_inputs has an FK to
        // workflow_status (spec.md §9 cyclic FK hazard).
        let status_batch: HashMap<String, StatusWrite> = self
            .status
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (workflow_uuid, write) in status_batch {
            match self
                .system_db
                .write_terminal_status(
                    &workflow_uuid,
                    write.status,
                    write.output.as_deref(),
                    write.error.as_deref(),
                )
                .await
            {
                Ok(()) => {
                    self.status.remove(&workflow_uuid);
                }
                Err(err) => {
                    error!(%workflow_uuid, %err, "failed to flush workflow status");
                }
            }
        }

        let inputs_batch: HashMap<String, String> = self
            .inputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (workflow_uuid, inputs) in inputs_batch {
            match self.system_db.insert_workflow_inputs(&workflow_uuid, &inputs).await {
                Ok(true) => {
                    self.inputs.remove(&workflow_uuid);
                }
                Ok(false) => {
                    debug!(%workflow_uuid, "dropped buffered inputs: no workflow_status row");
                    self.inputs.remove(&workflow_uuid);
                }
                Err(err) => {
                    error!(%workflow_uuid, %err, "failed to flush workflow inputs");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_db::InMemorySystemDatabase;

    #[tokio::test]
    async fn flush_writes_status_before_inputs() {
        let system_db = Arc::new(InMemorySystemDatabase::new());
        let buffers = BufferManager::spawn(system_db.clone(), Duration::from_secs(3600));

        system_db
            .insert_or_recover_workflow_status(&crate::system_db::NewWorkflowStatus {
                workflow_uuid: "wf-1".into(),
                name: "demo".into(),
                executor_id: None,
                application_version: None,
                application_id: None,
                class_name: None,
                config_name: None,
                queue_name: None,
                authenticated_user: None,
                assumed_role: None,
                authenticated_roles: None,
                request: None,
            })
            .await
            .unwrap();

        buffers.enqueue_status("wf-1".into(), WorkflowStatus::Success, Some("\"done\"".into()), None);
        buffers.enqueue_inputs("wf-1".into(), "[]".into());
        buffers.enqueue_inputs("wf-missing".into(), "[]".into());

        buffers.wait_for_buffer_flush().await;

        let row = system_db.get_workflow_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Success);
        assert_eq!(system_db.get_workflow_inputs("wf-1").await.unwrap().as_deref(), Some("[]"));
        assert_eq!(system_db.get_workflow_inputs("wf-missing").await.unwrap(), None);
    }
}

//! Name-keyed workflow registry, consulted only by replay paths
//! (`execute_workflow_id`, `recover_pending_workflows`) that have nothing
//! but a persisted `(name, encoded_input)` pair to work from — the
//! original typed closure the caller passed to `start_workflow` is long
//! gone by the time a crash recovers it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DbosError;
use crate::serialize::{decode, encode};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ErasedWorkflowFn = std::sync::Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, DbosError>> + Send + Sync>;

/// Maps a workflow's registered name to a type-erased entry point that
/// decodes its input, runs it, and re-encodes its output.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: Mutex<HashMap<String, ErasedWorkflowFn>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`. Calling [`WorkflowExecutor::start_workflow`]
    /// does not require registration — only replay does, so a workflow
    /// invoked exactly once and never recovered need not be registered.
    pub fn register<F, Fut, In, Out>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        let erased: ErasedWorkflowFn = std::sync::Arc::new(move |payload: String| {
            let f = f.clone();
            Box::pin(async move {
                let input: In = decode(&payload)?;
                let output = f(input).await?;
                encode(&output)
            })
        });
        self.workflows.lock().insert(name.into(), erased);
    }

    pub fn lookup(&self, name: &str) -> Option<ErasedWorkflowFn> {
        self.workflows.lock().get(name).cloned()
    }
}

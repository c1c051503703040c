//! The workflow executor: dispatch, transaction, and step algorithms
//! (spec.md §4.2), plus signalling and durable sleep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::app_db::{ApplicationDatabase, IsolationLevel, SqlSession, TransactionOutputInsert};
use crate::buffers::BufferManager;
use crate::config::DbosConfig;
use crate::context::{self, ExecutionContext};
use crate::error::DbosError;
use crate::handle::WorkflowHandle;
use crate::registry::{BoxFuture, WorkflowRegistry};
use crate::retry::RetryPolicy;
use crate::serialize::{self, decode, encode, EncodedError};
use crate::system_db::{NewOperationOutput, NewWorkflowStatus, SystemDatabase, WorkflowStatus};

/// Dispatches workflows, transactions, and steps against a `SystemDatabase`
/// + `ApplicationDatabase` pair, enforcing OAOO (spec.md §4.2). Cheap to
/// clone: every field is an `Arc`, so closures that need a handle to the
/// executor (the temp-workflow wrapping paths below) just clone it.
pub struct WorkflowExecutor<S, A> {
    system_db: Arc<S>,
    app_db: Arc<A>,
    buffers: Arc<BufferManager<S>>,
    registry: Arc<WorkflowRegistry>,
    executor_id: String,
    application_id: Option<String>,
    application_version: Option<String>,
}

impl<S, A> Clone for WorkflowExecutor<S, A> {
    fn clone(&self) -> Self {
        Self {
            system_db: self.system_db.clone(),
            app_db: self.app_db.clone(),
            buffers: self.buffers.clone(),
            registry: self.registry.clone(),
            executor_id: self.executor_id.clone(),
            application_id: self.application_id.clone(),
            application_version: self.application_version.clone(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "workflow body panicked".to_string()
    }
}

fn result_from_operation_output(
    output: Option<String>,
    error: Option<String>,
) -> Result<String, DbosError> {
    match error {
        Some(enc) => Err(EncodedError::decode(&enc)?.into_dbos_error()),
        None => output.ok_or_else(|| DbosError::Unsupported("checkpoint row has neither output nor error".into())),
    }
}

impl<S: SystemDatabase, A: ApplicationDatabase> WorkflowExecutor<S, A> {
    pub fn new(
        system_db: Arc<S>,
        app_db: Arc<A>,
        buffers: Arc<BufferManager<S>>,
        registry: Arc<WorkflowRegistry>,
        config: &DbosConfig,
    ) -> Self {
        Self {
            system_db,
            app_db,
            buffers,
            registry,
            executor_id: config.executor_id.clone(),
            application_id: config.application_id.clone(),
            application_version: config.application_version.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Register `f` under `name` so `execute_workflow_id`/recovery can
    /// replay it from persisted inputs alone.
    pub fn register_workflow<F, Fut, In, Out>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
    {
        self.registry.register(name, f);
    }

    // ---- dispatch (spec.md §4.2 "Workflow dispatch algorithm") ----

    #[instrument(skip(self, body))]
    async fn dispatch_core<Body, Fut>(
        &self,
        name: &str,
        encoded_input: String,
        queue_name: Option<String>,
        body: Body,
    ) -> Result<String, DbosError>
    where
        Body: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, DbosError>> + Send + 'static,
    {
        let ctx = context::current().expect("dispatch_core runs inside context::scope");

        let new_status = NewWorkflowStatus {
            workflow_uuid: ctx.workflow_id.clone(),
            name: name.to_string(),
            executor_id: Some(self.executor_id.clone()),
            application_version: self.application_version.clone(),
            application_id: self.application_id.clone(),
            class_name: None,
            config_name: None,
            queue_name: queue_name.clone(),
            authenticated_user: ctx.authenticated_user.clone(),
            assumed_role: ctx.assumed_role.clone(),
            authenticated_roles: (!ctx.authenticated_roles.is_empty())
                .then(|| ctx.authenticated_roles.join(",")),
            request: ctx.request.clone(),
        };
        let row = self.system_db.insert_or_recover_workflow_status(&new_status).await?;
        debug!(
            workflow_id = %ctx.workflow_id,
            recovery_attempts = row.recovery_attempts,
            status = row.status.as_str(),
            "dispatched workflow"
        );

        if let Some(queue_name) = &queue_name {
            self.system_db.enqueue(&ctx.workflow_id, queue_name).await?;
        }

        if row.status.is_terminal() {
            debug!(workflow_id = %ctx.workflow_id, "replaying terminal workflow without re-executing body");
            return result_from_operation_output(row.output, row.error);
        }

        self.buffers.enqueue_inputs(ctx.workflow_id.clone(), encoded_input);

        if queue_name.is_some() {
            self.system_db.mark_queue_started(&ctx.workflow_id).await?;
        }

        let outcome = std::panic::AssertUnwindSafe(body()).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(DbosError::user(panic_message(&*payload))),
        };

        match &result {
            Ok(encoded_output) => {
                self.buffers.enqueue_status(
                    ctx.workflow_id.clone(),
                    WorkflowStatus::Success,
                    Some(encoded_output.clone()),
                    None,
                );
                debug!(workflow_id = %ctx.workflow_id, "workflow completed");
            }
            Err(err) => {
                match EncodedError::from(err).encode() {
                    Ok(encoded_err) => {
                        self.buffers.enqueue_status(
                            ctx.workflow_id.clone(),
                            WorkflowStatus::Error,
                            None,
                            Some(encoded_err),
                        );
                    }
                    Err(encode_err) => {
                        warn!(workflow_id = %ctx.workflow_id, error = %encode_err, "failed to encode workflow error for checkpoint");
                    }
                }
                warn!(workflow_id = %ctx.workflow_id, error = %err, "workflow failed");
            }
        }

        if queue_name.is_some() {
            self.system_db.mark_queue_completed(&ctx.workflow_id).await?;
        }

        result
    }

    fn next_workflow_id(&self, parent: Option<&ExecutionContext>) -> String {
        context::take_workflow_id_sentinel()
            .or_else(|| parent.map(|p| p.default_child_workflow_id()))
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Dispatch a freshly-invoked workflow body (spec.md §4.2
    /// `start_workflow`). Returns a handle the caller can poll or block
    /// on; the workflow runs on its own `tokio` task.
    pub async fn start_workflow<F, Fut, In, Out>(
        &self,
        name: &str,
        input: In,
        f: F,
    ) -> Result<WorkflowHandle<S, Out>, DbosError>
    where
        F: FnOnce(In) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        In: Serialize + Send + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        let parent = context::current();
        let workflow_id = self.next_workflow_id(parent.as_ref());
        let parent_id = parent.as_ref().map(|p| p.workflow_id.clone());
        let queue_name = context::take_queue_name_sentinel();
        let encoded_input = encode(&input)?;
        let name = name.to_string();
        let exec = self.clone();
        let task_workflow_id = workflow_id.clone();

        let join = tokio::spawn(context::scope(async move {
            let ctx = ExecutionContext::new(task_workflow_id, parent_id);
            let _guard = context::enter(ctx);
            exec.dispatch_core(&name, encoded_input, queue_name, move || {
                let fut: BoxFuture<'static, Result<String, DbosError>> = Box::pin(async move {
                    let output = f(input).await?;
                    encode(&output)
                });
                fut
            })
            .await
        }));

        Ok(WorkflowHandle::local(workflow_id, self.system_db.clone(), join))
    }

    /// `invoke_workflow`: blocking variant of `start_workflow`.
    pub async fn invoke_workflow<F, Fut, In, Out>(&self, name: &str, input: In, f: F) -> Result<Out, DbosError>
    where
        F: FnOnce(In) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        In: Serialize + Send + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        self.start_workflow(name, input, f).await?.get_result().await
    }

    pub async fn retrieve_workflow<T: DeserializeOwned>(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowHandle<S, T>, DbosError> {
        self.system_db
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| DbosError::NonExistentWorkflow(workflow_id.to_string()))?;
        Ok(WorkflowHandle::remote(workflow_id.to_string(), self.system_db.clone()))
    }

    /// Re-run a known workflow id through the OAOO path, replaying its
    /// registered body from persisted inputs (spec.md §4.2
    /// `execute_workflow_id`).
    pub async fn execute_workflow_id<Out>(&self, workflow_id: &str) -> Result<WorkflowHandle<S, Out>, DbosError>
    where
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        let row = self
            .system_db
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| DbosError::NonExistentWorkflow(workflow_id.to_string()))?;
        let encoded_input = self
            .system_db
            .get_workflow_inputs(workflow_id)
            .await?
            .unwrap_or_else(|| "null".to_string());
        let erased = self.registry.lookup(&row.name).ok_or_else(|| {
            DbosError::Unsupported(format!("workflow '{}' is not registered for replay", row.name))
        })?;

        let exec = self.clone();
        let name = row.name.clone();
        let queue_name = row.queue_name.clone();
        let task_workflow_id = workflow_id.to_string();
        let encoded_for_buffer = encoded_input.clone();

        let join = tokio::spawn(context::scope(async move {
            let ctx = ExecutionContext::new(task_workflow_id, None);
            let _guard = context::enter(ctx);
            exec.dispatch_core(&name, encoded_for_buffer, queue_name, move || erased(encoded_input))
                .await
        }));

        Ok(WorkflowHandle::local(workflow_id.to_string(), self.system_db.clone(), join))
    }

    /// Re-dispatch every `PENDING` workflow matching `executor_ids` (`None`
    /// means "all"), per spec.md §4.3. Temp workflows are excluded —
    /// recovering them would re-run a one-shot transaction/step a second
    /// time, which is not what a temp wrapper's caller asked for.
    pub async fn recover_pending_workflows(
        &self,
        executor_ids: Option<&[String]>,
    ) -> Result<Vec<WorkflowHandle<S, serde_json::Value>>, DbosError> {
        let pending = self.system_db.list_pending(executor_ids).await?;
        let mut handles = Vec::with_capacity(pending.len());
        for row in pending {
            if row.is_temp() {
                debug!(workflow_id = %row.workflow_uuid, "skipping temp workflow during recovery");
                continue;
            }
            match self.execute_workflow_id::<serde_json::Value>(&row.workflow_uuid).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(workflow_id = %row.workflow_uuid, error = %err, "failed to re-dispatch pending workflow");
                }
            }
        }
        Ok(handles)
    }

    // ---- transactions (spec.md §4.2 "Transaction algorithm") ----

    async fn invoke_transaction_in_context<F, Fut, In, Out>(
        &self,
        ctx: &ExecutionContext,
        input: In,
        isolation: IsolationLevel,
        f: F,
    ) -> Result<Out, DbosError>
    where
        F: FnOnce(In, &mut SqlSession) -> Fut + Send,
        Fut: Future<Output = Result<Out, DbosError>> + Send,
        Out: Serialize + DeserializeOwned,
    {
        let function_id = ctx.next_function_id();
        let mut session = self.app_db.begin(isolation).await?;

        if let Some(recorded) = self
            .app_db
            .check_transaction_execution(&mut session, &ctx.workflow_id, function_id)
            .await?
        {
            self.app_db.commit(session).await?;
            let encoded = result_from_operation_output(recorded.output, recorded.error)?;
            return decode(&encoded);
        }

        let outcome = std::panic::AssertUnwindSafe(f(input, &mut session)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(DbosError::user(panic_message(&*payload))),
        };

        match result {
            Ok(value) => {
                let encoded = encode(&value)?;
                let insert = TransactionOutputInsert {
                    workflow_uuid: ctx.workflow_id.clone(),
                    function_id,
                    output: Some(encoded),
                    error: None,
                    txn_snapshot: None,
                    executor_id: Some(self.executor_id.clone()),
                };
                match self.app_db.record_transaction_output(&mut session, &insert).await {
                    Ok(()) => {
                        self.app_db.commit(session).await?;
                        Ok(value)
                    }
                    Err(DbosError::WorkflowConflictID(id)) => {
                        let _ = self.app_db.rollback(session).await;
                        let mut retry_session = self.app_db.begin(isolation).await?;
                        let recorded = self
                            .app_db
                            .check_transaction_execution(&mut retry_session, &ctx.workflow_id, function_id)
                            .await?
                            .ok_or(DbosError::WorkflowConflictID(id))?;
                        self.app_db.commit(retry_session).await?;
                        let encoded = result_from_operation_output(recorded.output, recorded.error)?;
                        decode(&encoded)
                    }
                    Err(other) => {
                        let _ = self.app_db.rollback(session).await;
                        Err(other)
                    }
                }
            }
            Err(err) => {
                let _ = self.app_db.rollback(session).await;
                let encoded_err = EncodedError::from(&err).encode()?;
                let insert = TransactionOutputInsert {
                    workflow_uuid: ctx.workflow_id.clone(),
                    function_id,
                    output: None,
                    error: Some(encoded_err),
                    txn_snapshot: None,
                    executor_id: Some(self.executor_id.clone()),
                };
                self.app_db.record_transaction_error(&insert).await?;
                Err(err)
            }
        }
    }

    /// `invoke_transaction`: runs `f` inside one App-DB transaction at
    /// `isolation`, checkpointing atomically with its effects. Called
    /// outside an enclosing workflow, it dispatches itself as a
    /// single-shot `<temp>:transaction:{name}` workflow first (spec.md
    /// §4.5 "temp workflow").
    pub async fn invoke_transaction<F, Fut, In, Out>(
        &self,
        name: &str,
        input: In,
        isolation: IsolationLevel,
        f: F,
    ) -> Result<Out, DbosError>
    where
        F: FnOnce(In, &mut SqlSession) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        In: Serialize + Send + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        match context::current() {
            Some(ctx) if ctx.is_within_workflow => {
                self.invoke_transaction_in_context(&ctx, input, isolation, f).await
            }
            _ => {
                let temp_name = format!("<temp>:transaction:{name}");
                let exec = self.clone();
                self.start_workflow(&temp_name, input, move |input: In| async move {
                    let ctx = context::current().expect("dispatch_core establishes a context frame");
                    exec.invoke_transaction_in_context(&ctx, input, isolation, f).await
                })
                .await?
                .get_result()
                .await
            }
        }
    }

    // ---- steps (spec.md §4.2 "Step algorithm") ----

    async fn invoke_step_in_context<F, Fut, In, Out>(
        &self,
        ctx: &ExecutionContext,
        input: In,
        retry: Option<RetryPolicy>,
        f: F,
    ) -> Result<Out, DbosError>
    where
        F: Fn(In) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Out, DbosError>> + Send,
        In: Clone,
        Out: Serialize + DeserializeOwned,
    {
        let function_id = ctx.next_function_id();
        if let Some(existing) = self.system_db.get_operation_output(&ctx.workflow_id, function_id).await? {
            let encoded = result_from_operation_output(existing.output, existing.error)?;
            return decode(&encoded);
        }

        let policy = retry.unwrap_or_else(RetryPolicy::no_retry);
        let mut attempt = 1u32;
        let result = loop {
            let delay = policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = std::panic::AssertUnwindSafe(f(input.clone())).catch_unwind().await;
            let attempt_result = match outcome {
                Ok(result) => result,
                Err(payload) => Err(DbosError::user(panic_message(&*payload))),
            };
            match attempt_result {
                Ok(value) => break Ok(value),
                Err(_) if policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    continue;
                }
                Err(err) => {
                    break Err(DbosError::MaxStepRetriesExceeded {
                        function_id,
                        source: Box::new(err),
                    })
                }
            }
        };

        match &result {
            Ok(value) => {
                let encoded = encode(value)?;
                self.system_db
                    .insert_operation_output(&NewOperationOutput {
                        workflow_uuid: ctx.workflow_id.clone(),
                        function_id,
                        output: Some(encoded),
                        error: None,
                    })
                    .await?;
            }
            Err(err) => {
                let encoded_err = EncodedError::from(err).encode()?;
                self.system_db
                    .insert_operation_output(&NewOperationOutput {
                        workflow_uuid: ctx.workflow_id.clone(),
                        function_id,
                        output: None,
                        error: Some(encoded_err),
                    })
                    .await?;
            }
        }

        result
    }

    /// `invoke_step`: runs `f`, checkpointing the result in the System DB;
    /// retries with backoff when `retry` is set.
    pub async fn invoke_step<F, Fut, In, Out>(
        &self,
        name: &str,
        input: In,
        retry: Option<RetryPolicy>,
        f: F,
    ) -> Result<Out, DbosError>
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send,
        In: Clone + Serialize + Send + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        match context::current() {
            Some(ctx) if ctx.is_within_workflow => self.invoke_step_in_context(&ctx, input, retry, f).await,
            _ => {
                let temp_name = format!("<temp>:step:{name}");
                let exec = self.clone();
                self.start_workflow(&temp_name, input, move |input: In| async move {
                    let ctx = context::current().expect("dispatch_core establishes a context frame");
                    exec.invoke_step_in_context(&ctx, input, retry, f).await
                })
                .await?
                .get_result()
                .await
            }
        }
    }

    // ---- signalling & durable sleep ----

    /// Run `op` with whatever `ExecutionContext` is live, wrapping it in a
    /// single-shot `<temp>:{kind}` workflow when called outside an
    /// enclosing workflow (spec.md §4.5).
    async fn in_workflow_or_temp<F, Fut, Out>(&self, kind: &str, op: F) -> Result<Out, DbosError>
    where
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Out, DbosError>> + Send + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        match context::current() {
            Some(ctx) if ctx.is_within_workflow => op(ctx).await,
            _ => {
                let temp_name = format!("<temp>:{kind}");
                self.start_workflow(&temp_name, (), move |_: ()| async move {
                    let ctx = context::current().expect("dispatch_core establishes a context frame");
                    op(ctx).await
                })
                .await?
                .get_result()
                .await
            }
        }
    }

    pub async fn send<M: Serialize + Send + 'static>(
        &self,
        destination_id: &str,
        message: M,
        topic: Option<&str>,
    ) -> Result<(), DbosError> {
        let destination_id = destination_id.to_string();
        let topic = topic.map(str::to_string);
        let encoded = encode(&message)?;
        let system_db = self.system_db.clone();
        self.in_workflow_or_temp("send", move |ctx| async move {
            let function_id = ctx.next_function_id();
            if system_db.get_operation_output(&ctx.workflow_id, function_id).await?.is_some() {
                return Ok(());
            }
            system_db.insert_notification(&destination_id, topic.as_deref(), &encoded).await?;
            system_db
                .insert_operation_output(&NewOperationOutput {
                    workflow_uuid: ctx.workflow_id.clone(),
                    function_id,
                    output: Some("null".to_string()),
                    error: None,
                })
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn recv<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<T>, DbosError> {
        let topic = topic.map(str::to_string);
        let system_db = self.system_db.clone();
        self.in_workflow_or_temp("recv", move |ctx| async move {
            let function_id = ctx.next_function_id();
            if let Some(existing) = system_db.get_operation_output(&ctx.workflow_id, function_id).await? {
                return decode_optional(existing.output);
            }

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(message) = system_db.consume_notification(&ctx.workflow_id, topic.as_deref()).await? {
                    system_db
                        .insert_operation_output(&NewOperationOutput {
                            workflow_uuid: ctx.workflow_id.clone(),
                            function_id,
                            output: Some(message.clone()),
                            error: None,
                        })
                        .await?;
                    return Ok(Some(decode(&message)?));
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    system_db
                        .insert_operation_output(&NewOperationOutput {
                            workflow_uuid: ctx.workflow_id.clone(),
                            function_id,
                            output: Some("null".to_string()),
                            error: None,
                        })
                        .await?;
                    return Ok(None);
                }
                system_db.await_notification(&ctx.workflow_id, deadline - now).await;
            }
        })
        .await
    }

    pub async fn set_event<V: Serialize + Send + 'static>(&self, key: &str, value: V) -> Result<(), DbosError> {
        let key = key.to_string();
        let encoded = encode(&value)?;
        let system_db = self.system_db.clone();
        self.in_workflow_or_temp("set_event", move |ctx| async move {
            let function_id = ctx.next_function_id();
            if system_db.get_operation_output(&ctx.workflow_id, function_id).await?.is_some() {
                return Ok(());
            }
            system_db.upsert_workflow_event(&ctx.workflow_id, &key, &encoded).await?;
            system_db
                .insert_operation_output(&NewOperationOutput {
                    workflow_uuid: ctx.workflow_id.clone(),
                    function_id,
                    output: Some("null".to_string()),
                    error: None,
                })
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_event<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<T>, DbosError> {
        let target_workflow_id = target_workflow_id.to_string();
        let key = key.to_string();
        let system_db = self.system_db.clone();
        self.in_workflow_or_temp("get_event", move |ctx| async move {
            let function_id = ctx.next_function_id();
            if let Some(existing) = system_db.get_operation_output(&ctx.workflow_id, function_id).await? {
                return decode_optional(existing.output);
            }

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(value) = system_db.get_workflow_event(&target_workflow_id, &key).await? {
                    system_db
                        .insert_operation_output(&NewOperationOutput {
                            workflow_uuid: ctx.workflow_id.clone(),
                            function_id,
                            output: Some(value.clone()),
                            error: None,
                        })
                        .await?;
                    return Ok(Some(decode(&value)?));
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    system_db
                        .insert_operation_output(&NewOperationOutput {
                            workflow_uuid: ctx.workflow_id.clone(),
                            function_id,
                            output: Some("null".to_string()),
                            error: None,
                        })
                        .await?;
                    return Ok(None);
                }
                system_db.await_event(&target_workflow_id, deadline - now).await;
            }
        })
        .await
    }

    /// Durable sleep: stores the wake time on first execution, so a
    /// crashed sleeper resumes counting down from where it left off
    /// rather than restarting its clock (spec.md §4.2).
    pub async fn sleep(&self, duration: Duration) -> Result<String, DbosError> {
        let system_db = self.system_db.clone();
        self.in_workflow_or_temp("sleep", move |ctx| async move {
            let function_id = ctx.next_function_id();
            let wake_at_ms = match system_db.get_operation_output(&ctx.workflow_id, function_id).await? {
                Some(existing) => {
                    let encoded = existing
                        .output
                        .ok_or_else(|| DbosError::Unsupported("durable sleep checkpoint missing wake time".into()))?;
                    decode::<i64>(&encoded)?
                }
                None => {
                    let wake_at = system_db.now_epoch_millis() + duration.as_millis() as i64;
                    let encoded = encode(&wake_at)?;
                    system_db
                        .insert_operation_output(&NewOperationOutput {
                            workflow_uuid: ctx.workflow_id.clone(),
                            function_id,
                            output: Some(encoded),
                            error: None,
                        })
                        .await?;
                    wake_at
                }
            };

            let remaining_ms = wake_at_ms - system_db.now_epoch_millis();
            if remaining_ms > 0 {
                tokio::time::sleep(Duration::from_millis(remaining_ms as u64)).await;
            }
            Ok(ctx.workflow_id.clone())
        })
        .await
    }
}

fn decode_optional<T: DeserializeOwned>(output: Option<String>) -> Result<Option<T>, DbosError> {
    match output {
        Some(s) if s != "null" => Ok(Some(serialize::decode(&s)?)),
        _ => Ok(None),
    }
}

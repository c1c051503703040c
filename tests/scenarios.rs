//! End-to-end scenario tests against the in-memory system/application
//! databases: OAOO for workflows/transactions/steps, crash recovery, temp
//! workflow wrapping, step retries, and durable sleep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use workflow_runtime::app_db::{InMemoryApplicationDatabase, IsolationLevel, SqlSession};
use workflow_runtime::config::DbosConfig;
use workflow_runtime::context::{self, SetQueueName, SetWorkflowId};
use workflow_runtime::error::DbosError;
use workflow_runtime::executor::WorkflowExecutor;
use workflow_runtime::retry::RetryPolicy;
use workflow_runtime::system_db::{InMemorySystemDatabase, NewWorkflowStatus, SystemDatabase};

type Executor = WorkflowExecutor<InMemorySystemDatabase, InMemoryApplicationDatabase>;

fn test_executor() -> (Executor, Arc<InMemorySystemDatabase>) {
    let system_db = Arc::new(InMemorySystemDatabase::new());
    let app_db = Arc::new(InMemoryApplicationDatabase::new());
    let buffers = workflow_runtime::buffers::BufferManager::spawn(system_db.clone(), Duration::from_millis(10));
    let registry = Arc::new(workflow_runtime::registry::WorkflowRegistry::new());
    let config = DbosConfig::new("memory://");
    let executor = WorkflowExecutor::new(system_db.clone(), app_db, buffers, registry, &config);
    (executor, system_db)
}

/// `wf(var, var2) = tx(var2) + step(var)` where `tx(s) = s + "1"`,
/// `step(s) = s` (spec.md §8 scenario 1).
fn make_wf_body(
    exec: Executor,
    tx_counter: Arc<AtomicUsize>,
    step_counter: Arc<AtomicUsize>,
) -> impl Fn((String, String)) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, DbosError>> + Send>>
       + Clone
       + Send
       + Sync
       + 'static {
    move |(var, var2): (String, String)| -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, DbosError>> + Send>> {
        let exec = exec.clone();
        let tx_counter = tx_counter.clone();
        let step_counter = step_counter.clone();
        Box::pin(async move {
            let tx_counter = tx_counter.clone();
            let tx_out = exec
                .invoke_transaction(
                    "tx",
                    var2,
                    IsolationLevel::Serializable,
                    move |s: String, _session: &mut SqlSession| {
                        let tx_counter = tx_counter.clone();
                        async move {
                            tx_counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<String, DbosError>(format!("{s}1"))
                        }
                    },
                )
                .await?;

            let step_out = exec
                .invoke_step("step", var, None, move |s: String| {
                    let step_counter = step_counter.clone();
                    async move {
                        step_counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<String, DbosError>(s)
                    }
                })
                .await?;

            Ok(format!("{tx_out}{step_out}"))
        })
    }
}

#[tokio::test]
async fn scenario_1_oaoo_value() {
    let (executor, _system_db) = test_executor();
    let tx_counter = Arc::new(AtomicUsize::new(0));
    let step_counter = Arc::new(AtomicUsize::new(0));
    let wf_body = make_wf_body(executor.clone(), tx_counter.clone(), step_counter.clone());

    let mut wf_counter = 0;

    let first = executor
        .start_workflow("wf", ("bob".to_string(), "bob".to_string()), wf_body.clone())
        .await
        .unwrap()
        .get_result()
        .await
        .unwrap();
    wf_counter += 1;
    assert_eq!(first, "bob1bob");

    let u = "scenario-1-fixed-id".to_string();
    let mut last = String::new();
    for _ in 0..2 {
        let wf_body = wf_body.clone();
        last = context::scope(async {
            let _sentinel = SetWorkflowId::new(u.clone());
            executor
                .start_workflow("wf", ("alice".to_string(), "alice".to_string()), wf_body)
                .await
        })
        .await
        .unwrap()
        .get_result()
        .await
        .unwrap();
        wf_counter += 1;
    }
    assert_eq!(last, "alice1alice");
    assert_eq!(tx_counter.load(Ordering::SeqCst), 2);
    assert_eq!(step_counter.load(Ordering::SeqCst), 2);
    assert_eq!(wf_counter, 3);

    let replayed = executor
        .execute_workflow_id::<String>(&u)
        .await
        .unwrap()
        .get_result()
        .await
        .unwrap();
    wf_counter += 1;
    assert_eq!(replayed, "alice1alice");
    assert_eq!(wf_counter, 4);
    // Replay found a terminal row and never re-entered the body.
    assert_eq!(tx_counter.load(Ordering::SeqCst), 2);
    assert_eq!(step_counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_2_oaoo_error() {
    let (executor, _system_db) = test_executor();
    let tx_counter = Arc::new(AtomicUsize::new(0));
    let step_counter = Arc::new(AtomicUsize::new(0));

    let exec = executor.clone();
    let tx_counter_for_body = tx_counter.clone();
    let step_counter_for_body = step_counter.clone();
    let failing_body = move |_input: ()| -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, DbosError>> + Send>> {
        let exec = exec.clone();
        let tx_counter = tx_counter_for_body.clone();
        let step_counter = step_counter_for_body.clone();
        Box::pin(async move {
            exec.invoke_transaction(
                "tx",
                (),
                IsolationLevel::Serializable,
                move |_: (), _session: &mut SqlSession| {
                    let tx_counter = tx_counter.clone();
                    async move {
                        tx_counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), DbosError>(())
                    }
                },
            )
            .await?;
            exec.invoke_step("step", (), None, move |_: ()| {
                let step_counter = step_counter.clone();
                async move {
                    step_counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), DbosError>(())
                }
            })
            .await?;
            Err::<String, DbosError>(DbosError::user("test error"))
        })
    };

    let u = "scenario-2-fixed-id".to_string();
    for _ in 0..2 {
        let body = failing_body.clone();
        let err = context::scope(async {
            let _sentinel = SetWorkflowId::new(u.clone());
            executor.start_workflow("failing-wf", (), body).await
        })
        .await
        .unwrap()
        .get_result()
        .await
        .unwrap_err();
        match err {
            DbosError::User { message, .. } => assert_eq!(message, "test error"),
            other => panic!("expected a user error, got {other:?}"),
        }
    }

    // The second call replayed the cached ERROR row; the body never re-ran.
    assert_eq!(tx_counter.load(Ordering::SeqCst), 1);
    assert_eq!(step_counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_3_recovery() {
    let (executor, system_db) = test_executor();
    let tx_counter = Arc::new(AtomicUsize::new(0));
    let step_counter = Arc::new(AtomicUsize::new(0));
    let wf_body = make_wf_body(executor.clone(), tx_counter.clone(), step_counter.clone());
    executor.register_workflow("wf", wf_body);

    let workflow_id = "scenario-3-fixed-id".to_string();
    let encoded_input = workflow_runtime::serialize::encode(&("bob".to_string(), "bob".to_string())).unwrap();

    // Simulate a worker that inserted its PENDING row and inputs, then
    // crashed before running the body.
    system_db
        .insert_or_recover_workflow_status(&NewWorkflowStatus {
            workflow_uuid: workflow_id.clone(),
            name: "wf".to_string(),
            executor_id: Some("local".to_string()),
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
    system_db
        .insert_workflow_inputs(&workflow_id, &encoded_input)
        .await
        .unwrap();

    let handles = executor.recover_pending_workflows(None).await.unwrap();
    assert_eq!(handles.len(), 1);
    let result: String = handles.into_iter().next().unwrap().get_result().await.unwrap();
    assert_eq!(result, "bob1bob");
    assert_eq!(tx_counter.load(Ordering::SeqCst), 1);
    assert_eq!(step_counter.load(Ordering::SeqCst), 1);

    let row = system_db.get_workflow_status(&workflow_id).await.unwrap().unwrap();
    assert_eq!(row.recovery_attempts, 2);
}

#[tokio::test]
async fn scenario_4_temp_workflow_listing() {
    let (executor, system_db) = test_executor();
    let start = system_db.now_epoch_millis();

    let tx_out = executor
        .invoke_transaction(
            "standalone-tx",
            "var2".to_string(),
            IsolationLevel::Serializable,
            |s: String, _session: &mut SqlSession| async move { Ok::<String, DbosError>(format!("{s}1")) },
        )
        .await
        .unwrap();
    assert_eq!(tx_out, "var21");

    let step_out = executor
        .invoke_step("standalone-step", "var".to_string(), None, |s: String| async move {
            Ok::<String, DbosError>(s)
        })
        .await
        .unwrap();
    assert_eq!(step_out, "var");

    let rows = system_db.list_since(start).await.unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(row.is_temp(), "expected a temp workflow name, got {}", row.name);
    }
}

#[tokio::test]
async fn scenario_5_step_retries_exhausted() {
    let (executor, _system_db) = test_executor();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_body = attempts.clone();

    let policy = RetryPolicy::exponential()
        .with_max_attempts(3)
        .with_initial_interval(Duration::from_millis(1))
        .with_max_interval(Duration::from_millis(5))
        .with_jitter(0.0);

    let err = executor
        .invoke_step("always-fails", (), Some(policy), move |_: ()| {
            let attempts = attempts_for_body.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), DbosError>(DbosError::user("boom"))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(err, DbosError::MaxStepRetriesExceeded { .. }));
}

#[tokio::test]
async fn scenario_6_durable_sleep_oaoo() {
    let (executor, _system_db) = test_executor();
    let sleep_duration = Duration::from_millis(200);

    let u = "scenario-6-fixed-id".to_string();
    let started = Instant::now();
    context::scope(async {
        let _sentinel = SetWorkflowId::new(u.clone());
        executor.sleep(sleep_duration).await
    })
    .await
    .unwrap();
    assert!(started.elapsed() >= sleep_duration - Duration::from_millis(20));

    // Re-running under the same id finds its recorded wake time already
    // passed and returns immediately instead of sleeping again.
    let resumed = Instant::now();
    context::scope(async {
        let _sentinel = SetWorkflowId::new(u.clone());
        executor.sleep(sleep_duration).await
    })
    .await
    .unwrap();
    assert!(resumed.elapsed() < Duration::from_millis(50));
}

fn child_body(
    input: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, DbosError>> + Send>> {
    Box::pin(async move { Ok(input) })
}

/// Two `start_workflow` calls from the same parent with no intervening
/// step/transaction must derive distinct default child ids — the parent's
/// function id has to be consumed at each derivation, not merely peeked.
#[tokio::test]
async fn sibling_children_get_distinct_default_ids() {
    let (executor, _system_db) = test_executor();
    let exec_for_parent = executor.clone();

    let parent_body = move |_: ()| -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(String, String), DbosError>> + Send>> {
        let exec = exec_for_parent.clone();
        Box::pin(async move {
            let first = exec
                .start_workflow("child", "first".to_string(), child_body)
                .await?
                .workflow_id()
                .to_string();
            let second = exec
                .start_workflow("child", "second".to_string(), child_body)
                .await?
                .workflow_id()
                .to_string();
            Ok((first, second))
        })
    };

    let (first_id, second_id) = executor
        .start_workflow("parent", (), parent_body)
        .await
        .unwrap()
        .get_result()
        .await
        .unwrap();

    assert_ne!(first_id, second_id);
}

/// A `start_workflow` call made under `SetQueueName` records the queue on
/// the workflow's status row, per spec.md §3's `workflow_queue` entity.
#[tokio::test]
async fn queued_start_workflow_records_queue_name() {
    let (executor, system_db) = test_executor();

    let handle = context::scope(async {
        let _queue = SetQueueName::new("reports");
        executor
            .start_workflow("wf", (), |_: ()| async move { Ok::<(), DbosError>(()) })
            .await
    })
    .await
    .unwrap();

    let workflow_id = handle.workflow_id().to_string();
    handle.get_result().await.unwrap();
    let row = system_db.get_workflow_status(&workflow_id).await.unwrap().unwrap();
    assert_eq!(row.queue_name.as_deref(), Some("reports"));
}

//! End-to-end scenarios driving the engine through its public API.

use async_trait::async_trait;
use llm_flow_core::prelude::*;
use llm_flow_core::{
    AsyncStateStore, InstanceStore, MemoryAsyncStateStore, MemoryInstanceStore,
    MemorySuspensionStore, SuspensionStore, WorkflowEngine,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

struct Stores {
    instances: Arc<MemoryInstanceStore>,
    async_states: Arc<MemoryAsyncStateStore>,
    suspensions: Arc<MemorySuspensionStore>,
}

fn stores() -> Stores {
    Stores {
        instances: Arc::new(MemoryInstanceStore::new()),
        async_states: Arc::new(MemoryAsyncStateStore::new()),
        suspensions: Arc::new(MemorySuspensionStore::new()),
    }
}

fn engine_with(stores: &Stores, config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::builder()
        .with_config(config)
        .with_instance_store(stores.instances.clone())
        .with_async_state_store(stores.async_states.clone())
        .with_suspension_store(stores.suspensions.clone())
        .build()
}

fn register_schemas(engine: &WorkflowEngine, names: &[&str]) {
    for name in names {
        engine.schemas().register_name(*name);
    }
}

async fn wait_until<F>(mut predicate: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    for _ in 0..400 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct CountingInterceptor {
    errors: AtomicU32,
    steps: AtomicU32,
}

#[async_trait]
impl ExecutionInterceptor for CountingInterceptor {
    async fn before_step(&self, _invocation: &StepInvocation) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_step_error(&self, _invocation: &StepInvocation, _error: &EngineError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

// Scenario: linear two-step run. A converts the start event, B finishes.
#[tokio::test]
async fn linear_workflow_completes_with_both_outputs() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "Foo", "Bar"]);

    let graph = WorkflowGraph::builder("lin", "1.0")
        .step(
            StepDescriptor::builder("a")
                .input("StartEvent")
                .output("Foo")
                .initial()
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Continue {
                        data: Payload::new("Foo", json!({"from": "a"})),
                    })
                })
                .build()
                .unwrap(),
        )
        .step(
            StepDescriptor::builder("b")
                .input("Foo")
                .output("Bar")
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Finish {
                        result: Payload::new("Bar", json!({"ok": true})),
                    })
                })
                .build()
                .unwrap(),
        );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("lin", Payload::empty("StartEvent"), Some("lin-1".to_string()))
        .await
        .unwrap();
    let result = handle.result().await.unwrap();
    assert_eq!(result.schema, "Bar");
    assert_eq!(result.data, json!({"ok": true}));

    let snapshot = engine.status("lin-1").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);

    let instance = stores.instances.get("lin-1").await.unwrap().unwrap();
    assert_eq!(instance.context.output("a").unwrap().schema, "Foo");
    assert_eq!(instance.context.output("b").unwrap().schema, "Bar");
}

// Scenario: branch resolution by runtime type among declared candidates.
#[tokio::test]
async fn branch_routes_by_payload_type() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "Pick", "Done"]);
    // Branch payloads are subtypes of the router's wrapped output.
    engine
        .schemas()
        .register(SchemaDescriptor::new("X").with_parent("Pick"));
    engine
        .schemas()
        .register(SchemaDescriptor::new("Y").with_parent("Pick"));

    let router = |which: &'static str| {
        move |_input: Payload, _ctx: StepContext| {
            let schema = which;
            async move {
                Ok(StepResult::Branch {
                    data: Payload::new(schema, json!({})),
                })
            }
        }
    };

    for (workflow_id, schema, expected_step) in
        [("branch-x", "X", "bx"), ("branch-y", "Y", "cy")]
    {
        let graph = WorkflowGraph::builder(workflow_id, "1.0")
            .step(
                StepDescriptor::builder("a")
                    .input("StartEvent")
                    .output("Pick")
                    .initial()
                    .branching()
                    .next("bx")
                    .next("cy")
                    .handle_fn(router(schema))
                    .build()
                    .unwrap(),
            )
            .step(
                StepDescriptor::builder("bx")
                    .input("X")
                    .output("Done")
                    .handle_fn(|_input, _ctx| async move {
                        Ok(StepResult::Finish {
                            result: Payload::new("Done", json!({"via": "bx"})),
                        })
                    })
                    .build()
                    .unwrap(),
            )
            .step(
                StepDescriptor::builder("cy")
                    .input("Y")
                    .output("Done")
                    .handle_fn(|_input, _ctx| async move {
                        Ok(StepResult::Finish {
                            result: Payload::new("Done", json!({"via": "cy"})),
                        })
                    })
                    .build()
                    .unwrap(),
            );
        engine.register_workflow(graph).unwrap();

        let handle = engine
            .execute(workflow_id, Payload::empty("StartEvent"), None)
            .await
            .unwrap();
        let result = handle.result().await.unwrap();
        assert_eq!(result.data, json!({"via": expected_step}));
    }
}

// Scenario: a branch payload no declared candidate accepts fails the run.
#[tokio::test]
async fn branch_without_matching_candidate_fails_no_next() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "Pick", "Z", "Done"]);
    engine
        .schemas()
        .register(SchemaDescriptor::new("X").with_parent("Pick"));

    let graph = WorkflowGraph::builder("branch-bad", "1.0")
        .step(
            StepDescriptor::builder("a")
                .input("StartEvent")
                .output("Pick")
                .initial()
                .branching()
                .next("bx")
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Branch {
                        data: Payload::new("Z", json!({})),
                    })
                })
                .build()
                .unwrap(),
        )
        .step(
            StepDescriptor::builder("bx")
                .input("X")
                .output("Done")
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Finish {
                        result: Payload::empty("Done"),
                    })
                })
                .build()
                .unwrap(),
        );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("branch-bad", Payload::empty("StartEvent"), Some("bb-1".to_string()))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoNext);

    let snapshot = engine.status("bb-1").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Failed);
    assert!(snapshot.last_error.unwrap().contains("no next step"));
}

// Scenario: suspend for user input, reject a mismatched resume, then
// resume with the expected type and finish.
#[tokio::test]
async fn suspend_then_resume_with_type_checking() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "UserName", "Prompt", "Greeting", "Wrong"]);

    let graph = WorkflowGraph::builder("conv", "1.0")
        .step(
            StepDescriptor::builder("ask")
                .input("StartEvent")
                .output("UserName")
                .initial()
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Suspend {
                        prompt: Payload::new("Prompt", json!({"text": "name?"})),
                        expected_input: "UserName".to_string(),
                        metadata: HashMap::new(),
                    })
                })
                .build()
                .unwrap(),
        )
        .step(
            StepDescriptor::builder("greet")
                .input("UserName")
                .output("Greeting")
                .handle_fn(|input, _ctx| async move {
                    let name = input.str_property("name").unwrap_or("stranger").to_string();
                    Ok(StepResult::Finish {
                        result: Payload::new("Greeting", json!({"text": format!("Hello, {}", name)})),
                    })
                })
                .build()
                .unwrap(),
        );
    engine.register_workflow(graph).unwrap();

    let mut handle = engine
        .execute("conv", Payload::empty("StartEvent"), Some("chat-7".to_string()))
        .await
        .unwrap();
    assert_eq!(handle.settled().await.unwrap(), InstanceStatus::Suspended);

    let snapshot = engine.status("chat-7").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Suspended);

    // The suspension record carries the prompt.
    let suspension = stores.suspensions.get("chat-7").await.unwrap().unwrap();
    assert_eq!(suspension.expected_input, "UserName");
    assert_eq!(suspension.prompt.str_property("text"), Some("name?"));

    // Wrong input type: rejected, no state change.
    let err = engine
        .resume("chat-7", Payload::new("Wrong", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(
        engine.status("chat-7").await.unwrap().status,
        InstanceStatus::Suspended
    );

    // Matching input resumes into the greeting step.
    let resumed = engine
        .resume("chat-7", Payload::new("UserName", json!({"name": "Ada"})))
        .await
        .unwrap();
    let result = resumed.result().await.unwrap();
    assert_eq!(result.data, json!({"text": "Hello, Ada"}));

    // Duplicate resume after success.
    let err = engine
        .resume("chat-7", Payload::new("UserName", json!({"name": "Ada"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSuspended);
}

// Async task used by the progress scenario: applies progress values fed by
// the test, then completes.
struct ScriptedTask {
    values: Mutex<mpsc::Receiver<u8>>,
    message_id: Mutex<Option<String>>,
}

#[async_trait]
impl AsyncTask for ScriptedTask {
    async fn run(
        &self,
        _args: HashMap<String, Value>,
        ctx: AsyncTaskContext,
    ) -> llm_flow_core::Result<StepResult> {
        *self.message_id.lock().await = Some(ctx.message_id.clone());
        let mut values = self.values.lock().await;
        while let Some(percent) = values.recv().await {
            ctx.progress
                .update(percent, format!("{}% done", percent))
                .await?;
        }
        Ok(StepResult::Finish {
            result: Payload::new("Report", json!({"summary": "all good"})),
        })
    }
}

// Scenario: async step with progress reporting observed through status().
#[tokio::test]
async fn async_step_reports_progress_then_completes() {
    let stores = stores();
    let (tx, rx) = mpsc::channel(4);
    let task = Arc::new(ScriptedTask {
        values: Mutex::new(rx),
        message_id: Mutex::new(None),
    });

    let engine = engine_with(&stores, EngineConfig::default());
    engine.register_task("t1", task.clone());
    register_schemas(&engine, &["StartEvent", "Status", "Report"]);

    let graph = WorkflowGraph::builder("async-wf", "1.0").step(
        StepDescriptor::builder("work")
            .input("StartEvent")
            .output("Report")
            .initial()
            .asynchronous()
            .handle_fn(|_input, _ctx| async move {
                Ok(StepResult::Async {
                    task_id: "t1".to_string(),
                    timeout_ms: 60_000,
                    args: HashMap::new(),
                    immediate: Payload::new("Status", json!({"text": "started"})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let mut handle = engine
        .execute("async-wf", Payload::empty("StartEvent"), Some("job-1".to_string()))
        .await
        .unwrap();
    assert_eq!(handle.settled().await.unwrap(), InstanceStatus::AwaitingAsync);

    // The immediate payload is observable as the step's output right away.
    let instance = stores.instances.get("job-1").await.unwrap().unwrap();
    assert_eq!(
        instance.context.output("work").unwrap().str_property("text"),
        Some("started")
    );

    for expected in [10u8, 40, 100] {
        tx.send(expected).await.unwrap();
        let engine = engine.clone();
        wait_until(move || {
            let engine = engine.clone();
            Box::pin(async move {
                let snapshot = engine.status("job-1").await.unwrap();
                snapshot.progress_percent == Some(expected)
                    || snapshot.status == InstanceStatus::Completed
            })
        })
        .await;
    }
    drop(tx);

    let result = handle.result().await.unwrap();
    assert_eq!(result.schema, "Report");
    assert_eq!(result.data, json!({"summary": "all good"}));
    assert_eq!(
        engine.status("job-1").await.unwrap().status,
        InstanceStatus::Completed
    );

    // Exactly one terminal async state row for the dispatch.
    let message_id = task.message_id.lock().await.clone().unwrap();
    let state = stores.async_states.get(&message_id).await.unwrap().unwrap();
    assert_eq!(state.status, AsyncTaskStatus::Completed);
    assert_eq!(state.progress_percent, 100);
}

// Async task that stalls forever; the runtime must enforce the deadline.
struct StallingTask {
    message_id: Mutex<Option<String>>,
}

#[async_trait]
impl AsyncTask for StallingTask {
    async fn run(
        &self,
        _args: HashMap<String, Value>,
        ctx: AsyncTaskContext,
    ) -> llm_flow_core::Result<StepResult> {
        *self.message_id.lock().await = Some(ctx.message_id.clone());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StepResult::Finish {
            result: Payload::empty("Report"),
        })
    }
}

#[tokio::test]
async fn async_timeout_fails_step_without_retry() {
    let stores = stores();
    let task = Arc::new(StallingTask {
        message_id: Mutex::new(None),
    });
    let engine = engine_with(&stores, EngineConfig::default());
    engine.register_task("slow", task.clone());
    register_schemas(&engine, &["StartEvent", "Status", "Report"]);

    let graph = WorkflowGraph::builder("stall", "1.0").step(
        StepDescriptor::builder("work")
            .input("StartEvent")
            .output("Report")
            .initial()
            .asynchronous()
            // A retry policy is present, but timeouts arrive retryable=false.
            .retry(RetryPolicy::new(
                3,
                Duration::from_millis(10),
                2.0,
                Duration::from_millis(100),
            ))
            .handle_fn(|_input, _ctx| async move {
                Ok(StepResult::Async {
                    task_id: "slow".to_string(),
                    timeout_ms: 50,
                    args: HashMap::new(),
                    immediate: Payload::new("Status", json!({"text": "working"})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("stall", Payload::empty("StartEvent"), Some("stall-1".to_string()))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert_eq!(
        engine.status("stall-1").await.unwrap().status,
        InstanceStatus::Failed
    );

    let message_id = task.message_id.lock().await.clone().unwrap();
    let state = stores.async_states.get(&message_id).await.unwrap().unwrap();
    assert_eq!(state.status, AsyncTaskStatus::TimedOut);
}

// Scenario: two retryable failures, then success, with exact backoff.
#[tokio::test]
async fn retry_twice_then_succeed() {
    let stores = stores();
    let interceptor = Arc::new(CountingInterceptor::default());
    let engine = WorkflowEngine::builder()
        .with_instance_store(stores.instances.clone())
        .with_async_state_store(stores.async_states.clone())
        .with_suspension_store(stores.suspensions.clone())
        .with_interceptor(interceptor.clone())
        .build();
    register_schemas(&engine, &["StartEvent", "Done"]);

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_step = attempts.clone();
    let graph = WorkflowGraph::builder("flaky", "1.0").step(
        StepDescriptor::builder("shaky")
            .input("StartEvent")
            .output("Done")
            .initial()
            .retry(RetryPolicy::new(
                3,
                Duration::from_millis(10),
                2.0,
                Duration::from_millis(1_000),
            ))
            .handle_fn(move |_input, _ctx| {
                let attempts = attempts_in_step.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Ok(StepResult::Fail {
                            error: StepFailure::retryable(format!("transient #{}", n)),
                        })
                    } else {
                        Ok(StepResult::Finish {
                            result: Payload::new("Done", json!({"attempts": n})),
                        })
                    }
                }
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let started = std::time::Instant::now();
    let handle = engine
        .execute("flaky", Payload::empty("StartEvent"), Some("flaky-1".to_string()))
        .await
        .unwrap();
    let result = handle.result().await.unwrap();

    assert_eq!(result.data, json!({"attempts": 3}));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Two backoffs of 10ms and 20ms must have elapsed.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(interceptor.errors.load(Ordering::SeqCst), 2);
    assert_eq!(
        engine.status("flaky-1").await.unwrap().status,
        InstanceStatus::Completed
    );
}

// A step that always fails retryable with a 2-attempt policy ends FAILED.
#[tokio::test]
async fn retry_exhaustion_fails_instance() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "Done"]);

    let graph = WorkflowGraph::builder("doomed", "1.0").step(
        StepDescriptor::builder("always-fails")
            .input("StartEvent")
            .output("Done")
            .initial()
            .retry(RetryPolicy::new(
                2,
                Duration::from_millis(5),
                2.0,
                Duration::from_millis(50),
            ))
            .handle_fn(|_input, _ctx| async move {
                Ok(StepResult::Fail {
                    error: StepFailure::retryable("still broken"),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("doomed", Payload::empty("StartEvent"), Some("doom-1".to_string()))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepError);

    let instance = stores.instances.get("doom-1").await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.retry_state["always-fails"].attempts, 2);
}

// Scenario: loop step with an invocation limit and STOP overflow policy.
#[tokio::test]
async fn invocation_limit_stop_completes_with_last_output() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["Tick"]);

    let graph = WorkflowGraph::builder("looper", "1.0").step(
        StepDescriptor::builder("tick")
            .input("Tick")
            .output("Tick")
            .initial()
            .invocation_limit(3, OverflowPolicy::Stop)
            .handle_fn(|input, _ctx| async move {
                let n = input.data.get("n").and_then(Value::as_u64).unwrap_or(0);
                Ok(StepResult::Continue {
                    data: Payload::new("Tick", json!({"n": n + 1})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute(
            "looper",
            Payload::new("Tick", json!({"n": 0})),
            Some("loop-1".to_string()),
        )
        .await
        .unwrap();
    let result = handle.result().await.unwrap();

    // Three executions ran; the result is the third Continue payload.
    assert_eq!(result.data, json!({"n": 3}));
    let instance = stores.instances.get("loop-1").await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.invocation_counts["tick"], 3);
}

#[tokio::test]
async fn invocation_limit_error_fails_instance() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["Tick"]);

    let graph = WorkflowGraph::builder("looper-err", "1.0").step(
        StepDescriptor::builder("tick")
            .input("Tick")
            .output("Tick")
            .initial()
            .invocation_limit(2, OverflowPolicy::Error)
            .handle_fn(|input, _ctx| async move {
                Ok(StepResult::Continue { data: input })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute(
            "looper-err",
            Payload::new("Tick", json!({"n": 0})),
            Some("loop-2".to_string()),
        )
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvocationLimitExceeded);
    assert_eq!(
        engine.status("loop-2").await.unwrap().status,
        InstanceStatus::Failed
    );
}

#[tokio::test]
async fn invocation_limit_continue_keeps_executing() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["Tick"]);

    let graph = WorkflowGraph::builder("looper-cont", "1.0").step(
        StepDescriptor::builder("tick")
            .input("Tick")
            .output("Tick")
            .initial()
            .invocation_limit(2, OverflowPolicy::Continue)
            .handle_fn(|input, _ctx| async move {
                let n = input.data.get("n").and_then(Value::as_u64).unwrap_or(0) + 1;
                if n >= 4 {
                    Ok(StepResult::Finish {
                        result: Payload::new("Tick", json!({"n": n})),
                    })
                } else {
                    Ok(StepResult::Continue {
                        data: Payload::new("Tick", json!({"n": n})),
                    })
                }
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute(
            "looper-cont",
            Payload::new("Tick", json!({"n": 0})),
            Some("loop-3".to_string()),
        )
        .await
        .unwrap();
    let result = handle.result().await.unwrap();

    // Execution proceeded past the limit; the counter kept growing.
    assert_eq!(result.data, json!({"n": 4}));
    let instance = stores.instances.get("loop-3").await.unwrap().unwrap();
    assert_eq!(instance.invocation_counts["tick"], 4);
}

// Cancellation of a suspended instance removes the suspension and rejects
// later resumes.
#[tokio::test]
async fn cancel_suspended_instance() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "UserName", "Prompt", "Done"]);

    let graph = WorkflowGraph::builder("cancellable", "1.0")
        .step(
            StepDescriptor::builder("ask")
                .input("StartEvent")
                .output("UserName")
                .initial()
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Suspend {
                        prompt: Payload::new("Prompt", json!({"text": "?"})),
                        expected_input: "UserName".to_string(),
                        metadata: HashMap::new(),
                    })
                })
                .build()
                .unwrap(),
        )
        .step(
            StepDescriptor::builder("done")
                .input("UserName")
                .output("Done")
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Finish {
                        result: Payload::empty("Done"),
                    })
                })
                .build()
                .unwrap(),
        );
    engine.register_workflow(graph).unwrap();

    let mut handle = engine
        .execute("cancellable", Payload::empty("StartEvent"), Some("c-1".to_string()))
        .await
        .unwrap();
    assert_eq!(handle.settled().await.unwrap(), InstanceStatus::Suspended);

    assert!(engine.cancel("c-1").await.unwrap());
    assert_eq!(
        engine.status("c-1").await.unwrap().status,
        InstanceStatus::Cancelled
    );
    assert!(stores.suspensions.get("c-1").await.unwrap().is_none());

    let err = engine
        .resume("c-1", Payload::new("UserName", json!({"name": "Ada"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSuspended);

    // Cancelling twice is a no-op.
    assert!(!engine.cancel("c-1").await.unwrap());
}

// A cooperative async task observes cancellation; the instance lands in
// CANCELLED with a single terminal async state row.
struct CooperativeTask {
    message_id: Mutex<Option<String>>,
}

#[async_trait]
impl AsyncTask for CooperativeTask {
    async fn run(
        &self,
        _args: HashMap<String, Value>,
        ctx: AsyncTaskContext,
    ) -> llm_flow_core::Result<StepResult> {
        *self.message_id.lock().await = Some(ctx.message_id.clone());
        loop {
            if ctx.is_cancelled() {
                return Ok(StepResult::Fail {
                    error: StepFailure::fatal("stopped on cancellation"),
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn cancel_during_async_task() {
    let stores = stores();
    let task = Arc::new(CooperativeTask {
        message_id: Mutex::new(None),
    });
    let engine = engine_with(&stores, EngineConfig::default());
    engine.register_task("forever", task.clone());
    register_schemas(&engine, &["StartEvent", "Status", "Report"]);

    let graph = WorkflowGraph::builder("long-job", "1.0").step(
        StepDescriptor::builder("work")
            .input("StartEvent")
            .output("Report")
            .initial()
            .asynchronous()
            .handle_fn(|_input, _ctx| async move {
                Ok(StepResult::Async {
                    task_id: "forever".to_string(),
                    timeout_ms: 600_000,
                    args: HashMap::new(),
                    immediate: Payload::new("Status", json!({"text": "spinning"})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let mut handle = engine
        .execute("long-job", Payload::empty("StartEvent"), Some("lj-1".to_string()))
        .await
        .unwrap();
    assert_eq!(handle.settled().await.unwrap(), InstanceStatus::AwaitingAsync);

    assert!(engine.cancel("lj-1").await.unwrap());
    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(
        engine.status("lj-1").await.unwrap().status,
        InstanceStatus::Cancelled
    );

    // The worker shuts the task down without resurrecting the instance.
    let task_probe = task.clone();
    wait_until(move || {
        let task_probe = task_probe.clone();
        Box::pin(async move { task_probe.message_id.lock().await.is_some() })
    })
    .await;
    let message_id = task.message_id.lock().await.clone().unwrap();

    let stores_ref = stores.async_states.clone();
    wait_until(move || {
        let stores_ref = stores_ref.clone();
        let message_id = message_id.clone();
        Box::pin(async move {
            matches!(
                stores_ref.get(&message_id).await.unwrap(),
                Some(state) if state.status.is_terminal()
            )
        })
    })
    .await;
    assert_eq!(
        engine.status("lj-1").await.unwrap().status,
        InstanceStatus::Cancelled
    );
}

// The background sweep honors delete_older_than for terminal async state.
#[tokio::test]
async fn background_sweep_prunes_terminal_async_state() {
    let stores = stores();
    let (tx, rx) = mpsc::channel(1);
    let task = Arc::new(ScriptedTask {
        values: Mutex::new(rx),
        message_id: Mutex::new(None),
    });
    drop(tx);

    let engine = engine_with(
        &stores,
        EngineConfig::default()
            .with_sweep_interval(Duration::from_secs(1))
            .with_async_state_retention_hours(0),
    );
    engine.register_task("t1", task.clone());
    register_schemas(&engine, &["StartEvent", "Status", "Report"]);

    let graph = WorkflowGraph::builder("sweep-wf", "1.0").step(
        StepDescriptor::builder("work")
            .input("StartEvent")
            .output("Report")
            .initial()
            .asynchronous()
            .handle_fn(|_input, _ctx| async move {
                Ok(StepResult::Async {
                    task_id: "t1".to_string(),
                    timeout_ms: 60_000,
                    args: HashMap::new(),
                    immediate: Payload::new("Status", json!({"text": "started"})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("sweep-wf", Payload::empty("StartEvent"), Some("sw-1".to_string()))
        .await
        .unwrap();
    handle.result().await.unwrap();

    let message_id = task.message_id.lock().await.clone().unwrap();
    assert!(stores.async_states.get(&message_id).await.unwrap().is_some());

    let sweeper = engine.start_background_sweep();
    let stores_ref = stores.async_states.clone();
    let probe = message_id.clone();
    wait_until(move || {
        let stores_ref = stores_ref.clone();
        let probe = probe.clone();
        Box::pin(async move { stores_ref.get(&probe).await.unwrap().is_none() })
    })
    .await;
    sweeper.abort();
}

// Concurrent access to a busy instance yields BUSY within the bounded wait.
#[tokio::test]
async fn resume_on_busy_instance_returns_busy() {
    let stores = stores();
    let engine = engine_with(
        &stores,
        EngineConfig::default().with_lock_wait(Duration::from_millis(40)),
    );
    register_schemas(&engine, &["StartEvent", "Done"]);

    let (started_tx, mut started_rx) = mpsc::channel::<()>(1);
    let graph = WorkflowGraph::builder("slow", "1.0").step(
        StepDescriptor::builder("long")
            .input("StartEvent")
            .output("Done")
            .initial()
            .handle_fn(move |_input, _ctx| {
                let started = started_tx.clone();
                async move {
                    let _ = started.send(()).await;
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(StepResult::Finish {
                        result: Payload::empty("Done"),
                    })
                }
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let handle = engine
        .execute("slow", Payload::empty("StartEvent"), Some("busy-1".to_string()))
        .await
        .unwrap();
    started_rx.recv().await.unwrap();

    let err = engine
        .resume("busy-1", Payload::empty("StartEvent"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    handle.result().await.unwrap();
}

// Durability: a suspended instance survives an engine restart sharing the
// same stores, and resumes as if nothing happened.
#[tokio::test]
async fn suspended_instance_survives_engine_restart() {
    let stores = stores();

    let build = |stores: &Stores| {
        let engine = engine_with(stores, EngineConfig::default());
        register_schemas(&engine, &["StartEvent", "UserName", "Prompt", "Greeting"]);
        let graph = WorkflowGraph::builder("conv", "1.0")
            .step(
                StepDescriptor::builder("ask")
                    .input("StartEvent")
                    .output("UserName")
                    .initial()
                    .handle_fn(|_input, _ctx| async move {
                        Ok(StepResult::Suspend {
                            prompt: Payload::new("Prompt", json!({"text": "name?"})),
                            expected_input: "UserName".to_string(),
                            metadata: HashMap::new(),
                        })
                    })
                    .build()
                    .unwrap(),
            )
            .step(
                StepDescriptor::builder("greet")
                    .input("UserName")
                    .output("Greeting")
                    .handle_fn(|input, _ctx| async move {
                        let name = input.str_property("name").unwrap_or("?").to_string();
                        Ok(StepResult::Finish {
                            result: Payload::new("Greeting", json!({"text": format!("Hi {}", name)})),
                        })
                    })
                    .build()
                    .unwrap(),
            );
        engine.register_workflow(graph).unwrap();
        engine
    };

    let first = build(&stores);
    let mut handle = first
        .execute("conv", Payload::empty("StartEvent"), Some("chat-9".to_string()))
        .await
        .unwrap();
    assert_eq!(handle.settled().await.unwrap(), InstanceStatus::Suspended);
    drop(first);

    // "Restart": fresh engine, same stores.
    let second = build(&stores);
    assert_eq!(second.recover().await.unwrap(), 0);
    let resumed = second
        .resume("chat-9", Payload::new("UserName", json!({"name": "Ada"})))
        .await
        .unwrap();
    let result = resumed.result().await.unwrap();
    assert_eq!(result.data, json!({"text": "Hi Ada"}));
}

// A RUNNING instance reloaded from the store re-enters the loop at its
// current step with its staged input and finishes normally.
#[tokio::test]
async fn recover_reenters_running_instance() {
    use llm_flow_core::WorkflowInstance;

    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["StartEvent", "Foo", "Bar"]);

    let graph = WorkflowGraph::builder("lin", "1.0")
        .step(
            StepDescriptor::builder("a")
                .input("StartEvent")
                .output("Foo")
                .initial()
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Continue {
                        data: Payload::new("Foo", json!({"from": "a"})),
                    })
                })
                .build()
                .unwrap(),
        )
        .step(
            StepDescriptor::builder("b")
                .input("Foo")
                .output("Bar")
                .handle_fn(|input, _ctx| async move {
                    Ok(StepResult::Finish {
                        result: Payload::new("Bar", json!({"echo": input.data})),
                    })
                })
                .build()
                .unwrap(),
        );
    engine.register_workflow(graph).unwrap();

    // An instance a previous process left mid-run: cursor on `b`, input
    // staged, no fiber driving it.
    let mut orphan = WorkflowInstance::new("orphan-1", "lin", "1.0", "a");
    orphan.status = InstanceStatus::Running;
    orphan.current_step_id = "b".to_string();
    orphan.current_input = Some(Payload::new("Foo", json!({"from": "a"})));
    orphan.touch();
    stores.instances.save(&orphan).await.unwrap();

    assert_eq!(engine.recover().await.unwrap(), 1);

    let probe = engine.clone();
    wait_until(move || {
        let probe = probe.clone();
        Box::pin(async move {
            probe.status("orphan-1").await.unwrap().status == InstanceStatus::Completed
        })
    })
    .await;

    let result = engine.result_of("orphan-1").await.unwrap().unwrap();
    assert_eq!(result.schema, "Bar");
    assert_eq!(result.data, json!({"echo": {"from": "a"}}));
}

// Coercion: a generic chat request with a schema tag flows into execute.
#[tokio::test]
async fn execute_accepts_generic_chat_request() {
    let stores = stores();
    let engine = engine_with(&stores, EngineConfig::default());
    register_schemas(&engine, &["Question", "Answer"]);

    let graph = WorkflowGraph::builder("qa", "1.0").step(
        StepDescriptor::builder("answer")
            .input("Question")
            .output("Answer")
            .initial()
            .handle_fn(|input, _ctx| async move {
                let text = input.str_property("text").unwrap_or("").to_string();
                Ok(StepResult::Finish {
                    result: Payload::new("Answer", json!({"echo": text})),
                })
            })
            .build()
            .unwrap(),
    );
    engine.register_workflow(graph).unwrap();

    let mut properties = serde_json::Map::new();
    properties.insert("text".to_string(), json!("what is flow?"));
    let handle = engine
        .execute(
            "qa",
            ExecutionInput::request(Some("Question".to_string()), properties),
            None,
        )
        .await
        .unwrap();
    let result = handle.result().await.unwrap();
    assert_eq!(result.data, json!({"echo": "what is flow?"}));
}

//! An async step running a background task with progress reporting.
//!
//! Run with: cargo run --example async_progress

use anyhow::Result;
use async_trait::async_trait;
use llm_flow_core::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct ResearchTask;

#[async_trait]
impl AsyncTask for ResearchTask {
    async fn run(
        &self,
        args: HashMap<String, Value>,
        ctx: AsyncTaskContext,
    ) -> llm_flow_core::Result<StepResult> {
        let topic = args
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        for percent in [20u8, 60, 100] {
            if ctx.is_cancelled() {
                return Ok(StepResult::Fail {
                    error: StepFailure::fatal("cancelled mid-flight"),
                });
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            ctx.progress
                .update(percent, format!("researching {} ({}%)", topic, percent))
                .await?;
        }
        Ok(StepResult::Finish {
            result: Payload::new("Report", json!({"topic": topic, "finding": "all signals green"})),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_flow_core=info".into()),
        )
        .init();

    let engine = WorkflowEngine::builder()
        .with_task("research", Arc::new(ResearchTask))
        .build();
    for schema in ["StartEvent", "Status", "Report"] {
        engine.schemas().register_name(schema);
    }

    let graph = llm_flow_core::WorkflowGraph::builder("deep-dive", "1.0").step(
        StepDescriptor::builder("investigate")
            .input("StartEvent")
            .output("Report")
            .initial()
            .asynchronous()
            .handle_fn(|input, _ctx| async move {
                let mut args = HashMap::new();
                args.insert("topic".to_string(), input.data["topic"].clone());
                Ok(StepResult::Async {
                    task_id: "research".to_string(),
                    timeout_ms: 30_000,
                    args,
                    immediate: Payload::new("Status", json!({"text": "research started"})),
                })
            })
            .build()?,
    );
    engine.register_workflow(graph)?;

    let mut handle = engine
        .execute(
            "deep-dive",
            Payload::new("StartEvent", json!({"topic": "retrieval"})),
            Some("job-7".to_string()),
        )
        .await?;
    println!("parked at: {}", handle.settled().await?);

    // Poll status while the task reports progress.
    loop {
        let snapshot = engine.status("job-7").await?;
        match snapshot.status {
            InstanceStatus::AwaitingAsync => {
                if let Some(percent) = snapshot.progress_percent {
                    println!("progress: {}%", percent);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            _ => break,
        }
    }

    let report = handle.result().await?;
    println!("report: {}", serde_json::to_string_pretty(&report.data)?);
    Ok(())
}

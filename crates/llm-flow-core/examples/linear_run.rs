//! Minimal linear workflow: two steps, one result.
//!
//! Run with: cargo run --example linear_run

use anyhow::Result;
use llm_flow_core::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_flow_core=info".into()),
        )
        .init();

    let engine = WorkflowEngine::builder().build();
    for schema in ["StartEvent", "Draft", "Summary"] {
        engine.schemas().register_name(schema);
    }

    let graph = llm_flow_core::WorkflowGraph::builder("summarize", "1.0")
        .step(
            StepDescriptor::builder("draft")
                .description("Produces a draft from the start event")
                .input("StartEvent")
                .output("Draft")
                .initial()
                .handle_fn(|input, _ctx| async move {
                    let topic = input.str_property("topic").unwrap_or("nothing").to_string();
                    Ok(StepResult::Continue {
                        data: Payload::new("Draft", json!({"text": format!("a draft about {}", topic)})),
                    })
                })
                .build()?,
        )
        .step(
            StepDescriptor::builder("summarize")
                .description("Squeezes the draft into a one-liner")
                .input("Draft")
                .output("Summary")
                .handle_fn(|input, _ctx| async move {
                    let text = input.str_property("text").unwrap_or("").to_string();
                    Ok(StepResult::Finish {
                        result: Payload::new("Summary", json!({"summary": format!("tl;dr: {}", text)})),
                    })
                })
                .build()?,
        );
    engine.register_workflow(graph)?;

    let handle = engine
        .execute(
            "summarize",
            Payload::new("StartEvent", json!({"topic": "durable workflows"})),
            None,
        )
        .await?;
    let instance_id = handle.instance_id().to_string();
    let result = handle.result().await?;

    println!("instance {} finished", instance_id);
    println!("result: {}", serde_json::to_string_pretty(&result.data)?);
    Ok(())
}

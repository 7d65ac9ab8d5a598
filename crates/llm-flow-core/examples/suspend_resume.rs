//! A conversational workflow that pauses for user input and resumes.
//!
//! Run with: cargo run --example suspend_resume

use anyhow::Result;
use llm_flow_core::prelude::*;
use serde_json::json;
use std::collections::HashMap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_flow_core=info".into()),
        )
        .init();

    let engine = WorkflowEngine::builder().build();
    for schema in ["StartEvent", "Prompt", "UserName", "Greeting"] {
        engine.schemas().register_name(schema);
    }

    let graph = llm_flow_core::WorkflowGraph::builder("onboarding", "1.0")
        .step(
            StepDescriptor::builder("ask-name")
                .input("StartEvent")
                .output("UserName")
                .initial()
                .handle_fn(|_input, _ctx| async move {
                    Ok(StepResult::Suspend {
                        prompt: Payload::new("Prompt", json!({"text": "What is your name?"})),
                        expected_input: "UserName".to_string(),
                        metadata: HashMap::new(),
                    })
                })
                .build()?,
        )
        .step(
            StepDescriptor::builder("greet")
                .input("UserName")
                .output("Greeting")
                .handle_fn(|input, _ctx| async move {
                    let name = input.str_property("name").unwrap_or("stranger").to_string();
                    Ok(StepResult::Finish {
                        result: Payload::new("Greeting", json!({"text": format!("Hello, {}!", name)})),
                    })
                })
                .build()?,
        );
    engine.register_workflow(graph)?;

    // The chat id doubles as the instance id.
    let mut handle = engine
        .execute(
            "onboarding",
            Payload::empty("StartEvent"),
            Some("chat-42".to_string()),
        )
        .await?;
    let parked = handle.settled().await?;
    println!("instance parked at: {}", parked);

    let snapshot = engine.status("chat-42").await?;
    println!("status while waiting: {}", snapshot.status);

    if let Some(suspension) = engine.suspension("chat-42").await? {
        println!(
            "prompt for the user: {}",
            suspension.prompt.str_property("text").unwrap_or("?")
        );
    }

    // Later, the user answers; matching typed input resumes the run.
    let resumed = engine
        .resume("chat-42", Payload::new("UserName", json!({"name": "Ada"})))
        .await?;
    let greeting = resumed.result().await?;
    println!("result: {}", greeting.data["text"]);
    Ok(())
}

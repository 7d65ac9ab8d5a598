// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable workflow engine for LLM-driven conversational applications.
//!
//! Workflows are directed graphs of typed steps that interleave
//! deterministic computation, model invocations, and long-lived pauses
//! awaiting human input. Each in-flight workflow is a [`WorkflowInstance`]
//! keyed by a chat/session id; instances persist through pluggable stores,
//! survive process restarts, and resume when matching input arrives.
//!
//! The flow: a step handler returns a [`StepResult`] *describing* its
//! transition (continue, branch, suspend, async, finish, fail); the
//! [`reducer`] turns it into a transition against the registered graph; the
//! scheduler enacts it, persisting the instance at every state change.
//!
//! ```no_run
//! use llm_flow_core::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> llm_flow_core::Result<()> {
//! let engine = WorkflowEngine::builder().build();
//! engine.schemas().register_name("StartEvent");
//! engine.schemas().register_name("Greeting");
//!
//! let graph = WorkflowGraph::builder("hello", "1.0").step(
//!     StepDescriptor::builder("greet")
//!         .input("StartEvent")
//!         .output("Greeting")
//!         .initial()
//!         .handle_fn(|_input, _ctx| async move {
//!             Ok(StepResult::Finish {
//!                 result: Payload::new("Greeting", json!({"text": "hello"})),
//!             })
//!         })
//!         .build()?,
//! );
//! engine.register_workflow(graph)?;
//!
//! let handle = engine
//!     .execute("hello", Payload::empty("StartEvent"), None)
//!     .await?;
//! let greeting = handle.result().await?;
//! assert_eq!(greeting.schema, "Greeting");
//! # Ok(())
//! # }
//! ```

pub mod async_task;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod instance;
pub mod interceptor;
pub mod memory;
pub mod metrics;
pub mod reducer;
pub mod retry;
pub mod schema;
mod scheduler;
pub mod step;
pub mod store;
pub mod suspend;

pub use async_task::{
    AsyncStepState, AsyncTask, AsyncTaskContext, AsyncTaskStatus, ProgressReporter,
};
pub use config::EngineConfig;
pub use context::{WorkflowContext, RESULT_KEY};
pub use engine::{EngineBuilder, Handle, TerminalOutcome, WorkflowEngine};
pub use error::{EngineError, ErrorKind, Result};
pub use graph::{GraphBuilder, WorkflowGraph};
pub use instance::{InstanceStatus, RetryState, StatusSnapshot, WorkflowInstance};
pub use interceptor::{
    ExecutionInterceptor, InterceptorChain, StepInvocation, TracingInterceptor,
};
pub use memory::{MemoryAsyncStateStore, MemoryInstanceStore, MemorySuspensionStore};
pub use reducer::{reduce, Transition};
pub use retry::{RetryDecision, RetryPolicy};
pub use schema::{
    ExecutionInput, Payload, SchemaDescriptor, SchemaRegistry, ANY_SCHEMA,
};
pub use step::{
    handler_fn, CancelFlag, OverflowPolicy, StepBuilder, StepContext, StepDescriptor, StepFailure,
    StepHandler, StepResult,
};
pub use store::{
    AsyncStateStore, AsyncStateStoreRef, InstanceStore, InstanceStoreRef, StoreError,
    SuspensionStore, SuspensionStoreRef,
};
pub use suspend::Suspension;

/// Common imports for engine users.
pub mod prelude {
    pub use crate::async_task::{AsyncTask, AsyncTaskContext, AsyncTaskStatus};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Handle, WorkflowEngine};
    pub use crate::error::{EngineError, ErrorKind, Result};
    pub use crate::graph::WorkflowGraph;
    pub use crate::instance::InstanceStatus;
    pub use crate::interceptor::{ExecutionInterceptor, StepInvocation};
    pub use crate::retry::RetryPolicy;
    pub use crate::schema::{ExecutionInput, Payload, SchemaDescriptor, ANY_SCHEMA};
    pub use crate::step::{
        handler_fn, OverflowPolicy, StepContext, StepDescriptor, StepFailure, StepResult,
    };
}

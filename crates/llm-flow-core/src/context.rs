// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-instance mutable state shared across steps.

use crate::schema::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved output key holding the workflow's final result.
pub const RESULT_KEY: &str = "__workflow_result";

/// Per-instance map of step outputs plus a free-form user key/value map.
///
/// Only the step currently executing writes; between steps, readers see
/// plain snapshots. The whole structure persists with its instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    outputs: HashMap<String, Payload>,
    custom: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last output recorded for a step. Retries overwrite.
    pub fn output(&self, step_id: &str) -> Option<&Payload> {
        self.outputs.get(step_id)
    }

    pub fn set_output(&mut self, step_id: impl Into<String>, payload: Payload) {
        self.outputs.insert(step_id.into(), payload);
    }

    pub fn outputs(&self) -> &HashMap<String, Payload> {
        &self.outputs
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.custom.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.custom.insert(key.into(), value);
    }

    /// Stores the final result under the reserved key.
    pub fn set_result(&mut self, payload: Payload) {
        self.outputs.insert(RESULT_KEY.to_string(), payload);
    }

    /// Final result of a completed instance, if any.
    pub fn result(&self) -> Option<&Payload> {
        self.outputs.get(RESULT_KEY)
    }
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suspension records and resume-input matching.
//!
//! A `Suspend` result freezes an instance indefinitely: the prompt goes out
//! to the caller (and any chat tracker), the record below goes to the
//! suspension store, and the instance stays durable until matching input
//! arrives or it is cancelled.

use crate::error::Result;
use crate::schema::{ExecutionInput, Payload, SchemaRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Durable record of an instance awaiting typed external input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspension {
    pub instance_id: String,
    /// The step that requested the pause.
    pub step_id: String,
    /// Schema name the resume input must satisfy.
    pub expected_input: String,
    /// Prompt published to the caller when the pause began.
    pub prompt: Payload,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Suspension {
    pub fn new(
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        expected_input: impl Into<String>,
        prompt: Payload,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            expected_input: expected_input.into(),
            prompt,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Matches resume input against the expected type, applying the input
    /// coercion rules. Returns the typed payload that re-enters the
    /// scheduling loop, or `TYPE_MISMATCH` without any state change.
    pub fn match_input(
        &self,
        registry: &SchemaRegistry,
        input: ExecutionInput,
    ) -> Result<Payload> {
        registry.coerce(input, &self.expected_input)
    }
}

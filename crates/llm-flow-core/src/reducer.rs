// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The result reducer: maps a step's [`StepResult`] onto a [`Transition`]
//! the scheduler enacts.
//!
//! Successor resolution prefers, in order: exact schema matches over
//! supertype matches, candidates the author declared over inferred ones,
//! and finally the author's declaration order. Several surviving *inferred*
//! candidates carry no author-provided order and fail with
//! `AMBIGUOUS_NEXT`.

use crate::error::{EngineError, Result};
use crate::graph::WorkflowGraph;
use crate::schema::{Payload, SchemaRegistry};
use crate::step::{StepDescriptor, StepFailure, StepResult};
use crate::suspend::Suspension;
use serde_json::Value;
use std::collections::HashMap;

/// What the scheduler does next with an instance.
#[derive(Debug)]
pub enum Transition {
    /// Record the output, move the cursor, keep looping.
    Advance {
        next_step_id: String,
        output: Payload,
    },
    /// Register the suspension and park the instance.
    Suspend(Suspension),
    /// Dispatch the named background task and park the instance.
    StartAsync {
        task_id: String,
        timeout_ms: u64,
        args: HashMap<String, Value>,
        immediate: Payload,
    },
    /// Terminate successfully with the final result.
    Complete { result: Payload },
    /// Terminate with a step failure (already past the retry engine).
    Fail { error: EngineError },
}

/// Reduces a step result to a transition against the current graph node.
///
/// `Fail` results reaching this point have exhausted (or bypassed) the
/// retry engine and terminate the instance.
pub fn reduce(
    graph: &WorkflowGraph,
    registry: &SchemaRegistry,
    instance_id: &str,
    step: &StepDescriptor,
    result: StepResult,
) -> Result<Transition> {
    match result {
        StepResult::Continue { data } => {
            let next_step_id = resolve_successor(graph, registry, step, &data.schema, false)?;
            Ok(Transition::Advance {
                next_step_id,
                output: data,
            })
        }
        StepResult::Branch { data } => {
            let next_step_id = resolve_successor(graph, registry, step, &data.schema, true)?;
            Ok(Transition::Advance {
                next_step_id,
                output: data,
            })
        }
        StepResult::Suspend {
            prompt,
            expected_input,
            metadata,
        } => Ok(Transition::Suspend(Suspension::new(
            instance_id,
            &step.id,
            expected_input,
            prompt,
            metadata,
        ))),
        StepResult::Async {
            task_id,
            timeout_ms,
            args,
            immediate,
        } => Ok(Transition::StartAsync {
            task_id,
            timeout_ms,
            args,
            immediate,
        }),
        StepResult::Finish { result } => Ok(Transition::Complete { result }),
        StepResult::Fail { error } => Ok(Transition::Fail {
            error: failure_to_error(&step.id, error),
        }),
    }
}

/// Converts a step-reported failure into the engine error that carries it.
pub fn failure_to_error(step_id: &str, failure: StepFailure) -> EngineError {
    match failure.kind {
        crate::error::ErrorKind::Timeout => EngineError::Timeout {
            step_id: step_id.to_string(),
            detail: failure.message,
        },
        _ => EngineError::StepError {
            step_id: step_id.to_string(),
            message: failure.message,
            retryable: failure.retryable,
        },
    }
}

struct Candidate {
    step_id: String,
    exact: bool,
    declared: bool,
    declared_pos: usize,
}

/// Finds the successor whose input type accepts `schema`.
///
/// `declared_only` restricts the search to the step's declared next list
/// (Branch semantics); otherwise every step in the graph is a potential
/// (inferred) successor.
fn resolve_successor(
    graph: &WorkflowGraph,
    registry: &SchemaRegistry,
    step: &StepDescriptor,
    schema: &str,
    declared_only: bool,
) -> Result<String> {
    let mut candidates: Vec<Candidate> = Vec::new();

    if declared_only {
        for (pos, next_id) in step.next.iter().enumerate() {
            let target = match graph.step(next_id) {
                Some(target) => target,
                None => continue,
            };
            if registry.is_assignable(schema, &target.input) {
                candidates.push(Candidate {
                    step_id: target.id.clone(),
                    exact: target.input == schema,
                    declared: true,
                    declared_pos: pos,
                });
            }
        }
    } else {
        for target in graph.steps() {
            if !registry.is_assignable(schema, &target.input) {
                continue;
            }
            let declared_pos = step.next.iter().position(|id| id == &target.id);
            candidates.push(Candidate {
                step_id: target.id.clone(),
                exact: target.input == schema,
                declared: declared_pos.is_some(),
                declared_pos: declared_pos.unwrap_or(usize::MAX),
            });
        }
    }

    if candidates.is_empty() {
        return Err(EngineError::NoNext {
            step_id: step.id.clone(),
            schema: schema.to_string(),
        });
    }

    // Tie-break 1: exact schema match beats supertype match.
    if candidates.iter().any(|c| c.exact) {
        candidates.retain(|c| c.exact);
    }
    // Tie-break 2: declared candidates beat inferred ones.
    if candidates.iter().any(|c| c.declared) {
        candidates.retain(|c| c.declared);
    }
    if candidates.len() == 1 {
        return Ok(candidates.remove(0).step_id);
    }
    // Tie-break 3: declaration order, which only exists for declared
    // candidates.
    if candidates.iter().all(|c| c.declared) {
        candidates.sort_by_key(|c| c.declared_pos);
        return Ok(candidates.remove(0).step_id);
    }

    Err(EngineError::AmbiguousNext {
        step_id: step.id.clone(),
        schema: schema.to_string(),
        candidates: candidates.into_iter().map(|c| c.step_id).collect(),
    })
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow graph construction and registration-time validation.
//!
//! A [`WorkflowGraph`] is immutable after registration and shared read-only
//! with every scheduler fiber. The builder validates the structural rules
//! before a graph exists at all: exactly one initial step, resolvable next
//! references, and type compatibility along every edge the reducer could
//! ever produce.

use crate::error::{EngineError, Result};
use crate::schema::SchemaRegistry;
use crate::step::StepDescriptor;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;
use tracing::warn;

/// Immutable, validated workflow graph.
pub struct WorkflowGraph {
    workflow_id: String,
    version: String,
    /// Step descriptors in declaration order.
    steps: Vec<StepDescriptor>,
    by_id: HashMap<String, usize>,
    initial: usize,
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("workflow_id", &self.workflow_id)
            .field("version", &self.version)
            .field("steps", &self.steps.iter().map(|s| &s.id).collect::<Vec<_>>())
            .field("initial", &self.steps[self.initial].id)
            .finish()
    }
}

impl WorkflowGraph {
    pub fn builder(workflow_id: impl Into<String>, version: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            workflow_id: workflow_id.into(),
            version: version.into(),
            steps: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn initial_step(&self) -> &StepDescriptor {
        &self.steps[self.initial]
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDescriptor> {
        self.by_id.get(step_id).map(|&index| &self.steps[index])
    }

    /// Steps in declaration order; the reducer's final tie-break relies on
    /// this ordering.
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.by_id.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Builder collecting step descriptors for validation.
pub struct GraphBuilder {
    workflow_id: String,
    version: String,
    steps: Vec<StepDescriptor>,
}

impl GraphBuilder {
    /// Appends a step; declaration order is preserved.
    pub fn step(mut self, descriptor: StepDescriptor) -> Self {
        self.steps.push(descriptor);
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Validates the collected descriptors and produces the immutable
    /// graph, or fails with every violation found.
    pub fn build(self, registry: &SchemaRegistry) -> Result<WorkflowGraph> {
        let mut violations = Vec::new();

        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if by_id.insert(step.id.clone(), index).is_some() {
                violations.push(format!("duplicate_step: `{}`", step.id));
            }
        }

        // Exactly one initial step.
        let initial_ids: Vec<&str> = self
            .steps
            .iter()
            .filter(|s| s.initial)
            .map(|s| s.id.as_str())
            .collect();
        let initial = match initial_ids.as_slice() {
            [only] => by_id.get(*only).copied(),
            [] => {
                violations.push("missing_initial: no step is flagged initial".to_string());
                None
            }
            many => {
                violations.push(format!("multiple_initial: {:?}", many));
                None
            }
        };

        for step in &self.steps {
            // Schemas must resolve so assignability is decidable.
            if !registry.contains(&step.input) {
                violations.push(format!(
                    "unknown_schema: step `{}` input `{}`",
                    step.id, step.input
                ));
            }
            if !registry.contains(&step.output) {
                violations.push(format!(
                    "unknown_schema: step `{}` output `{}`",
                    step.id, step.output
                ));
            }

            // Declared next references must exist and be type-compatible.
            for next_id in &step.next {
                match by_id.get(next_id) {
                    None => {
                        violations.push(format!("unknown_step: `{}` -> `{}`", step.id, next_id));
                    }
                    Some(&target_index) => {
                        let target = &self.steps[target_index];
                        // Branch edges deliver a payload of some subtype of
                        // the source's wrapped output, so for branching
                        // steps the candidate's input may narrow the output.
                        // Everywhere else the wrapped output must be
                        // assignable to the target's input, full stop.
                        let compatible = if step.branching {
                            registry.is_assignable(&step.output, &target.input)
                                || registry.is_assignable(&target.input, &step.output)
                        } else {
                            registry.is_assignable(&step.output, &target.input)
                        };
                        if !compatible {
                            violations.push(format!(
                                "type_mismatch: `{}` ({}) -> `{}` ({})",
                                step.id, step.output, next_id, target.input
                            ));
                        }
                    }
                }
            }

            // A branching step resolves among declared candidates only.
            if step.branching && step.next.is_empty() {
                violations.push(format!(
                    "branch_without_candidates: `{}` declares Branch but lists no next steps",
                    step.id
                ));
            }
        }

        if !violations.is_empty() {
            return Err(EngineError::InvalidGraph {
                workflow_id: self.workflow_id,
                violations,
            });
        }

        let initial = initial.unwrap_or(0);
        let graph = WorkflowGraph {
            workflow_id: self.workflow_id,
            version: self.version,
            steps: self.steps,
            by_id,
            initial,
        };
        graph.warn_unreachable(registry);
        Ok(graph)
    }
}

impl WorkflowGraph {
    /// Reports steps that no declared or inferred edge can reach. Not an
    /// error: a step may be reachable only through a resume path the
    /// author wires at runtime, but it usually signals a wiring mistake.
    fn warn_unreachable(&self, registry: &SchemaRegistry) {
        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.steps.len()).map(|i| dag.add_node(i)).collect();

        for (from, step) in self.steps.iter().enumerate() {
            for next_id in &step.next {
                if let Some(&to) = self.by_id.get(next_id) {
                    dag.add_edge(indices[from], indices[to], ());
                }
            }
            // Inferred Continue edges: any step whose input accepts this
            // step's wrapped output.
            for (to, candidate) in self.steps.iter().enumerate() {
                if registry.is_assignable(&step.output, &candidate.input) {
                    dag.add_edge(indices[from], indices[to], ());
                }
            }
        }

        let mut reached = vec![false; self.steps.len()];
        let mut dfs = Dfs::new(&dag, indices[self.initial]);
        while let Some(node) = dfs.next(&dag) {
            reached[dag[node]] = true;
        }
        for (index, step) in self.steps.iter().enumerate() {
            if !reached[index] {
                warn!(
                    workflow_id = %self.workflow_id,
                    step_id = %step.id,
                    "step is unreachable from the initial step"
                );
            }
        }
    }
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schema registry and typed payloads.
//!
//! Step inputs and outputs travel as [`Payload`] values: a structured JSON
//! body tagged with the name of a registered schema. The registry records a
//! single-inheritance hierarchy between schema names and answers the
//! assignability questions the graph analyzer and the reducer ask at
//! registration and at every transition.

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Distinguished schema accepted by (and assignable to) everything.
pub const ANY_SCHEMA: &str = "any";

/// A typed step payload: a JSON body tagged with its schema name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Name of the schema describing `data`.
    pub schema: String,
    /// Structured body.
    pub data: Value,
}

impl Payload {
    /// Creates a payload with the given schema tag and body.
    pub fn new(schema: impl Into<String>, data: Value) -> Self {
        Self {
            schema: schema.into(),
            data,
        }
    }

    /// Creates a payload with a null body, useful for marker events.
    pub fn empty(schema: impl Into<String>) -> Self {
        Self::new(schema, Value::Null)
    }

    /// Convenience accessor for a string property of the body.
    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// A registered schema: a name and an optional parent it widens to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub parent: Option<String>,
    pub description: Option<String>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            description: None,
        }
    }

    /// Declares a parent schema this one is assignable to.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Untyped or typed input handed to `execute`/`resume`.
///
/// Conversational callers forward the generic chat request shape (an optional
/// schema name plus a property map); programmatic callers pass a [`Payload`]
/// directly.
#[derive(Debug, Clone)]
pub enum ExecutionInput {
    /// Already-typed payload.
    Typed(Payload),
    /// Generic chat request: optional schema tag plus free-form properties.
    Request {
        schema_name: Option<String>,
        properties: Map<String, Value>,
    },
}

impl ExecutionInput {
    /// Builds the generic request shape.
    pub fn request(schema_name: Option<String>, properties: Map<String, Value>) -> Self {
        ExecutionInput::Request {
            schema_name,
            properties,
        }
    }
}

impl From<Payload> for ExecutionInput {
    fn from(payload: Payload) -> Self {
        ExecutionInput::Typed(payload)
    }
}

/// Thread-safe registry of schema descriptors.
///
/// Shared read-mostly between the engine, the graph analyzer, and the
/// reducer. The `any` schema is built in and needs no registration.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: DashMap<String, SchemaDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a schema descriptor.
    pub fn register(&self, descriptor: SchemaDescriptor) {
        self.entries.insert(descriptor.name.clone(), descriptor);
    }

    /// Registers a plain schema with no parent.
    pub fn register_name(&self, name: impl Into<String>) {
        self.register(SchemaDescriptor::new(name));
    }

    /// Whether `name` resolves to a registered schema.
    pub fn contains(&self, name: &str) -> bool {
        name == ANY_SCHEMA || self.entries.contains_key(name)
    }

    /// Whether a value tagged `source` may flow into a slot expecting
    /// `target`: exact match, widening along the parent chain, or the
    /// `any` slot.
    pub fn is_assignable(&self, source: &str, target: &str) -> bool {
        if source == target || target == ANY_SCHEMA {
            return true;
        }
        let mut current = source.to_string();
        // Parent chains are expected to be shallow; the hop cap guards
        // against accidentally cyclic registrations.
        for _ in 0..32 {
            let parent = match self.entries.get(&current) {
                Some(entry) => entry.parent.clone(),
                None => return false,
            };
            match parent {
                Some(parent) => {
                    if parent == target {
                        return true;
                    }
                    current = parent;
                }
                None => return false,
            }
        }
        false
    }

    /// Applies the input coercion rule to produce a payload compatible with
    /// `expected`.
    ///
    /// Typed input is checked for assignability. For the generic request
    /// shape: a resolvable schema tag wins; otherwise a non-generic expected
    /// type is constructed from the property map; otherwise the properties
    /// pass through tagged `any`.
    pub fn coerce(&self, input: ExecutionInput, expected: &str) -> Result<Payload> {
        match input {
            ExecutionInput::Typed(payload) => {
                if self.is_assignable(&payload.schema, expected) {
                    Ok(payload)
                } else {
                    Err(EngineError::TypeMismatch {
                        expected: expected.to_string(),
                        actual: payload.schema,
                    })
                }
            }
            ExecutionInput::Request {
                schema_name,
                properties,
            } => {
                if let Some(name) = schema_name {
                    if self.contains(&name) {
                        let payload = Payload::new(name, Value::Object(properties));
                        return if self.is_assignable(&payload.schema, expected) {
                            Ok(payload)
                        } else {
                            Err(EngineError::TypeMismatch {
                                expected: expected.to_string(),
                                actual: payload.schema,
                            })
                        };
                    }
                    tracing::debug!(schema = %name, "unresolved schema tag, falling back to property construction");
                }
                if expected != ANY_SCHEMA {
                    Ok(Payload::new(expected, Value::Object(properties)))
                } else {
                    Ok(Payload::new(ANY_SCHEMA, Value::Object(properties)))
                }
            }
        }
    }
}

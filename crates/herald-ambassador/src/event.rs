//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State-changing operation being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// A resource was created.
    Create,
    /// A resource was deleted.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Create => "CREATE",
            OperationKind::Delete => "DELETE",
        })
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(OperationKind::Create),
            "delete" => Ok(OperationKind::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// Audit record published once per state-changing CRUD operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    /// Correlates the event with the request that caused it.
    pub trace_id: String,
    /// What happened.
    pub operation_name: OperationKind,
    /// Who did it.
    pub username: String,
    /// Identifier of the affected resource.
    pub resource_id: String,
}

impl OperationEvent {
    /// Build an event with a fresh random trace id.
    pub fn new(
        operation: OperationKind,
        username: impl Into<String>,
        resource_id: impl ToString,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            operation_name: operation,
            username: username.into(),
            resource_id: resource_id.to_string(),
        }
    }

    /// Replace the generated trace id with one from the caller's context.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// JSON payload as published on the wire.
    pub fn to_payload(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

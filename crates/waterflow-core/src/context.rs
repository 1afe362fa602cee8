use crate::FlowData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a context at its current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeStatus {
    Pending,
    Processing,
    Retryable,
    Error,
    Archived,
}

impl FlowNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowNodeStatus::Error | FlowNodeStatus::Archived)
    }
}

impl fmt::Display for FlowNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowNodeStatus::Pending => "PENDING",
            FlowNodeStatus::Processing => "PROCESSING",
            FlowNodeStatus::Retryable => "RETRYABLE",
            FlowNodeStatus::Error => "ERROR",
            FlowNodeStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// Completion condition of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParallelMode {
    #[default]
    All,
    Any,
}

/// Membership of a context in one fan-out group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelScope {
    pub group: String,
    pub mode: ParallelMode,
    pub branches: usize,
    pub branch: String,
}

/// One execution unit flowing through a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub id: String,
    pub stream_id: String,
    pub root_id: String,
    pub trace_ids: BTreeSet<String>,
    /// Meta id of the node the context is parked at.
    pub position: String,
    pub data: FlowData,
    pub status: FlowNodeStatus,
    pub previous: Option<String>,
    pub batch_id: Option<String>,
    pub to_batch: Option<String>,
    /// Innermost fan-out group last.
    #[serde(default)]
    pub parallel: Vec<ParallelScope>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl FlowContext {
    /// Origin context created when data is offered to a stream.
    pub fn origin(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        trace_id: impl Into<String>,
        data: FlowData,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            root_id: id.clone(),
            id,
            stream_id: stream_id.into(),
            trace_ids: BTreeSet::from([trace_id.into()]),
            position: position.into(),
            data,
            status: FlowNodeStatus::Pending,
            previous: None,
            batch_id: None,
            to_batch: None,
            parallel: Vec::new(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Successor of this context, parked pending at `position`.
    pub fn generate(&self, position: impl Into<String>, batch_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: self.stream_id.clone(),
            root_id: self.root_id.clone(),
            trace_ids: self.trace_ids.clone(),
            position: position.into(),
            data: self.data.clone(),
            status: FlowNodeStatus::Pending,
            previous: Some(self.id.clone()),
            batch_id: Some(batch_id.to_string()),
            to_batch: None,
            parallel: self.parallel.clone(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn with_data(&self, data: FlowData) -> Self {
        let mut copy = self.clone();
        copy.data = data;
        copy
    }

    pub fn set_status(&mut self, status: FlowNodeStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status == FlowNodeStatus::Archived {
            self.archived_at = Some(now);
        }
    }

    pub fn has_trace(&self, trace_id: &str) -> bool {
        self.trace_ids.contains(trace_id)
    }

    pub fn scope(&self) -> Option<&ParallelScope> {
        self.parallel.last()
    }

    pub fn branch(&self) -> Option<&str> {
        self.scope().map(|s| s.branch.as_str())
    }
}

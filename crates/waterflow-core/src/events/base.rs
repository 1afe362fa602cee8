use crate::{ContextErrorInfo, FlowContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while contexts move through a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    ContextsOffered {
        stream_id: String,
        trace_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        stream_id: String,
        node_id: String,
        context_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        stream_id: String,
        node_id: String,
        context_ids: Vec<String>,
        forwarded: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeBlocked {
        stream_id: String,
        node_id: String,
        context_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        stream_id: String,
        node_id: String,
        context_ids: Vec<String>,
        error: ContextErrorInfo,
        timestamp: DateTime<Utc>,
    },
    ContextsRetrying {
        stream_id: String,
        node_id: String,
        to_batch: String,
        context_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ContextsArchived {
        stream_id: String,
        node_id: String,
        trace_ids: Vec<String>,
        context_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

fn ids(contexts: &[FlowContext]) -> Vec<String> {
    contexts.iter().map(|c| c.id.clone()).collect()
}

/// Event emitter bound to one stage of one stream
#[derive(Clone)]
pub struct StageEmitter {
    stream_id: String,
    node_id: String,
    sender: broadcast::Sender<EngineEvent>,
}

impl StageEmitter {
    pub fn new(
        stream_id: impl Into<String>,
        node_id: impl Into<String>,
        sender: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            node_id: node_id.into(),
            sender,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn started(&self, contexts: &[FlowContext]) {
        self.emit(EngineEvent::NodeStarted {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            context_ids: ids(contexts),
            timestamp: Utc::now(),
        });
    }

    pub fn completed(&self, contexts: &[FlowContext], forwarded: usize, duration_ms: u64) {
        self.emit(EngineEvent::NodeCompleted {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            context_ids: ids(contexts),
            forwarded,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn blocked(&self, contexts: &[FlowContext]) {
        self.emit(EngineEvent::NodeBlocked {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            context_ids: ids(contexts),
            timestamp: Utc::now(),
        });
    }

    pub fn failed(&self, contexts: &[FlowContext], error: ContextErrorInfo) {
        self.emit(EngineEvent::NodeFailed {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            context_ids: ids(contexts),
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn retrying(&self, contexts: &[FlowContext], to_batch: &str) {
        self.emit(EngineEvent::ContextsRetrying {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            to_batch: to_batch.to_string(),
            context_ids: ids(contexts),
            timestamp: Utc::now(),
        });
    }

    pub fn archived(&self, contexts: &[FlowContext]) {
        let mut trace_ids: Vec<String> = contexts
            .iter()
            .flat_map(|c| c.trace_ids.iter().cloned())
            .collect();
        trace_ids.sort();
        trace_ids.dedup();
        self.emit(EngineEvent::ContextsArchived {
            stream_id: self.stream_id.clone(),
            node_id: self.node_id.clone(),
            trace_ids,
            context_ids: ids(contexts),
            timestamp: Utc::now(),
        });
    }
}

/// Global event bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, stream_id: &str, node_id: &str) -> StageEmitter {
        StageEmitter::new(stream_id, node_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

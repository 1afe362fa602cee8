//! Declarative flow definitions as they arrive from an editor or a file.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use waterflow_core::services::FlowCallback;
use waterflow_core::{FlowError, ParallelMode, RetryConfig};

/// Complete flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    pub meta_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub callback: Option<FlowCallback>,
    #[serde(default)]
    pub exception_handlers: Vec<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl FlowSpec {
    pub fn new(meta_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta_id: meta_id.into(),
            name: name.into(),
            version: default_version(),
            properties: Map::new(),
            callback: None,
            exception_handlers: Vec::new(),
            nodes: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        serde_json::from_str(json).map_err(|e| FlowError::Definition(e.to_string()))
    }

    /// Identifier of the running graph: `metaId-version`.
    pub fn stream_id(&self) -> String {
        format!("{}-{}", self.meta_id, self.version)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_callback(mut self, callback: FlowCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_exception_handler(mut self, handler: impl Into<String>) -> Self {
        self.exception_handlers.push(handler.into());
        self
    }

    pub fn add_node(&mut self, node: NodeSpec) -> String {
        let id = node.meta_id.clone();
        self.nodes.push(node);
        id
    }

    /// Add an unconditional edge and return its id.
    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> String {
        self.push_event(from.into(), to.into(), None)
    }

    /// Add an edge guarded by a condition rule and return its id.
    pub fn connect_when(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        rule: impl Into<String>,
    ) -> String {
        self.push_event(from.into(), to.into(), Some(rule.into()))
    }

    fn push_event(&mut self, from: String, to: String, condition_rule: Option<String>) -> String {
        let meta_id = format!("{}->{}#{}", from, to, self.events.len());
        self.events.push(EventSpec {
            meta_id: meta_id.clone(),
            from,
            to,
            condition_rule,
        });
        meta_id
    }

    pub fn find_node(&self, meta_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.meta_id == meta_id)
    }

    /// Structural checks performed before a definition is built.
    pub fn validate(&self) -> Result<(), FlowError> {
        let invalid = |msg: String| Err(FlowError::Definition(format!("{}: {}", self.meta_id, msg)));

        let mut types = HashMap::new();
        for node in &self.nodes {
            if types.insert(node.meta_id.as_str(), node.node_type).is_some() {
                return invalid(format!("duplicate node id '{}'", node.meta_id));
            }
        }

        let starts = self.nodes.iter().filter(|n| n.node_type == NodeType::Start).count();
        if starts != 1 {
            return invalid(format!("expected exactly one start node, found {}", starts));
        }
        if !self.nodes.iter().any(|n| n.node_type == NodeType::End) {
            return invalid("no end node".to_string());
        }

        let mut event_ids = HashSet::new();
        for event in &self.events {
            if !event_ids.insert(event.meta_id.as_str()) {
                return invalid(format!("duplicate event id '{}'", event.meta_id));
            }
            let Some(from) = types.get(event.from.as_str()) else {
                return invalid(format!("event '{}' leaves unknown node '{}'", event.meta_id, event.from));
            };
            let Some(to) = types.get(event.to.as_str()) else {
                return invalid(format!("event '{}' enters unknown node '{}'", event.meta_id, event.to));
            };
            match (from, to) {
                (NodeType::End, _) => {
                    return invalid(format!("end node '{}' has an outgoing event", event.from))
                }
                (_, NodeType::Start) => {
                    return invalid(format!("event '{}' enters the start node", event.meta_id))
                }
                (NodeType::Parallel, t) if *t != NodeType::Fork => {
                    return invalid(format!(
                        "parallel node '{}' may only lead to fork nodes",
                        event.from
                    ))
                }
                _ => {}
            }
        }

        for node in self.nodes.iter().filter(|n| n.node_type == NodeType::Parallel) {
            if !self.events.iter().any(|e| e.from == node.meta_id) {
                return invalid(format!("parallel node '{}' has no fork", node.meta_id));
            }
        }
        for node in &self.nodes {
            if node.jober.is_some() && node.node_type != NodeType::State {
                return invalid(format!("only state nodes run jobs, '{}' is {}", node.meta_id, node.node_type));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Start,
    State,
    Condition,
    Fork,
    Parallel,
    Join,
    End,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::State => "state",
            NodeType::Condition => "condition",
            NodeType::Fork => "fork",
            NodeType::Parallel => "parallel",
            NodeType::Join => "join",
            NodeType::End => "end",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerMode {
    #[default]
    Auto,
    Manual,
}

/// Node specification in a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub meta_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub jober: Option<JoberSpec>,
    #[serde(default)]
    pub task: Option<TaskSpec>,
    #[serde(default)]
    pub pre_filter: Option<FilterSpec>,
    #[serde(default)]
    pub post_filter: Option<FilterSpec>,
    #[serde(default)]
    pub callback: Option<FlowCallback>,
    #[serde(default)]
    pub exception_handlers: Vec<String>,
    #[serde(default)]
    pub parallel_mode: Option<ParallelMode>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl NodeSpec {
    pub fn new(meta_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            meta_id: meta_id.into(),
            node_type,
            name: None,
            trigger_mode: TriggerMode::Auto,
            properties: Map::new(),
            jober: None,
            task: None,
            pre_filter: None,
            post_filter: None,
            callback: None,
            exception_handlers: Vec::new(),
            parallel_mode: None,
            retry: None,
        }
    }

    pub fn start(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::Start)
    }

    pub fn state(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::State)
    }

    pub fn condition(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::Condition)
    }

    pub fn fork(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::Fork)
    }

    pub fn parallel(meta_id: impl Into<String>, mode: ParallelMode) -> Self {
        Self::new(meta_id, NodeType::Parallel).with_parallel_mode(mode)
    }

    pub fn join(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::Join)
    }

    pub fn end(meta_id: impl Into<String>) -> Self {
        Self::new(meta_id, NodeType::End)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn manual(mut self) -> Self {
        self.trigger_mode = TriggerMode::Manual;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_jober(mut self, jober: JoberSpec) -> Self {
        self.jober = Some(jober);
        self
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_pre_filter(mut self, filter: FilterSpec) -> Self {
        self.pre_filter = Some(filter);
        self
    }

    pub fn with_post_filter(mut self, filter: FilterSpec) -> Self {
        self.post_filter = Some(filter);
        self
    }

    pub fn with_callback(mut self, callback: FlowCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_exception_handler(mut self, handler: impl Into<String>) -> Self {
        self.exception_handlers.push(handler.into());
        self
    }

    pub fn with_parallel_mode(mut self, mode: ParallelMode) -> Self {
        self.parallel_mode = Some(mode);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryConfig {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
            jitter: false,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobMode {
    #[default]
    Sync,
    Async,
}

/// Automated job of a state node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoberSpec {
    #[serde(default)]
    pub name: String,
    pub handler: String,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl JoberSpec {
    pub fn new(handler: impl Into<String>) -> Self {
        let handler = handler.into();
        Self {
            name: handler.clone(),
            handler,
            mode: JobMode::Sync,
            timeout_ms: None,
            properties: Map::new(),
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.mode = JobMode::Async;
        self
    }

    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout_ms = Some(millis);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Manual task descriptor handed to the task center
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: String,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterSpec {
    /// Wait until at least `threshold` contexts are available.
    MinimumSize { threshold: usize },
    /// Keep contexts matching the expression.
    Condition { expression: String },
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    pub meta_id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition_rule: Option<String>,
}

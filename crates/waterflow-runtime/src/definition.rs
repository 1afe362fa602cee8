use crate::flow::{Flow, FlowServices};
use crate::jober::FlowJober;
use crate::spec::{FilterSpec, FlowSpec, NodeType, TaskSpec, TriggerMode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use waterflow_core::services::FlowCallback;
use waterflow_core::{FlowError, ParallelMode, RetryConfig};

/// Handler notified when a sub-flow context fails terminally.
pub const DEFAULT_PARENT_EXCEPTION_HANDLER: &str = "waterflow.parent.exception";

/// Kind-specific configuration of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    State { jober: Option<FlowJober> },
    Condition,
    Fork,
    Parallel { mode: ParallelMode, forks: Vec<String> },
    Join,
    End,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::State { .. } => NodeType::State,
            NodeKind::Condition => NodeType::Condition,
            NodeKind::Fork => NodeType::Fork,
            NodeKind::Parallel { .. } => NodeType::Parallel,
            NodeKind::Join => NodeType::Join,
            NodeKind::End => NodeType::End,
        }
    }
}

/// Directed edge of a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEvent {
    pub meta_id: String,
    pub from: String,
    pub to: String,
    pub condition_rule: Option<String>,
}

/// A node owned by its [`FlowDefinition`].
#[derive(Debug)]
pub struct FlowNode {
    pub meta_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub trigger_mode: TriggerMode,
    pub properties: Map<String, Value>,
    pub task: Option<TaskSpec>,
    pub pre_filter: Option<FilterSpec>,
    pub post_filter: Option<FilterSpec>,
    pub callback: Option<FlowCallback>,
    pub exception_handlers: Vec<String>,
    pub retry: Option<RetryConfig>,
    /// Outgoing edges.
    pub events: Vec<FlowEvent>,
    definition: Weak<FlowDefinition>,
}

impl FlowNode {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_manual(&self) -> bool {
        self.trigger_mode == TriggerMode::Manual
    }

    /// The owning definition, while it is alive.
    pub fn definition(&self) -> Option<Arc<FlowDefinition>> {
        self.definition.upgrade()
    }
}

/// Immutable node/edge graph of one stream.
pub struct FlowDefinition {
    stream_id: String,
    spec: FlowSpec,
    start: String,
    nodes: BTreeMap<String, Arc<FlowNode>>,
    graph: DiGraph<String, String>,
    index: HashMap<String, NodeIndex>,
    flow: Mutex<Option<Arc<Flow>>>,
}

impl FlowDefinition {
    /// Validate and build a definition.
    pub fn from_spec(spec: FlowSpec) -> Result<Arc<Self>, FlowError> {
        spec.validate()?;

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &spec.nodes {
            index.insert(node.meta_id.clone(), graph.add_node(node.meta_id.clone()));
        }
        for event in &spec.events {
            graph.add_edge(index[&event.from], index[&event.to], event.meta_id.clone());
        }

        let start = spec
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Start)
            .map(|n| n.meta_id.clone())
            .ok_or_else(|| FlowError::Definition(format!("{}: no start node", spec.meta_id)))?;

        let definition = Arc::new_cyclic(|this: &Weak<FlowDefinition>| {
            let nodes = spec
                .nodes
                .iter()
                .map(|node| {
                    let events: Vec<FlowEvent> = spec
                        .events
                        .iter()
                        .filter(|e| e.from == node.meta_id)
                        .map(|e| FlowEvent {
                            meta_id: e.meta_id.clone(),
                            from: e.from.clone(),
                            to: e.to.clone(),
                            condition_rule: e.condition_rule.clone(),
                        })
                        .collect();
                    let kind = match node.node_type {
                        NodeType::Start => NodeKind::Start,
                        NodeType::State => NodeKind::State {
                            jober: node.jober.clone().map(FlowJober::from),
                        },
                        NodeType::Condition => NodeKind::Condition,
                        NodeType::Fork => NodeKind::Fork,
                        NodeType::Parallel => NodeKind::Parallel {
                            mode: node.parallel_mode.unwrap_or_default(),
                            forks: events.iter().map(|e| e.to.clone()).collect(),
                        },
                        NodeType::Join => NodeKind::Join,
                        NodeType::End => NodeKind::End,
                    };
                    let flow_node = FlowNode {
                        meta_id: node.meta_id.clone(),
                        name: node.name.clone().unwrap_or_else(|| node.meta_id.clone()),
                        kind,
                        trigger_mode: node.trigger_mode,
                        properties: node.properties.clone(),
                        task: node.task.clone(),
                        pre_filter: node.pre_filter.clone(),
                        post_filter: node.post_filter.clone(),
                        callback: node.callback.clone(),
                        exception_handlers: node.exception_handlers.clone(),
                        retry: node.retry.clone(),
                        events,
                        definition: this.clone(),
                    };
                    (node.meta_id.clone(), Arc::new(flow_node))
                })
                .collect();

            FlowDefinition {
                stream_id: spec.stream_id(),
                spec: spec.clone(),
                start,
                nodes,
                graph,
                index,
                flow: Mutex::new(None),
            }
        });

        let reachable: BTreeSet<String> = definition
            .reachable()
            .into_iter()
            .map(|n| n.meta_id.clone())
            .collect();
        for id in definition.nodes.keys().filter(|id| !reachable.contains(*id)) {
            tracing::warn!(stream_id = %definition.stream_id, node_id = %id, "Node is unreachable from start");
        }

        tracing::info!(
            stream_id = %definition.stream_id,
            nodes = definition.nodes.len(),
            events = definition.graph.edge_count(),
            "Flow definition built"
        );
        Ok(definition)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn meta_id(&self) -> &str {
        &self.spec.meta_id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn spec(&self) -> &FlowSpec {
        &self.spec
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.spec.properties
    }

    pub fn callback(&self) -> Option<&FlowCallback> {
        self.spec.callback.as_ref()
    }

    pub fn exception_handlers(&self) -> &[String] {
        &self.spec.exception_handlers
    }

    pub fn start_node(&self) -> Result<&Arc<FlowNode>, FlowError> {
        self.get_flow_node(&self.start)
    }

    pub fn get_flow_node(&self, meta_id: &str) -> Result<&Arc<FlowNode>, FlowError> {
        self.nodes
            .get(meta_id)
            .ok_or_else(|| FlowError::NodeNotFound(format!("{} in {}", meta_id, self.stream_id)))
    }

    pub fn node_id_set(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Nodes reachable from start, in breadth-first order. Each node
    /// appears once even when the graph has cycles.
    pub fn reachable(&self) -> Vec<Arc<FlowNode>> {
        let Some(&start) = self.index.get(&self.start) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut order = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if let Some(node) = self.nodes.get(&self.graph[idx]) {
                order.push(node.clone());
            }
        }
        order
    }

    /// Effective retry policy: node, then definition `retry` property, then
    /// the engine default.
    pub fn retry_for(&self, node: &FlowNode, default: &RetryConfig) -> RetryConfig {
        if let Some(retry) = &node.retry {
            return retry.clone();
        }
        self.properties()
            .get("retry")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| default.clone())
    }

    pub fn parent_exception_handler(&self) -> String {
        self.properties()
            .get("parentExceptionHandler")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PARENT_EXCEPTION_HANDLER)
            .to_string()
    }

    /// Materialize the stage pipeline. The first call wires it, later calls
    /// return the same flow.
    pub fn convert_to_flow(self: &Arc<Self>, services: &FlowServices) -> Result<Arc<Flow>, FlowError> {
        let mut cached = self
            .flow
            .lock()
            .map_err(|e| FlowError::System(format!("flow cache poisoned: {}", e)))?;
        if let Some(flow) = cached.as_ref() {
            return Ok(flow.clone());
        }
        let flow = Arc::new(Flow::wire(self, services)?);
        *cached = Some(flow.clone());
        Ok(flow)
    }
}

impl std::fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("stream_id", &self.stream_id)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

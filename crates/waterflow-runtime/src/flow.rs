use crate::definition::{FlowDefinition, FlowNode, NodeKind};
use crate::engine::EngineConfig;
use crate::expression::ExpressionEvaluator;
use crate::nodes::{self, condition, parallel, NodeEnv};
use std::collections::HashMap;
use std::sync::Arc;
use waterflow_core::services::{
    BrokerClient, ChannelMessenger, ConditionEvaluator, FlowContextMessenger, FlowContextRepo,
    FlowLocks, MemoryContextRepo, MemoryLocks,
};
use waterflow_core::stream::{BlockTable, Publisher, Stage, Subscriber, Whether};
use waterflow_core::{EventBus, FlowError};

/// Collaborators injected into every materialized flow.
#[derive(Clone)]
pub struct FlowServices {
    pub repo: Arc<dyn FlowContextRepo>,
    pub messenger: Arc<dyn FlowContextMessenger>,
    pub locks: Arc<dyn FlowLocks>,
    pub broker: Arc<dyn BrokerClient>,
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub events: EventBus,
    pub config: Arc<EngineConfig>,
}

impl FlowServices {
    /// In-process collaborators around `broker`. Spawns the messenger's
    /// delivery task, so it must be called inside a tokio runtime.
    pub fn in_memory(broker: Arc<dyn BrokerClient>, config: EngineConfig) -> Self {
        Self {
            repo: Arc::new(MemoryContextRepo::new()),
            messenger: Arc::new(ChannelMessenger::spawn(broker.clone())),
            locks: Arc::new(MemoryLocks::new()),
            broker,
            evaluator: Arc::new(ExpressionEvaluator::new()),
            events: EventBus::new(config.event_buffer_size),
            config: Arc::new(config),
        }
    }
}

/// The stage pipeline of one definition. Owns every stage; edges hold
/// weak references into this arena.
pub struct Flow {
    stream_id: String,
    start: Arc<Stage>,
    stages: HashMap<String, Arc<Stage>>,
    blocks: BlockTable,
}

impl Flow {
    /// Two-pass construction: one stage per reachable node, then one
    /// subscription per edge.
    pub(crate) fn wire(definition: &Arc<FlowDefinition>, services: &FlowServices) -> Result<Self, FlowError> {
        let stream_id = definition.stream_id().to_string();
        let order = definition.reachable();

        let mut stages = HashMap::new();
        let mut blocks = BlockTable::new();
        for node in &order {
            let env = NodeEnv::new(&stream_id, node.clone(), services.clone());
            let stage = nodes::build_stage(&env);
            if let Some(block) = stage.block_handle() {
                blocks.insert(block);
            }
            stages.insert(node.meta_id.clone(), stage);
        }

        for node in &order {
            let source = stages
                .get(&node.meta_id)
                .ok_or_else(|| FlowError::NodeNotFound(node.meta_id.clone()))?;
            for (edge_id, target_id, whether) in outgoing(definition, node, &services.evaluator)? {
                let target: Arc<dyn Subscriber> = stages
                    .get(&target_id)
                    .cloned()
                    .ok_or_else(|| FlowError::NodeNotFound(target_id.clone()))?;
                source.subscribe(&edge_id, &target, whether)?;
            }
        }

        let start_id = &definition.start_node()?.meta_id;
        let start = stages
            .get(start_id)
            .cloned()
            .ok_or_else(|| FlowError::NodeNotFound(start_id.clone()))?;

        tracing::info!(
            stream_id = %stream_id,
            stages = stages.len(),
            manual = blocks.positions().count(),
            "Flow wired"
        );
        Ok(Self {
            stream_id,
            start,
            stages,
            blocks,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Root publisher fed by `offer`.
    pub fn root(&self) -> &Arc<Stage> {
        &self.start
    }

    pub fn stage(&self, node_id: &str) -> Result<&Arc<Stage>, FlowError> {
        self.stages
            .get(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(format!("{} in {}", node_id, self.stream_id)))
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    pub fn is_manual(&self, position: &str) -> bool {
        self.blocks.contains(position)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("stream_id", &self.stream_id)
            .field("stages", &self.stages.len())
            .field("blocks", &self.blocks)
            .finish()
    }
}

type Edge = (String, String, Option<Whether>);

/// Subscriptions leaving `node`. Parallel-to-fork edges collapse: the
/// parallel stage feeds each fork's successors directly, guarded by the
/// branch the context belongs to.
fn outgoing(
    definition: &FlowDefinition,
    node: &FlowNode,
    evaluator: &Arc<dyn ConditionEvaluator>,
) -> Result<Vec<Edge>, FlowError> {
    match &node.kind {
        NodeKind::Parallel { .. } => {
            let mut edges = Vec::new();
            for event in &node.events {
                let fork = definition.get_flow_node(&event.to)?;
                for (branch_event, rule) in condition::edge_predicates(fork, evaluator) {
                    edges.push((
                        branch_event.meta_id.clone(),
                        branch_event.to.clone(),
                        Some(parallel::branch_predicate(&fork.meta_id, rule)),
                    ));
                }
            }
            Ok(edges)
        }
        _ => Ok(condition::edge_predicates(node, evaluator)
            .into_iter()
            .map(|(event, rule)| (event.meta_id.clone(), event.to.clone(), rule))
            .collect()),
    }
}

//! Node behaviors.
//!
//! Every node kind maps to a stage role and a production function. The
//! shared wiring (filters, error handling, callbacks, blocking) is applied
//! uniformly by [`build_stage`].

pub mod condition;
mod end;
mod fork;
pub mod parallel;
mod start;
mod state;

use crate::callbacks;
use crate::definition::{FlowDefinition, FlowNode, NodeKind};
use crate::error_handler;
use crate::filter;
use crate::notify;
use crate::flow::FlowServices;
use crate::spec::FilterSpec;
use futures::FutureExt;
use std::sync::Arc;
use waterflow_core::stream::{BlockStrategy, Produce, Production, Stage, StageDeps, StageRole};
use waterflow_core::{FlowContext, FlowError, RetryConfig};

/// Everything a node behavior needs at run time.
#[derive(Clone)]
pub struct NodeEnv {
    pub stream_id: String,
    pub node: Arc<FlowNode>,
    pub services: FlowServices,
}

impl NodeEnv {
    pub fn new(stream_id: &str, node: Arc<FlowNode>, services: FlowServices) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            node,
            services,
        }
    }

    pub fn definition(&self) -> Result<Arc<FlowDefinition>, FlowError> {
        self.node
            .definition()
            .ok_or_else(|| FlowError::DefinitionNotFound(self.stream_id.clone()))
    }

    pub fn retry_policy(&self) -> RetryConfig {
        let default = &self.services.config.default_retry;
        match self.node.definition() {
            Some(definition) => definition.retry_for(&self.node, default),
            None => self.node.retry.clone().unwrap_or_else(|| default.clone()),
        }
    }

    /// Copy of `ctx` recording this node in its context data.
    pub fn stamp(&self, ctx: &FlowContext) -> FlowContext {
        ctx.with_data(ctx.data.with_node(&self.node.meta_id, self.node.node_type().as_str()))
    }

    pub fn stamp_outputs(&self, mut production: Production) -> Production {
        production.outputs = production.outputs.iter().map(|c| self.stamp(c)).collect();
        production
    }
}

type Producer = fn(&NodeEnv) -> Produce;

/// Behavior table entry of a node kind.
pub struct NodeBehavior {
    pub role: StageRole,
    pub producer: Producer,
}

pub fn behavior(kind: &NodeKind) -> NodeBehavior {
    match kind {
        NodeKind::Start => NodeBehavior {
            role: StageRole::Publisher,
            producer: start::producer,
        },
        NodeKind::State { .. } => NodeBehavior {
            role: StageRole::Processor,
            producer: state::producer,
        },
        NodeKind::Condition => NodeBehavior {
            role: StageRole::Processor,
            producer: condition::producer,
        },
        NodeKind::Fork => NodeBehavior {
            role: StageRole::Processor,
            producer: fork::producer,
        },
        NodeKind::Parallel { .. } => NodeBehavior {
            role: StageRole::Processor,
            producer: parallel::fan_out,
        },
        NodeKind::Join => NodeBehavior {
            role: StageRole::Processor,
            producer: parallel::join,
        },
        NodeKind::End => NodeBehavior {
            role: StageRole::Subscriber,
            producer: end::producer,
        },
    }
}

/// Forward every input unchanged apart from the node stamp.
pub(crate) fn passthrough(env: &NodeEnv) -> Produce {
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| {
        let outputs = contexts.iter().map(|c| env.stamp(c)).collect();
        let production = Production::forward(contexts, outputs);
        async move { Ok(production) }.boxed()
    })
}

/// Build the stage of one node with its filters, hooks and error handling.
pub fn build_stage(env: &NodeEnv) -> Arc<Stage> {
    let node = &env.node;
    let behavior = behavior(&node.kind);

    let mut produce = (behavior.producer)(env);
    if let Some(post) = &node.post_filter {
        produce = filter::post_filter(env, post.clone(), produce);
    }

    let deps = StageDeps {
        repo: env.services.repo.clone(),
        locks: env.services.locks.clone(),
        emitter: env.services.events.create_emitter(&env.stream_id, &node.meta_id),
    };
    let mut builder = Stage::builder(&env.stream_id, &node.meta_id, behavior.role, produce, deps)
        .on_error(error_handler::callback(env.clone()))
        .on_failed(notify::failure_hook(env.clone()));

    // Results parked by a size post-filter are picked up again with the
    // next arrival.
    let pre = match (&node.pre_filter, &node.post_filter) {
        (Some(pre), _) => Some(pre.clone()),
        (None, Some(FilterSpec::MinimumSize { .. })) => Some(FilterSpec::MinimumSize { threshold: 1 }),
        _ => None,
    };
    if let Some(pre) = pre {
        builder = builder.pre_filter(filter::pre_filter(env, pre));
    }

    if let Some(hook) = callbacks::global_trace(env, "before") {
        builder = builder.on_global_before(hook);
    }
    if let Some(hook) = callbacks::global_trace(env, "after") {
        builder = builder.on_global_after(hook);
    }
    if let Some(hook) = callbacks::completion(env) {
        builder = builder.on_complete(hook);
    }

    if node.is_manual() {
        if behavior.role == StageRole::Processor {
            builder = builder.block(BlockStrategy {
                notify: callbacks::task_notifier(env),
            });
        } else {
            tracing::warn!(
                node_id = %node.meta_id,
                node_type = %node.node_type(),
                "Manual trigger ignored on a node that cannot block"
            );
        }
    }

    builder.build()
}

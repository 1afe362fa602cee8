//! Pre and post data filters of a node.

use crate::nodes::NodeEnv;
use crate::spec::FilterSpec;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use waterflow_core::services::ContextQuery;
use waterflow_core::stream::{ContextFilter, Produce, Production};
use waterflow_core::{FlowContext, FlowError, FlowNodeStatus};

/// Filter applied to a batch before the node claims it.
pub fn pre_filter(env: &NodeEnv, spec: FilterSpec) -> ContextFilter {
    let env = env.clone();
    match spec {
        FilterSpec::MinimumSize { threshold } => Arc::new(move |contexts: Vec<FlowContext>| {
            pending_batch(env.clone(), threshold, contexts).boxed()
        }),
        FilterSpec::Condition { expression } => Arc::new(move |contexts: Vec<FlowContext>| {
            let kept = matching(&env, &expression, contexts);
            async move { Ok(kept) }.boxed()
        }),
    }
}

/// Once at least `threshold` contexts wait at the node, the offered
/// contexts plus those parked by this filter. Contexts held by an
/// asynchronous job are never released here, and a manual node releases
/// only what is being resumed.
async fn pending_batch(
    env: NodeEnv,
    threshold: usize,
    contexts: Vec<FlowContext>,
) -> Result<Vec<FlowContext>, FlowError> {
    let query = ContextQuery::stream(&env.stream_id)
        .node(&env.node.meta_id)
        .status(FlowNodeStatus::Pending);
    let pending = env.services.repo.query(&query).await?;
    if pending.len() < threshold {
        tracing::debug!(
            node_id = %env.node.meta_id,
            pending = pending.len(),
            threshold,
            "Batch below minimum size"
        );
        return Ok(Vec::new());
    }
    if env.node.is_manual() {
        return Ok(contexts);
    }

    let offered: HashSet<&str> = contexts.iter().map(|c| c.id.as_str()).collect();
    let batch = pending
        .into_iter()
        .filter(|c| offered.contains(c.id.as_str()) || c.data.awaiting_job().is_none())
        .collect();
    Ok(batch)
}

/// Contexts matching `expression`. A context whose evaluation fails is
/// skipped and stays pending.
fn matching(env: &NodeEnv, expression: &str, contexts: Vec<FlowContext>) -> Vec<FlowContext> {
    contexts
        .into_iter()
        .filter(|ctx| match env.services.evaluator.evaluate(expression, &ctx.data) {
            Ok(keep) => keep,
            Err(e) => {
                tracing::warn!(
                    node_id = %env.node.meta_id,
                    context_id = %ctx.id,
                    "Pre-filter rule failed: {}",
                    e
                );
                false
            }
        })
        .collect()
}

/// Wrap `inner` so its results are filtered before they are routed.
pub fn post_filter(env: &NodeEnv, spec: FilterSpec, inner: Produce) -> Produce {
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| {
        let env = env.clone();
        let spec = spec.clone();
        let produced = inner(contexts.clone());
        async move {
            let production = produced.await?;
            apply_post_filter(&env, &spec, contexts, production)
        }
        .boxed()
    })
}

/// Park results that do not pass `spec`. Inputs whose results are all
/// filtered out go back to pending at the node.
pub fn apply_post_filter(
    env: &NodeEnv,
    spec: &FilterSpec,
    inputs: Vec<FlowContext>,
    production: Production,
) -> Result<Production, FlowError> {
    match spec {
        FilterSpec::MinimumSize { threshold } => {
            if production.outputs.len() < *threshold {
                tracing::debug!(
                    node_id = %env.node.meta_id,
                    outputs = production.outputs.len(),
                    threshold = *threshold,
                    "Results below minimum size, parking batch"
                );
                return Ok(Production::hold(inputs));
            }
            Ok(production)
        }
        FilterSpec::Condition { expression } => {
            let mut outputs = Vec::new();
            for output in production.outputs {
                if env.services.evaluator.evaluate(expression, &output.data)? {
                    outputs.push(output);
                }
            }
            let passed: HashSet<&str> = outputs.iter().map(|c| c.id.as_str()).collect();
            let mut held = production.held;
            let mut consumed = Vec::new();
            for ctx in production.consumed {
                if passed.contains(ctx.id.as_str()) {
                    consumed.push(ctx);
                } else {
                    held.push(ctx);
                }
            }
            Ok(Production {
                consumed,
                held,
                outputs,
            })
        }
    }
}

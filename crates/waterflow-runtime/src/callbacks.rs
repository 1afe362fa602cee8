//! Lifecycle hooks delivering contexts to callbacks and task handlers.

use crate::nodes::NodeEnv;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use waterflow_core::services::{deliver, CallbackEnvelope};
use waterflow_core::stream::ContextHook;
use waterflow_core::FlowContext;

/// Trace hook for `stage` ("before" or "after"). Only installed when the
/// definition declares a callback; each context is stamped with the node
/// and stage before it is handed to the messenger.
pub fn global_trace(env: &NodeEnv, stage: &'static str) -> Option<ContextHook> {
    let callback = env.node.definition()?.callback()?.clone();
    let env = env.clone();
    let hook: ContextHook = Arc::new(move |contexts: Vec<FlowContext>| {
        let env = env.clone();
        let callback = callback.clone();
        async move {
            let node_type = env.node.node_type();
            let stamped: Vec<FlowContext> = contexts
                .iter()
                .map(|c| c.with_data(c.data.stamped(&env.node.meta_id, node_type.as_str(), stage)))
                .collect();
            if let Err(e) = env.services.messenger.send_callback(&callback, stamped).await {
                tracing::warn!(node_id = %env.node.meta_id, stage, "Trace callback dispatch failed: {}", e);
            }
        }
        .boxed()
    });
    Some(hook)
}

/// Completion hook: the node callback runs inline, then the definition
/// callback is dispatched through the messenger.
pub fn completion(env: &NodeEnv) -> Option<ContextHook> {
    let node_callback = env.node.callback.clone();
    let definition_callback = env
        .node
        .definition()
        .and_then(|d| d.callback().cloned());
    if node_callback.is_none() && definition_callback.is_none() {
        return None;
    }

    let env = env.clone();
    let hook: ContextHook = Arc::new(move |contexts: Vec<FlowContext>| {
        let env = env.clone();
        let node_callback = node_callback.clone();
        let definition_callback = definition_callback.clone();
        async move {
            if let Some(callback) = node_callback {
                let envelope = CallbackEnvelope {
                    callback,
                    contexts: contexts.clone(),
                };
                deliver(env.services.broker.as_ref(), &envelope).await;
            }
            if let Some(callback) = definition_callback {
                if let Err(e) = env.services.messenger.send_callback(&callback, contexts).await {
                    tracing::warn!(node_id = %env.node.meta_id, "Completion callback dispatch failed: {}", e);
                }
            }
        }
        .boxed()
    });
    Some(hook)
}

/// Hook of a manual node with a task handler, invoked with
/// `[task, contexts, nodeId]` whenever contexts park at the node.
pub fn task_notifier(env: &NodeEnv) -> Option<ContextHook> {
    let task = env.node.task.clone()?;
    let handler = task.handler.clone()?;
    let task_value = serde_json::to_value(&task).ok()?;
    let env = env.clone();
    let hook: ContextHook = Arc::new(move |contexts: Vec<FlowContext>| {
        let env = env.clone();
        let handler = handler.clone();
        let task_value = task_value.clone();
        async move {
            let payload = match serde_json::to_value(&contexts) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(node_id = %env.node.meta_id, "cannot encode task payload: {}", e);
                    return;
                }
            };
            let args = vec![task_value, payload, Value::String(env.node.meta_id.clone())];
            match env.services.broker.invoke(&handler, args).await {
                Ok(_) => tracing::info!(
                    node_id = %env.node.meta_id,
                    handler = %handler,
                    count = contexts.len(),
                    "Manual task published"
                ),
                Err(e) => tracing::warn!(
                    node_id = %env.node.meta_id,
                    handler = %handler,
                    "Manual task notification failed: {}",
                    e
                ),
            }
        }
        .boxed()
    });
    Some(hook)
}

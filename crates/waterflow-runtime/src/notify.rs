//! Best-effort notification of remote exception handlers.

use crate::nodes::NodeEnv;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use waterflow_core::stream::ContextHook;
use waterflow_core::{ContextErrorInfo, FlowContext};

/// Handlers declared on the node followed by those of its definition.
fn exception_handlers(env: &NodeEnv) -> Vec<String> {
    let mut handlers: Vec<String> = env.node.exception_handlers.clone();
    if let Some(definition) = env.node.definition() {
        for id in definition.exception_handlers() {
            if !handlers.contains(id) {
                handlers.push(id.clone());
            }
        }
    }
    handlers
}

/// Stage hook notifying the exception handlers about contexts that ended
/// in `ERROR`.
pub fn failure_hook(env: NodeEnv) -> ContextHook {
    Arc::new(move |contexts: Vec<FlowContext>| {
        let env = env.clone();
        async move {
            let Some(info) = contexts.first().and_then(|c| c.data.error_info()) else {
                tracing::warn!(node_id = %env.node.meta_id, "Failed contexts carry no error info");
                return;
            };
            notify_exception_handlers(&env, &info, &contexts).await;
        }
        .boxed()
    })
}

/// Invoke every exception handler with `[contexts, errorInfo, nodeId]`,
/// then notify the parent flows of sub-flow contexts. Failures are logged.
pub async fn notify_exception_handlers(env: &NodeEnv, info: &ContextErrorInfo, contexts: &[FlowContext]) {
    let (payload, info_value) = match (serde_json::to_value(contexts), serde_json::to_value(info)) {
        (Ok(payload), Ok(info_value)) => (payload, info_value),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(node_id = %env.node.meta_id, "cannot encode exception payload: {}", e);
            return;
        }
    };

    let handlers = exception_handlers(env);
    let broker = env.services.broker.clone();
    let calls = handlers.iter().map(|handler_id| {
        let args = vec![
            payload.clone(),
            info_value.clone(),
            Value::String(env.node.meta_id.clone()),
        ];
        let broker = broker.clone();
        async move { (handler_id, broker.invoke(handler_id, args).await) }
    });
    for (handler_id, result) in join_all(calls).await {
        match result {
            Ok(_) => tracing::debug!(
                node_id = %env.node.meta_id,
                handler = %handler_id,
                "Exception handler notified"
            ),
            Err(e) if e.is_not_found() => tracing::warn!(
                node_id = %env.node.meta_id,
                handler = %handler_id,
                "Exception handler not found"
            ),
            Err(e) => tracing::warn!(
                node_id = %env.node.meta_id,
                handler = %handler_id,
                "Exception handler failed: {}",
                e
            ),
        }
    }

    notify_parent_flows(env, &info_value, contexts).await;
}

/// Contexts spawned by a parent instance report to the parent's handler,
/// one call per parent with `[parentInstanceId, contexts, errorInfo]`.
async fn notify_parent_flows(env: &NodeEnv, info: &Value, contexts: &[FlowContext]) {
    let mut by_parent: BTreeMap<&str, Vec<&FlowContext>> = BTreeMap::new();
    for ctx in contexts {
        if let Some(parent) = ctx.data.parent_instance_id() {
            by_parent.entry(parent).or_default().push(ctx);
        }
    }
    if by_parent.is_empty() {
        return;
    }

    let handler_id = match env.node.definition() {
        Some(definition) => definition.parent_exception_handler(),
        None => crate::definition::DEFAULT_PARENT_EXCEPTION_HANDLER.to_string(),
    };
    for (parent, children) in by_parent {
        let payload = match serde_json::to_value(&children) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(parent_instance_id = %parent, "cannot encode parent payload: {}", e);
                continue;
            }
        };
        let args = vec![Value::String(parent.to_string()), payload, info.clone()];
        match env.services.broker.invoke(&handler_id, args).await {
            Ok(_) => tracing::info!(
                node_id = %env.node.meta_id,
                parent_instance_id = %parent,
                count = children.len(),
                "Parent flow notified"
            ),
            Err(e) => tracing::warn!(
                node_id = %env.node.meta_id,
                parent_instance_id = %parent,
                handler = %handler_id,
                "Parent flow notification failed: {}",
                e
            ),
        }
    }
}

use crate::jober;
use crate::nodes::NodeEnv;
use futures::FutureExt;
use std::sync::Arc;
use uuid::Uuid;
use waterflow_core::stream::{ErrorCallback, ErrorOutcome};
use waterflow_core::{ContextErrorInfo, FlowContext, FlowError, FlowNodeStatus, RetryPolicy};

/// Error callback installed on every stage.
pub fn callback(env: NodeEnv) -> ErrorCallback {
    Arc::new(move |error: FlowError, contexts: Vec<FlowContext>| handle(env.clone(), error, contexts).boxed())
}

/// Retry the batch when the policy allows it, otherwise record the error on
/// every context. Exception handlers are notified by the stage once the
/// node lock is released, see [`crate::notify::failure_hook`].
pub async fn handle(env: NodeEnv, error: FlowError, contexts: Vec<FlowContext>) -> ErrorOutcome {
    let contexts: Vec<FlowContext> = contexts.into_iter().map(jober::release).collect();
    let policy = env.retry_policy();
    if policy.should_retry(&error, &contexts) {
        let to_batch = contexts
            .iter()
            .find_map(|c| c.to_batch.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let attempt = contexts.iter().map(|c| c.retry_count).max().unwrap_or(0) + 1;
        let contexts: Vec<FlowContext> = contexts
            .into_iter()
            .map(|mut ctx| {
                ctx.retry_count += 1;
                ctx.to_batch = Some(to_batch.clone());
                ctx.set_status(FlowNodeStatus::Retryable);
                ctx
            })
            .collect();
        let delay = env.services.config.auto_retry.then(|| policy.delay(attempt));
        tracing::warn!(
            stream_id = %env.stream_id,
            node_id = %env.node.meta_id,
            to_batch = %to_batch,
            attempt,
            max_attempts = policy.max_attempts,
            "Job failed, batch marked retryable: {}",
            error
        );
        return ErrorOutcome::Retrying {
            contexts,
            to_batch,
            delay,
        };
    }

    let info = ContextErrorInfo::from_error(&error, &env.node.name);
    let contexts: Vec<FlowContext> = contexts
        .into_iter()
        .map(|ctx| {
            let mut failed = ctx.with_data(ctx.data.with_error_info(&info));
            failed.set_status(FlowNodeStatus::Error);
            failed
        })
        .collect();
    tracing::error!(
        stream_id = %env.stream_id,
        node_id = %env.node.meta_id,
        code = info.error_code,
        count = contexts.len(),
        kind = ?error.kind(),
        "Node failed: {}",
        error
    );
    ErrorOutcome::Failed { contexts }
}

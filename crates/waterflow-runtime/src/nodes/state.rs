use super::{passthrough, NodeEnv};
use crate::definition::NodeKind;
use crate::jober::FlowJober;
use futures::FutureExt;
use std::sync::Arc;
use waterflow_core::stream::{Produce, Production};
use waterflow_core::{FlowContext, FlowError};

/// Runs the node's job, or passes data through when none is configured.
pub fn producer(env: &NodeEnv) -> Produce {
    let jober = match &env.node.kind {
        NodeKind::State { jober: Some(jober) } => jober.clone(),
        _ => return passthrough(env),
    };
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| run(env.clone(), jober.clone(), contexts).boxed())
}

async fn run(env: NodeEnv, jober: FlowJober, contexts: Vec<FlowContext>) -> Result<Production, FlowError> {
    tracing::debug!(
        node_id = %env.node.meta_id,
        handler = %jober.handler,
        count = contexts.len(),
        "Invoking job"
    );
    let production = jober
        .run(
            env.services.broker.as_ref(),
            contexts,
            env.services.config.default_job_timeout_ms,
        )
        .await?;
    Ok(env.stamp_outputs(production))
}

use super::NodeEnv;
use futures::FutureExt;
use std::sync::Arc;
use waterflow_core::stream::Produce;
use waterflow_core::{FlowContext, FlowError};

/// Forks only mark where a parallel branch begins. Their edges are folded
/// into the owning parallel stage, so a context reaching one directly is
/// a wiring mistake.
pub fn producer(env: &NodeEnv) -> Produce {
    let node_id = env.node.meta_id.clone();
    Arc::new(move |_contexts: Vec<FlowContext>| {
        let error = FlowError::unsupported(format!(
            "fork node '{}' is structural and cannot be processed directly",
            node_id
        ));
        async move { Err(error) }.boxed()
    })
}

use super::NodeEnv;
use futures::FutureExt;
use std::sync::Arc;
use waterflow_core::stream::{Produce, Production};
use waterflow_core::FlowContext;

/// Terminal sink: every input is archived with the node stamp.
pub fn producer(env: &NodeEnv) -> Produce {
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| {
        let archived = contexts.iter().map(|c| env.stamp(c)).collect();
        async move { Ok(Production::consume(archived)) }.boxed()
    })
}

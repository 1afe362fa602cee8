use super::{passthrough, NodeEnv};
use waterflow_core::stream::Produce;

/// Offered data becomes the origin contexts and is forwarded as is.
pub fn producer(env: &NodeEnv) -> Produce {
    passthrough(env)
}

//! Collaborator contracts consumed by the engine, with in-process
//! implementations for tests and single-node deployments.

mod broker;
mod iggy;
mod locks;
mod messenger;
mod repo;

use crate::{FlowData, FlowError};

pub use broker::{BrokerClient, FnHandler, RemoteHandler};
pub use iggy::{IggyCallbackSubscription, IggyMessenger, IggyMessengerConfig, IggyMessengerError};
pub use locks::{lock_key, FlowLocks, MemoryLocks};
pub use messenger::{deliver, CallbackEnvelope, ChannelMessenger, FlowCallback, FlowContextMessenger};
pub use repo::{ContextQuery, FlowContextRepo, MemoryContextRepo};

/// Evaluates branch rules against context data.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, data: &FlowData) -> Result<bool, FlowError>;
}

//! Push-based pipeline elements.
//!
//! Every node of a materialized flow is a [`Stage`]. A stage receives
//! contexts from its publishers, claims them under the lock provider, runs
//! its production function and forwards the produced contexts to each
//! subscription whose predicate accepts them.

mod block;
mod stage;

use crate::{FlowContext, FlowError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use block::{Block, BlockTable};
pub use stage::{BlockStrategy, Stage, StageBuilder, StageDeps};

/// Edge predicate deciding whether a produced context travels an edge.
pub type Whether = Arc<dyn Fn(&FlowContext) -> Result<bool, FlowError> + Send + Sync>;

/// Production function of a stage.
pub type Produce =
    Arc<dyn Fn(Vec<FlowContext>) -> BoxFuture<'static, Result<Production, FlowError>> + Send + Sync>;

/// Narrows a batch before it is processed. Contexts filtered out stay pending.
pub type ContextFilter = Arc<
    dyn Fn(Vec<FlowContext>) -> BoxFuture<'static, Result<Vec<FlowContext>, FlowError>> + Send + Sync,
>;

/// Decides what happens to a batch whose production failed.
pub type ErrorCallback =
    Arc<dyn Fn(FlowError, Vec<FlowContext>) -> BoxFuture<'static, ErrorOutcome> + Send + Sync>;

/// Lifecycle hook receiving a batch of contexts.
pub type ContextHook = Arc<dyn Fn(Vec<FlowContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Result of one production step.
///
/// `consumed` contexts are archived, `held` ones go back to pending at the
/// node, and every context in `outputs` is forwarded as a fresh successor.
#[derive(Debug, Default)]
pub struct Production {
    pub consumed: Vec<FlowContext>,
    pub held: Vec<FlowContext>,
    pub outputs: Vec<FlowContext>,
}

impl Production {
    /// Consume the inputs and forward them unchanged.
    pub fn pass(contexts: Vec<FlowContext>) -> Self {
        Self {
            outputs: contexts.clone(),
            consumed: contexts,
            held: Vec::new(),
        }
    }

    pub fn forward(consumed: Vec<FlowContext>, outputs: Vec<FlowContext>) -> Self {
        Self {
            consumed,
            held: Vec::new(),
            outputs,
        }
    }

    pub fn consume(contexts: Vec<FlowContext>) -> Self {
        Self {
            consumed: contexts,
            ..Self::default()
        }
    }

    pub fn hold(contexts: Vec<FlowContext>) -> Self {
        Self {
            held: contexts,
            ..Self::default()
        }
    }
}

/// Decision of an error callback. The stage persists the carried contexts.
#[derive(Debug)]
pub enum ErrorOutcome {
    /// Contexts are `RETRYABLE` under `to_batch`. With a delay the stage
    /// re-admits the batch itself once the delay elapses.
    Retrying {
        contexts: Vec<FlowContext>,
        to_batch: String,
        delay: Option<Duration>,
    },
    /// Contexts are terminal `ERROR`.
    Failed { contexts: Vec<FlowContext> },
}

impl ErrorOutcome {
    pub fn contexts(&self) -> &[FlowContext] {
        match self {
            ErrorOutcome::Retrying { contexts, .. } | ErrorOutcome::Failed { contexts } => contexts,
        }
    }
}

/// Position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Entry point fed by `offer`.
    Publisher,
    /// Receives, produces and forwards.
    Processor,
    /// Terminal sink.
    Subscriber,
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn node_id(&self) -> &str;

    /// Called with contexts already persisted `PENDING` at this node.
    async fn on_next(&self, contexts: Vec<FlowContext>);
}

pub trait Publisher: Send + Sync {
    fn subscribe(
        &self,
        edge_id: &str,
        subscriber: &Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Result<(), FlowError>;
}

/// Both ends of an edge.
pub trait Processor: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> Processor for T {}

/// One outgoing edge of a publisher.
#[derive(Clone)]
pub struct Subscription {
    pub edge_id: String,
    pub target_id: String,
    target: Weak<dyn Subscriber>,
    whether: Option<Whether>,
}

impl Subscription {
    pub fn new(edge_id: &str, subscriber: &Arc<dyn Subscriber>, whether: Option<Whether>) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            target_id: subscriber.node_id().to_string(),
            target: Arc::downgrade(subscriber),
            whether,
        }
    }

    pub fn accepts(&self, context: &FlowContext) -> Result<bool, FlowError> {
        match &self.whether {
            Some(whether) => whether(context),
            None => Ok(true),
        }
    }

    pub fn target(&self) -> Option<Arc<dyn Subscriber>> {
        self.target.upgrade()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("edge_id", &self.edge_id)
            .field("target_id", &self.target_id)
            .field("conditional", &self.whether.is_some())
            .finish()
    }
}

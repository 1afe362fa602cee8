use crate::{FlowContext, FlowError, FlowNodeStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Filter for [`FlowContextRepo::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    pub stream_id: String,
    pub trace_id: Option<String>,
    pub node_id: Option<String>,
    pub status: Option<FlowNodeStatus>,
    pub to_batch: Option<String>,
}

impl ContextQuery {
    pub fn stream(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            ..Self::default()
        }
    }

    pub fn trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn status(mut self, status: FlowNodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn to_batch(mut self, to_batch: impl Into<String>) -> Self {
        self.to_batch = Some(to_batch.into());
        self
    }

    pub fn matches(&self, ctx: &FlowContext) -> bool {
        ctx.stream_id == self.stream_id
            && self.trace_id.as_ref().map_or(true, |t| ctx.has_trace(t))
            && self.node_id.as_ref().map_or(true, |n| &ctx.position == n)
            && self.status.map_or(true, |s| ctx.status == s)
            && self
                .to_batch
                .as_ref()
                .map_or(true, |b| ctx.to_batch.as_ref() == Some(b))
    }
}

/// Persistence contract for contexts.
#[async_trait]
pub trait FlowContextRepo: Send + Sync {
    async fn save(&self, contexts: &[FlowContext]) -> Result<(), FlowError>;

    async fn update(&self, contexts: &[FlowContext]) -> Result<(), FlowError>;

    async fn query(&self, query: &ContextQuery) -> Result<Vec<FlowContext>, FlowError>;

    /// Contexts with the given ids; unknown ids are skipped.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<FlowContext>, FlowError>;
}

/// In-memory implementation of [`FlowContextRepo`].
///
/// Query results come back in creation order.
#[derive(Default)]
pub struct MemoryContextRepo {
    contexts: RwLock<BTreeMap<String, FlowContext>>,
}

impl MemoryContextRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}

fn in_creation_order(mut contexts: Vec<FlowContext>) -> Vec<FlowContext> {
    contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    contexts
}

#[async_trait]
impl FlowContextRepo for MemoryContextRepo {
    async fn save(&self, contexts: &[FlowContext]) -> Result<(), FlowError> {
        let mut store = self.contexts.write().await;
        for ctx in contexts {
            store.insert(ctx.id.clone(), ctx.clone());
        }
        Ok(())
    }

    async fn update(&self, contexts: &[FlowContext]) -> Result<(), FlowError> {
        let mut store = self.contexts.write().await;
        for ctx in contexts {
            match store.get_mut(&ctx.id) {
                Some(existing) => *existing = ctx.clone(),
                None => {
                    return Err(FlowError::Repository(format!(
                        "cannot update unknown context {}",
                        ctx.id
                    )))
                }
            }
        }
        Ok(())
    }

    async fn query(&self, query: &ContextQuery) -> Result<Vec<FlowContext>, FlowError> {
        let store = self.contexts.read().await;
        let found = store.values().filter(|c| query.matches(c)).cloned().collect();
        Ok(in_creation_order(found))
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<FlowContext>, FlowError> {
        let store = self.contexts.read().await;
        let found = ids.iter().filter_map(|id| store.get(id).cloned()).collect();
        Ok(in_creation_order(found))
    }
}

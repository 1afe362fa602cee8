use crate::HandlerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// A uniquely identified remote implementation (job executor, callback,
/// exception handler).
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError>;
}

/// Resolves remote handlers by their opaque id.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn resolve(&self, handler_id: &str) -> Result<Arc<dyn RemoteHandler>, HandlerError>;

    async fn invoke(&self, handler_id: &str, args: Vec<Value>) -> Result<Value, HandlerError> {
        let handler = self.resolve(handler_id).await?;
        handler.invoke(args).await
    }
}

type HandlerFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync;

/// Closure-backed [`RemoteHandler`].
pub struct FnHandler {
    id: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl RemoteHandler for FnHandler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self.f)(args).await
    }
}

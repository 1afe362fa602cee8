#![allow(dead_code)]

use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use waterflow_core::services::{ContextQuery, FnHandler, RemoteHandler};
use waterflow_core::{FlowContext, FlowNodeStatus, HandlerError, RetryConfig};
use waterflow_runtime::{EngineConfig, FlowEngine, HandlerRegistry};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Fast retries so scenarios finish quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        default_retry: RetryConfig {
            max_attempts: 3,
            delay_ms: 10,
            backoff_multiplier: 1.0,
            jitter: false,
        },
        ..EngineConfig::default()
    }
}

pub fn engine(registry: HandlerRegistry) -> FlowEngine {
    FlowEngine::with_config(Arc::new(registry), test_config())
}

/// Arguments of every invocation of a recording handler.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<Vec<Value>>>>);

impl Calls {
    pub fn all(&self) -> Vec<Vec<Value>> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn push(&self, args: Vec<Value>) {
        self.0.lock().unwrap().push(args);
    }
}

/// Handler answering every call with `reply` and recording its arguments.
pub fn recorder(id: &str, reply: Value) -> (Arc<dyn RemoteHandler>, Calls) {
    let calls = Calls::default();
    let seen = calls.clone();
    let handler = FnHandler::new(id, move |args: Vec<Value>| {
        seen.push(args);
        let reply = reply.clone();
        async move { Ok::<Value, HandlerError>(reply) }.boxed()
    });
    (Arc::new(handler), calls)
}

pub async fn contexts_at(
    engine: &FlowEngine,
    stream_id: &str,
    trace_id: &str,
    node_id: &str,
    status: FlowNodeStatus,
) -> Vec<FlowContext> {
    let query = ContextQuery::stream(stream_id)
        .trace(trace_id)
        .node(node_id)
        .status(status);
    engine.contexts(&query).await.unwrap()
}

/// Positions visited by `ctx`, oldest first, following `previous` links.
pub async fn path_to(engine: &FlowEngine, ctx: &FlowContext) -> Vec<String> {
    let mut path = vec![ctx.position.clone()];
    let mut previous = ctx.previous.clone();
    while let Some(id) = previous {
        let found = engine.services().repo.get_by_ids(&[id]).await.unwrap();
        let Some(prev) = found.into_iter().next() else {
            break;
        };
        path.push(prev.position.clone());
        previous = prev.previous;
    }
    path.reverse();
    path
}

/// Poll `check` until it holds or [`TIMEOUT`] elapses.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

use crate::definition::{FlowDefinition, FlowNode};
use crate::filter;
use crate::flow::{Flow, FlowServices};
use crate::jober::{self, JobToken};
use crate::nodes::NodeEnv;
use crate::spec::FlowSpec;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use waterflow_core::services::{BrokerClient, ContextQuery};
use waterflow_core::stream::{Produce, Subscriber};
use waterflow_core::{
    EngineEvent, FlowContext, FlowData, FlowError, FlowNodeStatus, HandlerError, RetryConfig,
};

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry policy of nodes and definitions that declare none.
    pub default_retry: RetryConfig,
    /// Re-admit retryable batches after the policy delay.
    pub auto_retry: bool,
    pub event_buffer_size: usize,
    pub default_job_timeout_ms: Option<u64>,
    pub settle_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryConfig::default(),
            auto_retry: true,
            event_buffer_size: 1024,
            default_job_timeout_ms: None,
            settle_poll_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `WATERFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_attempts) = env_var("WATERFLOW_RETRY_MAX_ATTEMPTS") {
            config.default_retry.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = env_var("WATERFLOW_RETRY_DELAY_MS") {
            config.default_retry.delay_ms = delay_ms;
        }
        if let Some(auto_retry) = env_var("WATERFLOW_AUTO_RETRY") {
            config.auto_retry = auto_retry;
        }
        if let Some(size) = env_var("WATERFLOW_EVENT_BUFFER") {
            config.event_buffer_size = size;
        }
        if let Some(millis) = env_var("WATERFLOW_JOB_TIMEOUT_MS") {
            config.default_job_timeout_ms = Some(millis);
        }
        config
    }
}

fn env_var<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {}", key, raw);
            None
        }
    }
}

/// Business updates applied to one parked context on resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub context_id: String,
    #[serde(default)]
    pub business: Map<String, Value>,
}

impl ResumeRequest {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            business: Map::new(),
        }
    }

    pub fn with_business(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.business.insert(key.into(), value.into());
        self
    }
}

/// Entry point of the engine: registered definitions and their flows
pub struct FlowEngine {
    services: FlowServices,
    definitions: RwLock<HashMap<String, Arc<FlowDefinition>>>,
}

impl FlowEngine {
    /// Engine with in-memory collaborators and default settings. Must be
    /// called inside a tokio runtime.
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self::with_config(broker, EngineConfig::default())
    }

    pub fn with_config(broker: Arc<dyn BrokerClient>, config: EngineConfig) -> Self {
        Self::with_services(FlowServices::in_memory(broker, config))
    }

    /// Engine over externally provided collaborators.
    pub fn with_services(services: FlowServices) -> Self {
        Self {
            services,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &FlowServices {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Build, wire and register a definition. A definition with the same
    /// stream id is replaced.
    pub async fn register(&self, spec: FlowSpec) -> Result<Arc<FlowDefinition>, FlowError> {
        let definition = FlowDefinition::from_spec(spec)?;
        definition.convert_to_flow(&self.services)?;
        let stream_id = definition.stream_id().to_string();
        let previous = self
            .definitions
            .write()
            .await
            .insert(stream_id.clone(), definition.clone());
        if previous.is_some() {
            tracing::warn!(stream_id = %stream_id, "Replaced registered definition");
        } else {
            tracing::info!(stream_id = %stream_id, "Registered definition");
        }
        Ok(definition)
    }

    pub async fn unregister(&self, stream_id: &str) -> bool {
        self.definitions.write().await.remove(stream_id).is_some()
    }

    pub async fn definition(&self, stream_id: &str) -> Result<Arc<FlowDefinition>, FlowError> {
        self.definitions
            .read()
            .await
            .get(stream_id)
            .cloned()
            .ok_or_else(|| FlowError::DefinitionNotFound(stream_id.to_string()))
    }

    pub async fn definitions(&self) -> Vec<Arc<FlowDefinition>> {
        let mut all: Vec<_> = self.definitions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.stream_id().cmp(b.stream_id()));
        all
    }

    /// The materialized flow of a registered definition.
    pub async fn convert_to_flow(&self, stream_id: &str) -> Result<Arc<Flow>, FlowError> {
        self.definition(stream_id).await?.convert_to_flow(&self.services)
    }

    pub async fn get_flow_node(&self, stream_id: &str, meta_id: &str) -> Result<Arc<FlowNode>, FlowError> {
        Ok(self.definition(stream_id).await?.get_flow_node(meta_id)?.clone())
    }

    /// Start one origin context per data item at the start node. Returns the
    /// trace id shared by all of them.
    pub async fn offer(&self, stream_id: &str, data: Vec<FlowData>) -> Result<String, FlowError> {
        if data.is_empty() {
            return Err(FlowError::Contract(format!("nothing offered to {}", stream_id)));
        }
        let flow = self.convert_to_flow(stream_id).await?;
        let start = flow.root().clone();
        let trace_id = Uuid::new_v4().to_string();
        let origins: Vec<FlowContext> = data
            .into_iter()
            .map(|d| FlowContext::origin(stream_id, start.node_id(), &trace_id, d))
            .collect();

        self.services.repo.save(&origins).await?;
        self.services.events.emit(EngineEvent::ContextsOffered {
            stream_id: stream_id.to_string(),
            trace_id: trace_id.clone(),
            count: origins.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            stream_id = %stream_id,
            trace_id = %trace_id,
            count = origins.len(),
            "Offered data"
        );

        start.admit(origins).await?;
        Ok(trace_id)
    }

    /// Resume contexts parked at the manual node `position`, applying each
    /// request's business updates first.
    pub async fn resume(
        &self,
        stream_id: &str,
        position: &str,
        requests: Vec<ResumeRequest>,
    ) -> Result<usize, FlowError> {
        let flow = self.convert_to_flow(stream_id).await?;
        let block = flow.blocks().get(position)?;
        if requests.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = requests.iter().map(|r| r.context_id.clone()).collect();
        let mut found: HashMap<String, FlowContext> = self
            .services
            .repo
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut contexts = Vec::with_capacity(requests.len());
        for request in requests {
            let ctx = found
                .remove(&request.context_id)
                .ok_or_else(|| FlowError::Contract(format!("unknown context {}", request.context_id)))?;
            if ctx.status != FlowNodeStatus::Pending || ctx.position != position {
                return Err(FlowError::Contract(format!(
                    "context {} is {} at {}, not pending at {}",
                    ctx.id, ctx.status, ctx.position, position
                )));
            }
            contexts.push(ctx.with_data(ctx.data.merged_business(&request.business)));
        }
        self.services.repo.update(&contexts).await?;

        tracing::info!(
            stream_id = %stream_id,
            position = %position,
            count = contexts.len(),
            "Resuming parked contexts"
        );
        block.process(contexts).await
    }

    /// Re-admit a retryable batch without waiting for its delay.
    pub async fn retry(&self, stream_id: &str, to_batch: &str) -> Result<usize, FlowError> {
        let flow = self.convert_to_flow(stream_id).await?;
        let query = ContextQuery::stream(stream_id)
            .status(FlowNodeStatus::Retryable)
            .to_batch(to_batch);
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for ctx in self.services.repo.query(&query).await? {
            *positions.entry(ctx.position).or_default() += 1;
        }

        let mut processed = 0;
        for position in positions.into_keys() {
            let stage = flow.stage(&position)?.clone();
            processed += stage.readmit(to_batch.to_string()).await?;
        }
        Ok(processed)
    }

    /// Settle contexts held by an asynchronous job with the job's result.
    pub async fn complete_job(
        &self,
        token: JobToken,
        result: Result<Vec<Map<String, Value>>, HandlerError>,
    ) -> Result<usize, FlowError> {
        let definition = self.definition(&token.stream_id).await?;
        let node = definition.get_flow_node(&token.position)?.clone();
        let flow = definition.convert_to_flow(&self.services)?;
        let stage = flow.stage(&token.position)?.clone();
        let env = NodeEnv::new(&token.stream_id, node.clone(), self.services.clone());

        let mut produce: Produce = match result {
            Ok(items) => {
                let value = Value::Array(items.into_iter().map(Value::Object).collect());
                let env = env.clone();
                Arc::new(move |contexts: Vec<FlowContext>| {
                    let produced = jober::apply_results(contexts, value.clone()).map(|p| env.stamp_outputs(p));
                    async move { produced }.boxed()
                })
            }
            Err(error) => {
                let handler = token.handler.clone();
                Arc::new(move |_contexts: Vec<FlowContext>| {
                    let failure = FlowError::job(&handler, error.clone());
                    async move { Err(failure) }.boxed()
                })
            }
        };
        if let Some(post) = &node.post_filter {
            produce = filter::post_filter(&env, post.clone(), produce);
        }
        let inner = produce;
        let produce: Produce = Arc::new(move |contexts: Vec<FlowContext>| {
            inner(contexts.into_iter().map(jober::release).collect())
        });

        let contexts = self.services.repo.get_by_ids(&token.context_ids).await?;
        tracing::info!(
            stream_id = %token.stream_id,
            position = %token.position,
            handler = %token.handler,
            count = contexts.len(),
            "Completing async job"
        );
        stage.process_with(contexts, produce).await
    }

    pub async fn contexts(&self, query: &ContextQuery) -> Result<Vec<FlowContext>, FlowError> {
        self.services.repo.query(query).await
    }

    /// Wait until every context of `trace_id` is terminal or parked at a
    /// manual node. Retryable contexts count as settled when automatic
    /// retry is off.
    pub async fn settle(
        &self,
        stream_id: &str,
        trace_id: &str,
        timeout: Duration,
    ) -> Result<Vec<FlowContext>, FlowError> {
        let flow = self.convert_to_flow(stream_id).await?;
        let query = ContextQuery::stream(stream_id).trace(trace_id);
        let auto_retry = self.config().auto_retry;
        let poll = Duration::from_millis(self.config().settle_poll_ms.max(1));
        let started = Instant::now();
        loop {
            let contexts = self.services.repo.query(&query).await?;
            let settled = !contexts.is_empty()
                && contexts.iter().all(|c| match c.status {
                    FlowNodeStatus::Error | FlowNodeStatus::Archived => true,
                    FlowNodeStatus::Pending => flow.is_manual(&c.position),
                    FlowNodeStatus::Retryable => !auto_retry,
                    FlowNodeStatus::Processing => false,
                });
            if settled {
                return Ok(contexts);
            }
            if started.elapsed() >= timeout {
                return Err(FlowError::Timeout {
                    what: format!("trace {} of {}", trace_id, stream_id),
                    millis: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::spec::NodeSpec;

    fn linear() -> FlowSpec {
        let mut spec = FlowSpec::new("linear", "Linear");
        spec.add_node(NodeSpec::start("start"));
        spec.add_node(NodeSpec::state("work"));
        spec.add_node(NodeSpec::end("end"));
        spec.connect("start", "work");
        spec.connect("work", "end");
        spec
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.auto_retry);
        assert_eq!(config.event_buffer_size, 1024);
        assert!(config.default_job_timeout_ms.is_none());
    }

    #[test]
    fn test_resume_request_reads_camel_case() {
        let request: ResumeRequest =
            serde_json::from_value(serde_json::json!({"contextId": "c1", "business": {"ok": true}})).unwrap();
        assert_eq!(request.context_id, "c1");
        assert_eq!(request.business.get("ok"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_register_replaces_and_lookups_fail_cleanly() {
        let engine = FlowEngine::new(Arc::new(HandlerRegistry::new()));
        let first = engine.register(linear()).await.unwrap();
        let second = engine.register(linear()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.definitions().await.len(), 1);

        assert!(engine.get_flow_node("linear-1.0.0", "work").await.is_ok());
        assert!(matches!(
            engine.get_flow_node("linear-1.0.0", "ghost").await,
            Err(FlowError::NodeNotFound(_))
        ));
        assert!(matches!(
            engine.offer("missing-1.0.0", vec![FlowData::new("op")]).await,
            Err(FlowError::DefinitionNotFound(_))
        ));
        assert!(matches!(
            engine.resume("linear-1.0.0", "work", Vec::new()).await,
            Err(FlowError::NotBlocked(_))
        ));
        assert!(engine.unregister("linear-1.0.0").await);
    }

    #[tokio::test]
    async fn test_settle_times_out_on_unknown_trace() {
        let engine = FlowEngine::new(Arc::new(HandlerRegistry::new()));
        engine.register(linear()).await.unwrap();
        let err = engine
            .settle("linear-1.0.0", "nope", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
    }
}

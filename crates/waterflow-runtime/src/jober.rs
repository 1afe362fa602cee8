use crate::spec::{JobMode, JoberSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use waterflow_core::services::BrokerClient;
use waterflow_core::stream::Production;
use waterflow_core::{keys, FlowContext, FlowError, HandlerError};

/// Handle passed to an asynchronous job. The job hands it back through
/// `FlowEngine::complete_job` once it is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobToken {
    pub stream_id: String,
    pub position: String,
    pub handler: String,
    pub context_ids: Vec<String>,
}

/// Automated job bound to a state node.
#[derive(Debug, Clone)]
pub struct FlowJober {
    pub name: String,
    pub handler: String,
    pub mode: JobMode,
    pub timeout_ms: Option<u64>,
    pub properties: Map<String, Value>,
}

impl From<JoberSpec> for FlowJober {
    fn from(spec: JoberSpec) -> Self {
        Self {
            name: spec.name,
            handler: spec.handler,
            mode: spec.mode,
            timeout_ms: spec.timeout_ms,
            properties: spec.properties,
        }
    }
}

impl FlowJober {
    /// Invoke the job for a batch.
    ///
    /// Handlers receive `[flowData[], properties]`, plus the [`JobToken`] for
    /// asynchronous jobs.
    pub async fn run(
        &self,
        broker: &dyn BrokerClient,
        contexts: Vec<FlowContext>,
        default_timeout_ms: Option<u64>,
    ) -> Result<Production, FlowError> {
        let data: Vec<Value> = contexts
            .iter()
            .map(|c| serde_json::to_value(&c.data))
            .collect::<Result<_, _>>()?;
        let mut args = vec![Value::Array(data), Value::Object(self.properties.clone())];

        if self.mode == JobMode::Async {
            let token = self.token(&contexts);
            args.push(serde_json::to_value(&token)?);
            self.call(broker, args, default_timeout_ms).await?;
            tracing::info!(
                handler = %self.handler,
                position = %token.position,
                count = token.context_ids.len(),
                "Async job submitted"
            );
            let held = contexts
                .iter()
                .map(|c| c.with_data(c.data.with_context(keys::AWAITING_JOB, self.handler.clone())))
                .collect();
            return Ok(Production::hold(held));
        }

        let result = self.call(broker, args, default_timeout_ms).await?;
        apply_results(contexts, result)
    }

    fn token(&self, contexts: &[FlowContext]) -> JobToken {
        let first = contexts.first();
        JobToken {
            stream_id: first.map(|c| c.stream_id.clone()).unwrap_or_default(),
            position: first.map(|c| c.position.clone()).unwrap_or_default(),
            handler: self.handler.clone(),
            context_ids: contexts.iter().map(|c| c.id.clone()).collect(),
        }
    }

    async fn call(
        &self,
        broker: &dyn BrokerClient,
        args: Vec<Value>,
        default_timeout_ms: Option<u64>,
    ) -> Result<Value, FlowError> {
        let invocation = broker.invoke(&self.handler, args);
        let result = match self.timeout_ms.or(default_timeout_ms) {
            Some(millis) => tokio::time::timeout(Duration::from_millis(millis), invocation)
                .await
                .map_err(|_| FlowError::job(&self.handler, HandlerError::Timeout { millis }))?,
            None => invocation.await,
        };
        result.map_err(|e| FlowError::job(&self.handler, e))
    }
}

/// Copy of `ctx` no longer held by an asynchronous job.
pub fn release(ctx: FlowContext) -> FlowContext {
    match ctx.data.awaiting_job() {
        Some(_) => ctx.with_data(ctx.data.without_context(keys::AWAITING_JOB)),
        None => ctx,
    }
}

/// Turn a job result into a production over `contexts`.
///
/// An array matching the batch size is applied pairwise, an array answering
/// a single context fans it out, an object applies to every context and
/// `null` passes the batch through unchanged.
pub fn apply_results(contexts: Vec<FlowContext>, result: Value) -> Result<Production, FlowError> {
    let outputs = match result {
        Value::Null => contexts.clone(),
        Value::Object(map) => contexts
            .iter()
            .map(|c| c.with_data(c.data.merged_business(&map)))
            .collect(),
        Value::Array(items) => {
            let maps = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    other => Err(FlowError::Contract(format!(
                        "job result item must be an object, got {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if maps.len() == contexts.len() {
                contexts
                    .iter()
                    .zip(maps.iter())
                    .map(|(c, m)| c.with_data(c.data.merged_business(m)))
                    .collect()
            } else if contexts.len() == 1 && !maps.is_empty() {
                let single = &contexts[0];
                maps.iter()
                    .map(|m| single.with_data(single.data.merged_business(m)))
                    .collect()
            } else {
                return Err(FlowError::Contract(format!(
                    "job returned {} results for {} contexts",
                    maps.len(),
                    contexts.len()
                )));
            }
        }
        other => {
            return Err(FlowError::Contract(format!(
                "job result must be an array or an object, got {}",
                other
            )))
        }
    };
    Ok(Production::forward(contexts, outputs))
}

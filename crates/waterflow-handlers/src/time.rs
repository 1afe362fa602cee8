use crate::job_properties;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use waterflow_core::services::RemoteHandler;
use waterflow_core::HandlerError;

/// Delay execution for `delayMs` milliseconds
pub struct DelayHandler;

#[async_trait]
impl RemoteHandler for DelayHandler {
    fn id(&self) -> &str {
        "time.delay"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        let delay_ms = job_properties(&args)
            .get("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(1000); // Default to 1 second if not specified

        tracing::info!("Delaying for {}ms", delay_ms);
        sleep(Duration::from_millis(delay_ms)).await;

        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_waits_the_configured_delay() {
        let started = Instant::now();
        DelayHandler
            .invoke(vec![json!([]), json!({"delayMs": 30})])
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}

use crate::job_data;
use async_trait::async_trait;
use serde_json::Value;
use waterflow_core::services::RemoteHandler;
use waterflow_core::HandlerError;

/// Logs every argument it receives. As a job it leaves data unchanged.
pub struct DebugHandler;

#[async_trait]
impl RemoteHandler for DebugHandler {
    fn id(&self) -> &str {
        "debug.log"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        let message = args
            .get(1)
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("(no message)");
        tracing::info!("DEBUG: {}", message);

        for (i, data) in job_data(&args).iter().enumerate() {
            tracing::info!("  [{}] {}", i, data.get("businessData").unwrap_or(data));
        }
        tracing::debug!(arguments = args.len(), "debug.log invoked");

        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passes_data_through() {
        let out = DebugHandler
            .invoke(vec![json!([{"businessData": {"a": 1}}]), json!({"message": "hi"})])
            .await
            .unwrap();
        assert_eq!(out, Value::Null);
        assert!(DebugHandler.invoke(Vec::new()).await.is_ok());
    }
}

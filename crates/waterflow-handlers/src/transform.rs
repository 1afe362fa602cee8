use crate::{job_data, job_properties};
use async_trait::async_trait;
use serde_json::{Map, Value};
use waterflow_core::services::RemoteHandler;
use waterflow_core::HandlerError;

/// Set the `fields` object on the business data of every context
pub struct SetFieldsHandler;

#[async_trait]
impl RemoteHandler for SetFieldsHandler {
    fn id(&self) -> &str {
        "transform.set"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        match job_properties(&args).get("fields") {
            Some(Value::Object(fields)) => Ok(Value::Object(fields.clone())),
            Some(other) => Err(HandlerError::Payload(format!("fields must be an object, got {}", other))),
            None => Err(HandlerError::Payload("missing property: fields".to_string())),
        }
    }
}

/// Name of the business field a transform reads, and the one it writes.
fn fields(properties: &Map<String, Value>) -> Result<(String, String), HandlerError> {
    let source = properties
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::Payload("missing property: field".to_string()))?;
    let target = properties
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or(source);
    Ok((source.to_string(), target.to_string()))
}

/// One business update per data item, in order.
fn per_item<F>(args: &[Value], mut update: F) -> Result<Value, HandlerError>
where
    F: FnMut(&Value) -> Result<Value, HandlerError>,
{
    let (source, target) = fields(&job_properties(args))?;
    let mut results = Vec::new();
    for data in job_data(args) {
        let input = data
            .get("businessData")
            .and_then(|b| b.get(&source))
            .ok_or_else(|| HandlerError::Payload(format!("business field '{}' is missing", source)))?;
        let mut result = Map::new();
        result.insert(target.clone(), update(input)?);
        results.push(Value::Object(result));
    }
    Ok(Value::Array(results))
}

/// Parse a JSON string business field
pub struct JsonParseHandler;

#[async_trait]
impl RemoteHandler for JsonParseHandler {
    fn id(&self) -> &str {
        "transform.json_parse"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        per_item(&args, |input| {
            let text = input
                .as_str()
                .ok_or_else(|| HandlerError::Payload(format!("expected a JSON string, got {}", input)))?;
            serde_json::from_str(text).map_err(|e| HandlerError::Payload(format!("JSON parse error: {}", e)))
        })
    }
}

/// Serialize a business field to a JSON string
pub struct JsonStringifyHandler;

#[async_trait]
impl RemoteHandler for JsonStringifyHandler {
    fn id(&self) -> &str {
        "transform.json_stringify"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        per_item(&args, |input| {
            serde_json::to_string(input)
                .map(Value::String)
                .map_err(|e| HandlerError::Payload(format!("JSON stringify error: {}", e)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_fields_returns_the_configured_object() {
        let out = SetFieldsHandler
            .invoke(vec![json!([{}]), json!({"fields": {"status": "done"}})])
            .await
            .unwrap();
        assert_eq!(out, json!({"status": "done"}));
        assert!(SetFieldsHandler.invoke(vec![json!([]), json!({})]).await.is_err());
    }

    #[tokio::test]
    async fn test_json_parse_updates_each_item() {
        let data = json!([
            {"businessData": {"raw": "{\"n\": 1}"}},
            {"businessData": {"raw": "[2]"}}
        ]);
        let out = JsonParseHandler
            .invoke(vec![data, json!({"field": "raw", "target": "parsed"})])
            .await
            .unwrap();
        assert_eq!(out, json!([{"parsed": {"n": 1}}, {"parsed": [2]}]));
    }

    #[tokio::test]
    async fn test_json_stringify_reports_missing_fields() {
        let out = JsonStringifyHandler
            .invoke(vec![json!([{"businessData": {"v": {"a": true}}}]), json!({"field": "v"})])
            .await
            .unwrap();
        assert_eq!(out, json!([{"v": "{\"a\":true}"}]));

        let err = JsonStringifyHandler
            .invoke(vec![json!([{"businessData": {}}]), json!({"field": "v"})])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }
}

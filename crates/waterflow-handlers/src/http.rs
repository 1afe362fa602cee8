use crate::{job_data, job_properties};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use waterflow_core::services::{BrokerClient, RemoteHandler};
use waterflow_core::HandlerError;

/// HTTP request handler. The response status and body are written to the
/// business data of every context.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteHandler for HttpRequestHandler {
    fn id(&self) -> &str {
        "http.request"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        let properties = job_properties(&args);
        let url = properties
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::Payload("missing property: url".to_string()))?;
        let method = properties
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        tracing::info!("{} {}", method, url);

        let body = Value::Array(job_data(&args).to_vec());
        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url).json(&body),
            "PUT" => self.client.put(url).json(&body),
            "DELETE" => self.client.delete(url),
            _ => return Err(HandlerError::Payload(format!("Unsupported method: {}", method))),
        };

        // Add headers if provided
        let request = if let Some(Value::Object(headers)) = properties.get("headers") {
            let mut req = request;
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    req = req.header(key.as_str(), val_str);
                }
            }
            req
        } else {
            request
        };

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::Transport(format!("HTTP request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .map_err(|e| HandlerError::Transport(format!("Failed to read response: {}", e)))?;

        tracing::info!("Response status: {}", status);
        if status >= 400 {
            return Err(HandlerError::failed(i32::from(status), body_text));
        }

        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));
        Ok(json!({ "status": status, "body": body }))
    }
}

/// Broker resolving handler ids to `POST {base_url}/{id}` endpoints.
///
/// Arguments are sent as a JSON array; the JSON response is the result.
#[derive(Clone)]
pub struct HttpBroker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BrokerClient for HttpBroker {
    async fn resolve(&self, handler_id: &str) -> Result<Arc<dyn RemoteHandler>, HandlerError> {
        Ok(Arc::new(HttpRemoteHandler {
            id: handler_id.to_string(),
            url: format!("{}/{}", self.base_url, handler_id),
            client: self.client.clone(),
        }))
    }
}

struct HttpRemoteHandler {
    id: String,
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl RemoteHandler for HttpRemoteHandler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        tracing::debug!(handler = %self.id, url = %self.url, "Invoking remote handler");
        let response = self
            .client
            .post(&self.url)
            .json(&args)
            .send()
            .await
            .map_err(|e| HandlerError::Transport(format!("{}: {}", self.url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HandlerError::NotFound(self.id.clone()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::Transport(format!("{}: {}", self.url, e)))?;
        if !status.is_success() {
            return Err(HandlerError::failed(i32::from(status.as_u16()), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| HandlerError::Payload(format!("invalid JSON response: {}", e)))
    }
}

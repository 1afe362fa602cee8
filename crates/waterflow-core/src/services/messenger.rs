use crate::services::BrokerClient;
use crate::{FlowContext, FlowError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Completion callback of a node or a definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowCallback {
    pub name: String,
    /// Remote handler ids invoked with the context batch.
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// A callback delivery unit, as it travels through a messenger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackEnvelope {
    pub callback: FlowCallback,
    pub contexts: Vec<FlowContext>,
}

/// Asynchronous callback delivery. At-least-once, unordered.
#[async_trait]
pub trait FlowContextMessenger: Send + Sync {
    async fn send_callback(
        &self,
        callback: &FlowCallback,
        contexts: Vec<FlowContext>,
    ) -> Result<(), FlowError>;
}

/// Invoke every handler of the envelope's callback. Failures are logged.
pub async fn deliver(broker: &dyn BrokerClient, envelope: &CallbackEnvelope) {
    let payload = match serde_json::to_value(&envelope.contexts) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(callback = %envelope.callback.name, "cannot encode callback payload: {}", e);
            return;
        }
    };
    for handler_id in &envelope.callback.handlers {
        let args = vec![payload.clone(), Value::Object(envelope.callback.properties.clone())];
        if let Err(e) = broker.invoke(handler_id, args).await {
            tracing::warn!(
                callback = %envelope.callback.name,
                handler = %handler_id,
                "callback delivery failed: {}",
                e
            );
        }
    }
}

/// Messenger backed by an in-process queue and a delivery task.
pub struct ChannelMessenger {
    sender: mpsc::UnboundedSender<CallbackEnvelope>,
    cancel: CancellationToken,
}

impl ChannelMessenger {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(broker: Arc<dyn BrokerClient>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<CallbackEnvelope>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(envelope) => deliver(broker.as_ref(), &envelope).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("callback delivery task stopped");
        });

        Self { sender, cancel }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl FlowContextMessenger for ChannelMessenger {
    async fn send_callback(
        &self,
        callback: &FlowCallback,
        contexts: Vec<FlowContext>,
    ) -> Result<(), FlowError> {
        self.sender
            .send(CallbackEnvelope {
                callback: callback.clone(),
                contexts,
            })
            .map_err(|e| FlowError::System(format!("messenger closed: {}", e)))
    }
}

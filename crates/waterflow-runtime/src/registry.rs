use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use waterflow_core::services::{BrokerClient, RemoteHandler};
use waterflow_core::HandlerError;

/// Metadata about a registered handler
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub description: String,
    pub category: String,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

impl HandlerMetadata {
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
        }
    }
}

/// In-process broker: remote handlers registered by id
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RemoteHandler>>,
    metadata: HashMap<String, HandlerMetadata>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Register a handler under its own id
    pub fn register(&mut self, handler: Arc<dyn RemoteHandler>) {
        self.register_with(handler, HandlerMetadata::default());
    }

    pub fn register_with(&mut self, handler: Arc<dyn RemoteHandler>, metadata: HandlerMetadata) {
        let id = handler.id().to_string();
        tracing::info!("Registering handler: {}", id);
        self.metadata.insert(id.clone(), metadata);
        self.handlers.insert(id, handler);
    }

    /// Get all registered handler ids, sorted
    pub fn list_handlers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_metadata(&self, id: &str) -> Option<HandlerMetadata> {
        self.metadata.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for HandlerRegistry {
    async fn resolve(&self, handler_id: &str) -> Result<Arc<dyn RemoteHandler>, HandlerError> {
        self.handlers
            .get(handler_id)
            .cloned()
            .ok_or_else(|| HandlerError::NotFound(handler_id.to_string()))
    }
}

use crate::FlowError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Lock key for one processing unit.
pub fn lock_key(stream_id: &str, node_id: &str, position: &str) -> String {
    format!("waterflow:{}:{}:{}", stream_id, node_id, position)
}

/// Distributed lock provider contract.
#[async_trait]
pub trait FlowLocks: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<(), FlowError>;

    async fn release(&self, key: &str) -> Result<(), FlowError>;
}

/// Process-local locks, one single-permit semaphore per key.
#[derive(Default)]
pub struct MemoryLocks {
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Result<Arc<Semaphore>, FlowError> {
        let mut slots = self.slots.lock().map_err(|e| FlowError::Lock {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone())
    }
}

#[async_trait]
impl FlowLocks for MemoryLocks {
    async fn acquire(&self, key: &str) -> Result<(), FlowError> {
        let slot = self.slot(key)?;
        let permit = slot.acquire().await.map_err(|e| FlowError::Lock {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        permit.forget();
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), FlowError> {
        let slot = self.slot(key)?;
        if slot.available_permits() == 0 {
            slot.add_permits(1);
        } else {
            tracing::warn!(key, "released a lock that was not held");
        }
        Ok(())
    }
}

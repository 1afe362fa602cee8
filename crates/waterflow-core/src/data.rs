use crate::ContextErrorInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys written into [`FlowData::context_data`].
pub mod keys {
    pub const NODE_ID: &str = "nodeId";
    pub const NODE_TYPE: &str = "nodeType";
    pub const STAGE: &str = "stage";
    pub const ERROR_INFO: &str = "errorInfo";
    pub const PARENT_INSTANCE_ID: &str = "parentInstanceId";
    pub const AWAITING_JOB: &str = "awaitingJob";
}

/// Business payload carried from node to node.
///
/// Nodes never mutate a `FlowData` they did not create: the `with_*`
/// helpers return a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowData {
    #[serde(default)]
    pub business_data: Map<String, Value>,
    #[serde(default)]
    pub context_data: Map<String, Value>,
    #[serde(default)]
    pub pass_data: Map<String, Value>,
    #[serde(default)]
    pub operator: String,
    pub start_time: DateTime<Utc>,
}

impl FlowData {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            business_data: Map::new(),
            context_data: Map::new(),
            pass_data: Map::new(),
            operator: operator.into(),
            start_time: Utc::now(),
        }
    }

    pub fn with_business(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.business_data.insert(key.into(), value.into());
        self
    }

    pub fn with_pass(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pass_data.insert(key.into(), value.into());
        self
    }

    pub fn with_context(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut copy = self.clone();
        copy.context_data.insert(key.into(), value.into());
        copy
    }

    pub fn without_context(&self, key: &str) -> Self {
        let mut copy = self.clone();
        copy.context_data.remove(key);
        copy
    }

    pub fn with_business_data(&self, business_data: Map<String, Value>) -> Self {
        let mut copy = self.clone();
        copy.business_data = business_data;
        copy
    }

    /// Copy with the node trace metadata stamped into the context data.
    pub fn stamped(&self, node_id: &str, node_type: &str, stage: &str) -> Self {
        let mut copy = self.clone();
        copy.context_data
            .insert(keys::NODE_ID.to_string(), Value::String(node_id.to_string()));
        copy.context_data
            .insert(keys::NODE_TYPE.to_string(), Value::String(node_type.to_string()));
        copy.context_data
            .insert(keys::STAGE.to_string(), Value::String(stage.to_string()));
        copy
    }

    /// Copy recording the node that last handled the data.
    pub fn with_node(&self, node_id: &str, node_type: &str) -> Self {
        let mut copy = self.clone();
        copy.context_data
            .insert(keys::NODE_ID.to_string(), Value::String(node_id.to_string()));
        copy.context_data
            .insert(keys::NODE_TYPE.to_string(), Value::String(node_type.to_string()));
        copy
    }

    /// Overlay `updates` onto the business data, keeping untouched fields.
    pub fn merged_business(&self, updates: &Map<String, Value>) -> Self {
        let mut copy = self.clone();
        for (key, value) in updates {
            copy.business_data.insert(key.clone(), value.clone());
        }
        copy
    }

    pub fn business(&self, key: &str) -> Option<&Value> {
        self.business_data.get(key)
    }

    pub fn error_info(&self) -> Option<ContextErrorInfo> {
        self.context_data
            .get(keys::ERROR_INFO)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn with_error_info(&self, info: &ContextErrorInfo) -> Self {
        let value = serde_json::to_value(info).unwrap_or(Value::Null);
        self.with_context(keys::ERROR_INFO, value)
    }

    /// Handler of the asynchronous job currently holding the context.
    pub fn awaiting_job(&self) -> Option<&str> {
        self.context_data.get(keys::AWAITING_JOB).and_then(Value::as_str)
    }

    pub fn parent_instance_id(&self) -> Option<&str> {
        self.context_data
            .get(keys::PARENT_INSTANCE_ID)
            .and_then(Value::as_str)
    }
}

impl Default for FlowData {
    fn default() -> Self {
        Self::new("")
    }
}

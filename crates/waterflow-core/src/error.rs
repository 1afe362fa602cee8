use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error codes recorded on terminal contexts.
pub mod codes {
    pub const SYSTEM_ERROR: i32 = 10007500;
    pub const OPERATION_NOT_SUPPORTED: i32 = 10007501;
    pub const JOB_INVOCATION_FAILED: i32 = 10007502;
    pub const HANDLER_NOT_FOUND: i32 = 10007503;
    pub const CONDITION_RULE_FAILED: i32 = 10007504;
    pub const CONTEXT_TYPE_MISMATCH: i32 = 10007505;
    pub const JOB_TIMEOUT: i32 = 10007506;
    pub const INVALID_DEFINITION: i32 = 10007507;
}

/// Classification consumed by the error-handling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// An operation the node type does not support. Programmer error.
    Structural,
    /// A remote job call failed.
    JobInvocation,
    /// A branch rule failed to parse or evaluate.
    Condition,
    /// Context data had an unexpected shape.
    Contract,
    /// Anything else.
    System,
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("job '{handler}' failed: {source}")]
    Job {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("condition '{expression}' failed: {message}")]
    Condition { expression: String, message: String },

    #[error("unexpected context data: {0}")]
    Contract(String),

    #[error("invalid flow definition: {0}")]
    Definition(String),

    #[error("flow node not found: {0}")]
    NodeNotFound(String),

    #[error("flow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("no blocked node at position: {0}")]
    NotBlocked(String),

    #[error("lock '{key}' failed: {message}")]
    Lock { key: String, message: String },

    #[error("context persistence failed: {0}")]
    Repository(String),

    #[error("timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(String),
}

impl FlowError {
    pub fn unsupported(operation: impl Into<String>) -> Self {
        FlowError::Unsupported(operation.into())
    }

    pub fn job(handler: impl Into<String>, source: HandlerError) -> Self {
        FlowError::Job {
            handler: handler.into(),
            source,
        }
    }

    pub fn condition(expression: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Condition {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Unsupported(_) => ErrorKind::Structural,
            FlowError::Job { .. } => ErrorKind::JobInvocation,
            FlowError::Condition { .. } => ErrorKind::Condition,
            FlowError::Contract(_) | FlowError::Serialization(_) => ErrorKind::Contract,
            _ => ErrorKind::System,
        }
    }

    /// The code recorded on a context that terminates with this error.
    pub fn code(&self) -> i32 {
        match self {
            FlowError::Unsupported(_) => codes::OPERATION_NOT_SUPPORTED,
            FlowError::Job { source, .. } => source.code(),
            FlowError::Condition { .. } => codes::CONDITION_RULE_FAILED,
            FlowError::Contract(_) | FlowError::Serialization(_) => codes::CONTEXT_TYPE_MISMATCH,
            FlowError::Definition(_) => codes::INVALID_DEFINITION,
            _ => codes::SYSTEM_ERROR,
        }
    }

    /// Only job failures may be retried, and only when the handler exists.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlowError::Job { source, .. } => !matches!(source, HandlerError::NotFound(_)),
            _ => false,
        }
    }

    /// Auxiliary diagnostic properties, e.g. the failing handler id.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        match self {
            FlowError::Job { handler, .. } => {
                props.insert("fitableId".to_string(), handler.clone());
            }
            FlowError::Condition { expression, .. } => {
                props.insert("conditionRule".to_string(), expression.clone());
            }
            _ => {}
        }
        props
    }
}

/// Failure of a remote handler resolution or invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandlerError {
    #[error("handler not found: {0}")]
    NotFound(String),

    #[error("remote failure {code}: {message}")]
    Failed { code: i32, message: String },

    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl HandlerError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            HandlerError::NotFound(_) => codes::HANDLER_NOT_FOUND,
            HandlerError::Failed { code, .. } => *code,
            HandlerError::Timeout { .. } => codes::JOB_TIMEOUT,
            HandlerError::Payload(_) => codes::CONTEXT_TYPE_MISMATCH,
            HandlerError::Transport(_) => codes::JOB_INVOCATION_FAILED,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HandlerError::NotFound(_))
    }
}

/// Structured error attached to a context that ended in `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextErrorInfo {
    pub error_code: i32,
    pub error_message: String,
    pub node_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ContextErrorInfo {
    pub fn from_error(error: &FlowError, node_name: impl Into<String>) -> Self {
        Self {
            error_code: error.code(),
            error_message: error.to_string(),
            node_name: node_name.into(),
            properties: error.properties(),
        }
    }
}

//! Core abstractions for the waterflow engine
//!
//! Context model, error taxonomy, the push-based stage primitives every
//! flow node is built from, and the collaborator contracts (persistence,
//! locks, messenger, broker) the engine consumes.

mod context;
mod data;
mod error;
pub mod events;
mod retry;
pub mod services;
pub mod stream;

pub use context::{FlowContext, FlowNodeStatus, ParallelMode, ParallelScope};
pub use data::{keys, FlowData};
pub use error::{codes, ContextErrorInfo, ErrorKind, FlowError, HandlerError};
pub use events::{EngineEvent, EventBus, StageEmitter};
pub use retry::{RetryConfig, RetryPolicy};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

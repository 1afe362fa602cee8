//! Flow execution runtime
//!
//! This crate turns a declarative node/edge definition into a running
//! pipeline of stages, invokes jobs through the broker and exposes the
//! engine entry points (`offer`, `resume`, `retry`, `complete_job`).

mod callbacks;
mod definition;
mod engine;
mod error_handler;
mod expression;
mod filter;
mod flow;
mod jober;
mod nodes;
mod notify;
mod registry;
mod spec;

pub use definition::{FlowDefinition, FlowEvent, FlowNode, NodeKind, DEFAULT_PARENT_EXCEPTION_HANDLER};
pub use engine::{EngineConfig, FlowEngine, ResumeRequest};
pub use expression::ExpressionEvaluator;
pub use flow::{Flow, FlowServices};
pub use jober::{apply_results, FlowJober, JobToken};
pub use registry::{HandlerMetadata, HandlerRegistry};
pub use spec::{
    EventSpec, FilterSpec, FlowSpec, JobMode, JoberSpec, NodeSpec, NodeType, TaskSpec, TriggerMode,
};

//! Built-in remote handlers
//!
//! Handlers invoked through the broker by jobs, callbacks and exception
//! notifications, plus an HTTP-backed broker for handlers living in other
//! processes.

mod debug;
mod http;
mod time;
mod transform;

pub use debug::DebugHandler;
pub use http::{HttpBroker, HttpRequestHandler};
pub use time::DelayHandler;
pub use transform::{JsonParseHandler, JsonStringifyHandler, SetFieldsHandler};

use serde_json::{Map, Value};
use std::sync::Arc;
use waterflow_runtime::{HandlerMetadata, HandlerRegistry};

/// Register all built-in handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register_with(
        Arc::new(DebugHandler),
        HandlerMetadata::new("debug", "Logs its arguments and passes data through"),
    );
    registry.register_with(
        Arc::new(DelayHandler),
        HandlerMetadata::new("time", "Waits `delayMs` milliseconds"),
    );
    registry.register_with(
        Arc::new(SetFieldsHandler),
        HandlerMetadata::new("transform", "Sets the `fields` object on every context"),
    );
    registry.register_with(
        Arc::new(JsonParseHandler),
        HandlerMetadata::new("transform", "Parses a JSON string business field"),
    );
    registry.register_with(
        Arc::new(JsonStringifyHandler),
        HandlerMetadata::new("transform", "Serializes a business field to a JSON string"),
    );
    registry.register_with(
        Arc::new(HttpRequestHandler::new()),
        HandlerMetadata::new("http", "Makes an HTTP request"),
    );
}

/// Flow data items of a job invocation (`args[0]`).
pub(crate) fn job_data(args: &[Value]) -> &[Value] {
    args.first()
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Job properties (`args[1]`).
pub(crate) fn job_properties(args: &[Value]) -> Map<String, Value> {
    args.get(1)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

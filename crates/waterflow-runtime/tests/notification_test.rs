mod common;

use common::{contexts_at, engine, init_tracing, recorder, wait_for, TIMEOUT};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use waterflow_core::services::{FlowCallback, FnHandler, RemoteHandler};
use waterflow_core::{keys, FlowData, FlowNodeStatus, HandlerError};
use waterflow_runtime::{FlowSpec, HandlerRegistry, JoberSpec, NodeSpec, TaskSpec};

fn callback(name: &str, handler: &str) -> FlowCallback {
    FlowCallback {
        name: name.to_string(),
        handlers: vec![handler.to_string()],
        ..FlowCallback::default()
    }
}

#[tokio::test]
async fn test_terminal_error_notifies_node_definition_and_parent_handlers() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FnHandler::new("broken.job", |_args: Vec<Value>| {
        async move { Err(HandlerError::failed(77, "nope")) }.boxed()
    })));
    let (node_handler, node_calls) = recorder("node.handler", Value::Null);
    let (def_handler, def_calls) = recorder("def.handler", Value::Null);
    let (parent_handler, parent_calls) = recorder("parent.handler", Value::Null);
    registry.register(node_handler);
    registry.register(def_handler);
    registry.register(parent_handler);
    let engine = engine(registry);

    let mut spec = FlowSpec::new("child", "Child")
        .with_exception_handler("def.handler")
        .with_exception_handler("node.handler")
        .with_property("parentExceptionHandler", "parent.handler");
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(
        NodeSpec::state("fail")
            .with_jober(JoberSpec::new("broken.job"))
            .with_retry(0, 0)
            .with_exception_handler("node.handler")
            .with_exception_handler("ghost.handler"),
    );
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "fail");
    spec.connect("fail", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let child = FlowData::new("op").with_context(keys::PARENT_INSTANCE_ID, "parent-1");
    let orphan = FlowData::new("op");
    let trace_id = engine.offer(&stream_id, vec![child, orphan]).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let failed = contexts_at(&engine, &stream_id, &trace_id, "fail", FlowNodeStatus::Error).await;
    assert_eq!(failed.len(), 2);

    // Handlers are told once the node lock is released.
    let notified = wait_for(|| {
        let (node_calls, def_calls, parent_calls) = (node_calls.clone(), def_calls.clone(), parent_calls.clone());
        async move { node_calls.len() == 1 && def_calls.len() == 1 && parent_calls.len() == 1 }
    })
    .await;
    assert!(notified);

    // Declared on both the node and the definition: called once.
    let calls = node_calls.all();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].as_array().map(Vec::len), Some(2));
    assert_eq!(calls[0][1]["errorCode"], json!(77));
    assert_eq!(calls[0][2], json!("fail"));
    assert_eq!(def_calls.len(), 1);

    let parents = parent_calls.all();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0][0], json!("parent-1"));
    assert_eq!(parents[0][1].as_array().map(Vec::len), Some(1));
    assert_eq!(parents[0][2]["errorCode"], json!(77));
}

#[tokio::test]
async fn test_callbacks_trace_every_stage() {
    init_tracing();
    let (trace_cb, trace_calls) = recorder("trace.cb", Value::Null);
    let (node_cb, node_calls) = recorder("node.cb", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(trace_cb);
    registry.register(node_cb);
    let engine = engine(registry);

    let mut spec = FlowSpec::new("traced", "Traced").with_callback(callback("trace", "trace.cb"));
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(NodeSpec::state("work").with_callback(callback("work-done", "node.cb")));
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "work");
    spec.connect("work", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    // Node callback runs inline before the successor is fed.
    let calls = node_calls.all();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0][0]["status"], json!("ARCHIVED"));

    // before + after + completion, for each of the three stages.
    let delivered = wait_for(|| {
        let trace_calls = trace_calls.clone();
        async move { trace_calls.len() == 9 }
    })
    .await;
    assert!(delivered);

    let stages: Vec<(String, String)> = trace_calls
        .all()
        .iter()
        .filter_map(|args| {
            let ctx = &args[0][0]["data"]["contextData"];
            Some((ctx["nodeId"].as_str()?.to_string(), ctx["stage"].as_str()?.to_string()))
        })
        .collect();
    for node in ["start", "work", "end"] {
        assert!(stages.contains(&(node.to_string(), "before".to_string())));
        assert!(stages.contains(&(node.to_string(), "after".to_string())));
    }
}

#[tokio::test]
async fn test_manual_task_handler_is_told_about_parked_contexts() {
    init_tracing();
    let (task_center, task_calls) = recorder("task.center", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(task_center);
    let engine = engine(registry);

    let task = TaskSpec {
        task_id: "approve-order".to_string(),
        handler: Some("task.center".to_string()),
        ..TaskSpec::default()
    };
    let mut spec = FlowSpec::new("tasks", "Tasks");
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(NodeSpec::state("approve").manual().with_task(task));
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "approve");
    spec.connect("approve", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    let notified = wait_for(|| {
        let task_calls = task_calls.clone();
        async move { task_calls.len() == 1 }
    })
    .await;
    assert!(notified);

    let args = &task_calls.all()[0];
    assert_eq!(args[0]["taskId"], json!("approve-order"));
    assert_eq!(args[2], json!("approve"));
    let parked = contexts_at(&engine, &stream_id, &trace_id, "approve", FlowNodeStatus::Pending).await;
    assert_eq!(args[1][0]["id"], json!(parked[0].id));
}

#[tokio::test]
async fn test_slow_exception_handler_does_not_hold_the_node() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FnHandler::new("picky.job", |args: Vec<Value>| {
        let fail = args[0][0]["businessData"]["fail"] == json!(true);
        async move {
            if fail {
                Err(HandlerError::failed(12, "rejected"))
            } else {
                Ok(Value::Null)
            }
        }
        .boxed()
    })));
    let release = Arc::new(Notify::new());
    let (seen, seen_calls) = recorder("seen.handler", Value::Null);
    let gate = release.clone();
    registry.register(seen.clone());
    registry.register(Arc::new(FnHandler::new("slow.handler", move |args: Vec<Value>| {
        let gate = gate.clone();
        let seen = seen.clone();
        async move {
            seen.invoke(args).await?;
            gate.notified().await;
            Ok::<Value, HandlerError>(Value::Null)
        }
        .boxed()
    })));
    let engine = engine(registry);

    let mut spec = FlowSpec::new("slow-notify", "Slow notify");
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(
        NodeSpec::state("work")
            .with_jober(JoberSpec::new("picky.job"))
            .with_retry(0, 0)
            .with_exception_handler("slow.handler"),
    );
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "work");
    spec.connect("work", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let bad = engine
        .offer(&stream_id, vec![FlowData::new("op").with_business("fail", true)])
        .await
        .unwrap();
    let called = wait_for(|| {
        let seen_calls = seen_calls.clone();
        async move { seen_calls.len() == 1 }
    })
    .await;
    assert!(called);

    let good = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    engine.settle(&stream_id, &good, Duration::from_secs(2)).await.unwrap();
    let archived = contexts_at(&engine, &stream_id, &good, "end", FlowNodeStatus::Archived).await;
    assert_eq!(archived.len(), 1);

    release.notify_waiters();
    let failed = contexts_at(&engine, &stream_id, &bad, "work", FlowNodeStatus::Error).await;
    assert_eq!(failed.len(), 1);
}

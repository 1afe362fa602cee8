mod common;

use common::{contexts_at, engine, init_tracing, recorder, wait_for, TIMEOUT};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use waterflow_core::services::{FlowCallback, FnHandler};
use waterflow_core::{FlowData, FlowNodeStatus, HandlerError};
use waterflow_runtime::{FilterSpec, FlowSpec, HandlerRegistry, JobToken, JoberSpec, NodeSpec};

fn single_state(meta_id: &str, state: NodeSpec) -> FlowSpec {
    let mut spec = FlowSpec::new(meta_id, meta_id);
    let state_id = state.meta_id.clone();
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(state);
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", state_id.clone());
    spec.connect(state_id, "end");
    spec
}

#[tokio::test]
async fn test_async_job_completes_out_of_band() {
    init_tracing();
    let tokens: Arc<Mutex<Vec<JobToken>>> = Arc::default();
    let seen = tokens.clone();
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FnHandler::new("async.job", move |args: Vec<Value>| {
        let token = serde_json::from_value::<JobToken>(args[2].clone());
        let seen = seen.clone();
        async move {
            match token {
                Ok(token) => {
                    seen.lock().unwrap().push(token);
                    Ok(Value::Null)
                }
                Err(e) => Err(HandlerError::Payload(e.to_string())),
            }
        }
        .boxed()
    })));
    let engine = engine(registry);
    let spec = single_state(
        "async",
        NodeSpec::state("approve").with_jober(JoberSpec::new("async.job").asynchronous()),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    let submitted = wait_for(|| {
        let tokens = tokens.clone();
        async move {
            let count = tokens.lock().unwrap().len();
            count > 0
        }
    })
    .await;
    assert!(submitted);

    let held = contexts_at(&engine, &stream_id, &trace_id, "approve", FlowNodeStatus::Pending).await;
    assert_eq!(held.len(), 1);
    let token = tokens.lock().unwrap()[0].clone();
    assert_eq!(token.position, "approve");
    assert_eq!(token.context_ids, vec![held[0].id.clone()]);

    let mut result = Map::new();
    result.insert("approved".to_string(), json!(true));
    assert_eq!(engine.complete_job(token, Ok(vec![result])).await.unwrap(), 1);
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let archived = contexts_at(&engine, &stream_id, &trace_id, "end", FlowNodeStatus::Archived).await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].data.business("approved"), Some(&json!(true)));
}

#[tokio::test]
async fn test_async_job_failure_is_recorded() {
    init_tracing();
    let (job, calls) = recorder("async.job", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(job);
    let engine = engine(registry);
    let spec = single_state(
        "async-fail",
        NodeSpec::state("approve")
            .with_jober(JoberSpec::new("async.job").asynchronous())
            .with_retry(0, 0),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    let submitted = wait_for(|| {
        let calls = calls.clone();
        async move { calls.len() == 1 }
    })
    .await;
    assert!(submitted);
    let token: JobToken = serde_json::from_value(calls.all()[0][2].clone()).unwrap();

    let failure = HandlerError::failed(31, "worker crashed");
    engine.complete_job(token, Err(failure)).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let failed = contexts_at(&engine, &stream_id, &trace_id, "approve", FlowNodeStatus::Error).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].data.error_info().unwrap().error_code, 31);
}

#[tokio::test]
async fn test_job_timeout_counts_as_job_failure() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(FnHandler::new("sleepy.job", |_args: Vec<Value>| {
        async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Value::Null)
        }
        .boxed()
    })));
    let engine = engine(registry);
    let spec = single_state(
        "timeout",
        NodeSpec::state("call")
            .with_jober(JoberSpec::new("sleepy.job").with_timeout(20))
            .with_retry(0, 0),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let failed = contexts_at(&engine, &stream_id, &trace_id, "call", FlowNodeStatus::Error).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].data.error_info().unwrap().error_code,
        waterflow_core::codes::JOB_TIMEOUT
    );
}

#[tokio::test]
async fn test_minimum_size_pre_filter_batches_arrivals() {
    init_tracing();
    let (job, calls) = recorder("batch.job", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(job);
    let engine = engine(registry);
    let spec = single_state(
        "batching",
        NodeSpec::state("batch")
            .with_jober(JoberSpec::new("batch.job"))
            .with_pre_filter(FilterSpec::MinimumSize { threshold: 2 }),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let first = engine.offer(&stream_id, vec![FlowData::new("a")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.len(), 0);
    assert_eq!(
        contexts_at(&engine, &stream_id, &first, "batch", FlowNodeStatus::Pending).await.len(),
        1
    );

    let second = engine.offer(&stream_id, vec![FlowData::new("b")]).await.unwrap();
    engine.settle(&stream_id, &first, TIMEOUT).await.unwrap();
    engine.settle(&stream_id, &second, TIMEOUT).await.unwrap();

    let batches: Vec<usize> = calls
        .all()
        .iter()
        .map(|args| args[0].as_array().map_or(0, Vec::len))
        .collect();
    assert_eq!(batches, vec![2]);
}

#[tokio::test]
async fn test_condition_post_filter_parks_non_matching_results() {
    init_tracing();
    let engine = engine(HandlerRegistry::new());
    let spec = single_state(
        "gated",
        NodeSpec::state("gate").with_post_filter(FilterSpec::Condition {
            expression: "businessData.amount > 10".to_string(),
        }),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let small = engine
        .offer(&stream_id, vec![FlowData::new("op").with_business("amount", 5)])
        .await
        .unwrap();
    let large = engine
        .offer(&stream_id, vec![FlowData::new("op").with_business("amount", 20)])
        .await
        .unwrap();
    engine.settle(&stream_id, &large, TIMEOUT).await.unwrap();

    let engine_ref = &engine;
    let stream_ref = stream_id.as_str();
    let small_ref = small.as_str();
    assert!(
        wait_for(|| async move {
            contexts_at(engine_ref, stream_ref, small_ref, "gate", FlowNodeStatus::Pending)
                .await
                .len()
                == 1
        })
        .await
    );
    assert!(contexts_at(&engine, &stream_id, &small, "end", FlowNodeStatus::Archived)
        .await
        .is_empty());
    assert_eq!(
        contexts_at(&engine, &stream_id, &large, "end", FlowNodeStatus::Archived).await.len(),
        1
    );
}

#[tokio::test]
async fn test_node_callback_waits_for_async_job_completion() {
    init_tracing();
    let (job, calls) = recorder("async.job", Value::Null);
    let (node_cb, callback_calls) = recorder("node.cb", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(job);
    registry.register(node_cb);
    let engine = engine(registry);
    let callback = FlowCallback {
        name: "approved".to_string(),
        handlers: vec!["node.cb".to_string()],
        ..FlowCallback::default()
    };
    let spec = single_state(
        "async-callback",
        NodeSpec::state("approve")
            .with_jober(JoberSpec::new("async.job").asynchronous())
            .with_callback(callback),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    let submitted = wait_for(|| {
        let calls = calls.clone();
        async move { calls.len() == 1 }
    })
    .await;
    assert!(submitted);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(callback_calls.len(), 0);

    let token: JobToken = serde_json::from_value(calls.all()[0][2].clone()).unwrap();
    engine.complete_job(token, Ok(vec![Map::new()])).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let delivered = callback_calls.all();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0][0][0]["status"], json!("ARCHIVED"));
}

#[tokio::test]
async fn test_size_pre_filter_leaves_async_held_contexts_alone() {
    init_tracing();
    let (job, calls) = recorder("async.job", Value::Null);
    let mut registry = HandlerRegistry::new();
    registry.register(job);
    let engine = engine(registry);
    let spec = single_state(
        "async-batching",
        NodeSpec::state("approve")
            .with_jober(JoberSpec::new("async.job").asynchronous())
            .with_pre_filter(FilterSpec::MinimumSize { threshold: 1 }),
    );
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let first = engine.offer(&stream_id, vec![FlowData::new("a")]).await.unwrap();
    let submitted = wait_for(|| {
        let calls = calls.clone();
        async move { calls.len() == 1 }
    })
    .await;
    assert!(submitted);

    let second = engine.offer(&stream_id, vec![FlowData::new("b")]).await.unwrap();
    let submitted = wait_for(|| {
        let calls = calls.clone();
        async move { calls.len() == 2 }
    })
    .await;
    assert!(submitted);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let batches: Vec<usize> = calls
        .all()
        .iter()
        .map(|args| args[0].as_array().map_or(0, Vec::len))
        .collect();
    assert_eq!(batches, vec![1, 1]);

    for args in calls.all() {
        let token: JobToken = serde_json::from_value(args[2].clone()).unwrap();
        assert_eq!(engine.complete_job(token, Ok(vec![Map::new()])).await.unwrap(), 1);
    }
    for trace_id in [&first, &second] {
        engine.settle(&stream_id, trace_id, TIMEOUT).await.unwrap();
        let archived = contexts_at(&engine, &stream_id, trace_id, "end", FlowNodeStatus::Archived).await;
        assert_eq!(archived.len(), 1);
        assert!(archived[0].data.awaiting_job().is_none());
    }
}

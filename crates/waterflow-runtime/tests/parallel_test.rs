mod common;

use common::{contexts_at, engine, init_tracing, TIMEOUT};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use waterflow_core::services::FnHandler;
use waterflow_core::{codes, FlowData, FlowNodeStatus, ParallelMode};
use waterflow_runtime::{FlowEngine, FlowSpec, HandlerRegistry, JoberSpec, NodeSpec};

fn delayed(id: &str, key: &'static str, millis: u64) -> Arc<FnHandler> {
    Arc::new(FnHandler::new(id, move |_args: Vec<Value>| {
        async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!({ key: true }))
        }
        .boxed()
    }))
}

async fn fan_out_engine(mode: ParallelMode) -> (FlowEngine, String) {
    let mut registry = HandlerRegistry::new();
    registry.register(delayed("fast.job", "fast", 0));
    registry.register(delayed("slow.job", "slow", 300));
    let engine = engine(registry);

    let mut spec = FlowSpec::new("fan-out", "Fan out");
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(NodeSpec::parallel("split", mode));
    spec.add_node(NodeSpec::fork("left"));
    spec.add_node(NodeSpec::fork("right"));
    spec.add_node(NodeSpec::state("fast").with_jober(JoberSpec::new("fast.job")));
    spec.add_node(NodeSpec::state("slow").with_jober(JoberSpec::new("slow.job")));
    spec.add_node(NodeSpec::join("join"));
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "split");
    spec.connect("split", "left");
    spec.connect("split", "right");
    spec.connect("left", "fast");
    spec.connect("right", "slow");
    spec.connect("fast", "join");
    spec.connect("slow", "join");
    spec.connect("join", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();
    (engine, stream_id)
}

#[tokio::test]
async fn test_join_all_waits_for_the_slow_branch() {
    init_tracing();
    let (engine, stream_id) = fan_out_engine(ParallelMode::All).await;

    let trace_id = engine
        .offer(&stream_id, vec![FlowData::new("op").with_business("order", 7)])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(contexts_at(&engine, &stream_id, &trace_id, "end", FlowNodeStatus::Archived)
        .await
        .is_empty());
    let waiting = contexts_at(&engine, &stream_id, &trace_id, "join", FlowNodeStatus::Pending).await;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].branch(), Some("left"));

    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();
    let archived = contexts_at(&engine, &stream_id, &trace_id, "end", FlowNodeStatus::Archived).await;
    assert_eq!(archived.len(), 1);
    let merged = &archived[0];
    assert_eq!(merged.data.business("fast"), Some(&json!(true)));
    assert_eq!(merged.data.business("slow"), Some(&json!(true)));
    assert_eq!(merged.data.business("order"), Some(&json!(7)));
    assert!(merged.parallel.is_empty());
}

#[tokio::test]
async fn test_join_any_forwards_the_first_branch_only() {
    init_tracing();
    let (engine, stream_id) = fan_out_engine(ParallelMode::Any).await;

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let archived = contexts_at(&engine, &stream_id, &trace_id, "end", FlowNodeStatus::Archived).await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].data.business("fast"), Some(&json!(true)));
    assert!(archived[0].data.business("slow").is_none());

    // The late branch is consumed at the join.
    let joined = contexts_at(&engine, &stream_id, &trace_id, "join", FlowNodeStatus::Archived).await;
    assert_eq!(joined.len(), 2);
}

#[tokio::test]
async fn test_join_merges_trace_ids_of_each_group_separately() {
    init_tracing();
    let (engine, stream_id) = fan_out_engine(ParallelMode::All).await;

    let first = engine.offer(&stream_id, vec![FlowData::new("a")]).await.unwrap();
    let second = engine.offer(&stream_id, vec![FlowData::new("b")]).await.unwrap();
    engine.settle(&stream_id, &first, TIMEOUT).await.unwrap();
    engine.settle(&stream_id, &second, TIMEOUT).await.unwrap();

    let a = contexts_at(&engine, &stream_id, &first, "end", FlowNodeStatus::Archived).await;
    let b = contexts_at(&engine, &stream_id, &second, "end", FlowNodeStatus::Archived).await;
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].data.operator, "a");
    assert_eq!(b[0].data.operator, "b");
    assert!(!a[0].has_trace(&second));
}

#[tokio::test]
async fn test_fork_outside_parallel_is_a_structural_error() {
    init_tracing();
    let engine = engine(HandlerRegistry::new());
    let mut spec = FlowSpec::new("bad-fork", "Bad fork");
    spec.add_node(NodeSpec::start("start"));
    spec.add_node(NodeSpec::fork("fork"));
    spec.add_node(NodeSpec::end("end"));
    spec.connect("start", "fork");
    spec.connect("fork", "end");
    let stream_id = engine.register(spec).await.unwrap().stream_id().to_string();

    let trace_id = engine.offer(&stream_id, vec![FlowData::new("op")]).await.unwrap();
    engine.settle(&stream_id, &trace_id, TIMEOUT).await.unwrap();

    let failed = contexts_at(&engine, &stream_id, &trace_id, "fork", FlowNodeStatus::Error).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].data.error_info().unwrap().error_code,
        codes::OPERATION_NOT_SUPPORTED
    );
}

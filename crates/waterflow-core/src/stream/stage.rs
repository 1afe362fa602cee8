use super::{
    Block, ContextFilter, ContextHook, ErrorCallback, ErrorOutcome, Produce, Production, Publisher,
    StageRole, Subscriber, Subscription, Whether,
};
use crate::events::StageEmitter;
use crate::services::{lock_key, ContextQuery, FlowContextRepo, FlowLocks};
use crate::{ContextErrorInfo, FlowContext, FlowError, FlowNodeStatus};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Collaborators every stage needs.
#[derive(Clone)]
pub struct StageDeps {
    pub repo: Arc<dyn FlowContextRepo>,
    pub locks: Arc<dyn FlowLocks>,
    pub emitter: StageEmitter,
}

/// Blocking strategy of a manual stage.
#[derive(Clone, Default)]
pub struct BlockStrategy {
    /// Invoked whenever contexts park at the stage.
    pub notify: Option<ContextHook>,
}

type Route = (Subscription, Vec<FlowContext>);

/// What a locked processing step leaves behind for the unlocked tail.
struct Step {
    claimed: usize,
    settled: Vec<FlowContext>,
    routes: Vec<Route>,
    forwarded: usize,
    started: Instant,
    succeeded: bool,
    failed: Vec<FlowContext>,
    readmit: Option<(String, Duration)>,
}

pub struct StageBuilder {
    stream_id: String,
    node_id: String,
    role: StageRole,
    produce: Produce,
    deps: StageDeps,
    pre_filter: Option<ContextFilter>,
    on_error: Option<ErrorCallback>,
    on_failed: Option<ContextHook>,
    on_complete: Vec<ContextHook>,
    global_before: Option<ContextHook>,
    global_after: Option<ContextHook>,
    block: Option<BlockStrategy>,
}

impl StageBuilder {
    pub fn pre_filter(mut self, filter: ContextFilter) -> Self {
        self.pre_filter = Some(filter);
        self
    }

    pub fn on_error(mut self, handler: ErrorCallback) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Hook receiving contexts that ended in `ERROR`, run after the node
    /// lock is released.
    pub fn on_failed(mut self, hook: ContextHook) -> Self {
        self.on_failed = Some(hook);
        self
    }

    pub fn on_complete(mut self, hook: ContextHook) -> Self {
        self.on_complete.push(hook);
        self
    }

    pub fn on_global_before(mut self, hook: ContextHook) -> Self {
        self.global_before = Some(hook);
        self
    }

    pub fn on_global_after(mut self, hook: ContextHook) -> Self {
        self.global_after = Some(hook);
        self
    }

    pub fn block(mut self, strategy: BlockStrategy) -> Self {
        self.block = Some(strategy);
        self
    }

    pub fn build(self) -> Arc<Stage> {
        Arc::new_cyclic(|this| Stage {
            this: this.clone(),
            stream_id: self.stream_id,
            node_id: self.node_id,
            role: self.role,
            produce: self.produce,
            deps: self.deps,
            pre_filter: self.pre_filter,
            on_error: self.on_error,
            on_failed: self.on_failed,
            on_complete: self.on_complete,
            global_before: self.global_before,
            global_after: self.global_after,
            block: self.block,
            subscriptions: RwLock::new(Vec::new()),
        })
    }
}

/// A node of a materialized flow.
pub struct Stage {
    this: Weak<Stage>,
    stream_id: String,
    node_id: String,
    role: StageRole,
    produce: Produce,
    deps: StageDeps,
    pre_filter: Option<ContextFilter>,
    on_error: Option<ErrorCallback>,
    on_failed: Option<ContextHook>,
    on_complete: Vec<ContextHook>,
    global_before: Option<ContextHook>,
    global_after: Option<ContextHook>,
    block: Option<BlockStrategy>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Stage {
    pub fn builder(
        stream_id: impl Into<String>,
        node_id: impl Into<String>,
        role: StageRole,
        produce: Produce,
        deps: StageDeps,
    ) -> StageBuilder {
        StageBuilder {
            stream_id: stream_id.into(),
            node_id: node_id.into(),
            role,
            produce,
            deps,
            pre_filter: None,
            on_error: None,
            on_failed: None,
            on_complete: Vec::new(),
            global_before: None,
            global_after: None,
            block: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }

    /// Resume handle of a manual stage. The stage pre-filter moves to the
    /// handle and is applied on resume.
    pub fn block_handle(&self) -> Option<Block> {
        self.block.as_ref().map(|_| {
            Block::new(self.node_id.clone(), self.this.clone(), self.pre_filter.clone())
        })
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        match self.subscriptions.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Filter then process an inbound batch.
    pub async fn admit(&self, contexts: Vec<FlowContext>) -> Result<usize, FlowError> {
        let contexts = match &self.pre_filter {
            Some(filter) => filter(contexts).await?,
            None => contexts,
        };
        self.process(contexts).await
    }

    /// Run the production function over the contexts that are still
    /// pending at this stage. Returns how many were claimed.
    pub async fn process(&self, contexts: Vec<FlowContext>) -> Result<usize, FlowError> {
        self.process_with(contexts, self.produce.clone()).await
    }

    /// Like [`Stage::process`], with a one-off production function. Used to
    /// settle contexts held by an asynchronous job.
    pub async fn process_with(
        &self,
        contexts: Vec<FlowContext>,
        produce: Produce,
    ) -> Result<usize, FlowError> {
        if contexts.is_empty() {
            return Ok(0);
        }

        let key = lock_key(&self.stream_id, &self.node_id, &self.node_id);
        self.deps.locks.acquire(&key).await?;
        let step = AssertUnwindSafe(self.run_locked(contexts, produce))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(FlowError::System(format!("stage {} panicked", self.node_id))));
        let released = self.deps.locks.release(&key).await;
        let step = step?;
        released?;

        match step {
            Some(step) => {
                let claimed = step.claimed;
                self.finish(step).await;
                Ok(claimed)
            }
            None => Ok(0),
        }
    }

    /// Move the `RETRYABLE` batch back to pending and process it again.
    pub fn readmit(self: Arc<Self>, to_batch: String) -> BoxFuture<'static, Result<usize, FlowError>> {
        async move {
            let query = ContextQuery::stream(&self.stream_id)
                .node(&self.node_id)
                .status(FlowNodeStatus::Retryable)
                .to_batch(&to_batch);
            let mut contexts = self.deps.repo.query(&query).await?;
            if contexts.is_empty() {
                return Ok(0);
            }
            for ctx in contexts.iter_mut() {
                ctx.set_status(FlowNodeStatus::Pending);
            }
            self.deps.repo.update(&contexts).await?;
            tracing::info!(
                stream_id = %self.stream_id,
                node_id = %self.node_id,
                to_batch = %to_batch,
                count = contexts.len(),
                "Re-admitting retry batch"
            );
            self.process(contexts).await
        }
        .boxed()
    }

    async fn run_locked(
        &self,
        contexts: Vec<FlowContext>,
        produce: Produce,
    ) -> Result<Option<Step>, FlowError> {
        let ids: Vec<String> = contexts.iter().map(|c| c.id.clone()).collect();
        let mut claimed: Vec<FlowContext> = self
            .deps
            .repo
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::Pending && c.position == self.node_id)
            .collect();
        if claimed.is_empty() {
            tracing::debug!(node_id = %self.node_id, "Nothing pending to claim");
            return Ok(None);
        }
        for ctx in claimed.iter_mut() {
            ctx.set_status(FlowNodeStatus::Processing);
        }
        self.deps.repo.update(&claimed).await?;

        if let Some(hook) = &self.global_before {
            hook(claimed.clone()).await;
        }
        self.deps.emitter.started(&claimed);

        let started = Instant::now();
        let produced = AssertUnwindSafe(produce(claimed.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::System(panic_message(&self.node_id, panic.as_ref()))))
            .and_then(|production| self.route(production, &claimed));

        match produced {
            Ok((settled, routes)) => {
                let forwarded: Vec<FlowContext> =
                    routes.iter().flat_map(|(_, batch)| batch.iter().cloned()).collect();
                self.deps.repo.save(&forwarded).await?;
                self.deps.repo.update(&settled).await?;
                Ok(Some(Step {
                    claimed: claimed.len(),
                    settled,
                    routes,
                    forwarded: forwarded.len(),
                    started,
                    succeeded: true,
                    failed: Vec::new(),
                    readmit: None,
                }))
            }
            Err(error) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    node_id = %self.node_id,
                    error = %error,
                    "Production failed"
                );
                let outcome = match &self.on_error {
                    Some(handler) => handler(error, claimed.clone()).await,
                    None => self.fail_all(&error, claimed.clone()),
                };
                self.deps.repo.update(outcome.contexts()).await?;
                let (settled, failed, readmit) = match outcome {
                    ErrorOutcome::Retrying {
                        contexts,
                        to_batch,
                        delay,
                    } => {
                        self.deps.emitter.retrying(&contexts, &to_batch);
                        (contexts, Vec::new(), delay.map(|d| (to_batch, d)))
                    }
                    ErrorOutcome::Failed { contexts } => {
                        if let Some(info) = contexts.first().and_then(|c| c.data.error_info()) {
                            self.deps.emitter.failed(&contexts, info);
                        }
                        (contexts.clone(), contexts, None)
                    }
                };
                Ok(Some(Step {
                    claimed: claimed.len(),
                    settled,
                    routes: Vec::new(),
                    forwarded: 0,
                    started,
                    succeeded: false,
                    failed,
                    readmit,
                }))
            }
        }
    }

    /// Default outcome without an error callback: everything fails.
    fn fail_all(&self, error: &FlowError, contexts: Vec<FlowContext>) -> ErrorOutcome {
        let info = ContextErrorInfo::from_error(error, &self.node_id);
        let contexts = contexts
            .into_iter()
            .map(|ctx| {
                let mut failed = ctx.with_data(ctx.data.with_error_info(&info));
                failed.set_status(FlowNodeStatus::Error);
                failed
            })
            .collect();
        ErrorOutcome::Failed { contexts }
    }

    /// Split a production into settled inputs and per-edge successor batches.
    fn route(
        &self,
        production: Production,
        claimed: &[FlowContext],
    ) -> Result<(Vec<FlowContext>, Vec<Route>), FlowError> {
        let Production {
            consumed,
            held,
            outputs,
        } = production;

        let batch_id = Uuid::new_v4().to_string();
        let mut routes: Vec<Route> = self
            .subscriptions()
            .into_iter()
            .map(|sub| (sub, Vec::new()))
            .collect();
        for output in &outputs {
            let mut accepted = false;
            for (sub, batch) in routes.iter_mut() {
                if sub.accepts(output)? {
                    batch.push(output.generate(&sub.target_id, &batch_id));
                    accepted = true;
                }
            }
            if !accepted {
                return Err(FlowError::condition(
                    format!("edges of {}", self.node_id),
                    format!("no outgoing edge accepts context {}", output.id),
                ));
            }
        }
        routes.retain(|(_, batch)| !batch.is_empty());

        let mut settled = Vec::new();
        let mut accounted = HashSet::new();
        for mut ctx in held {
            if accounted.insert(ctx.id.clone()) {
                ctx.set_status(FlowNodeStatus::Pending);
                settled.push(ctx);
            }
        }
        for mut ctx in consumed {
            if accounted.insert(ctx.id.clone()) {
                ctx.set_status(FlowNodeStatus::Archived);
                settled.push(ctx);
            }
        }
        // Contexts the production did not account for are consumed.
        for ctx in claimed {
            if !accounted.contains(&ctx.id) {
                let mut ctx = ctx.clone();
                ctx.set_status(FlowNodeStatus::Archived);
                settled.push(ctx);
            }
        }
        Ok((settled, routes))
    }

    async fn finish(&self, step: Step) {
        let Step {
            settled,
            routes,
            forwarded,
            started,
            succeeded,
            failed,
            readmit,
            ..
        } = step;

        if let Some(hook) = &self.global_after {
            hook(settled.clone()).await;
        }
        if !failed.is_empty() {
            if let Some(hook) = &self.on_failed {
                hook(failed).await;
            }
        }
        // Contexts held back to pending have not completed yet.
        let completed: Vec<FlowContext> = settled
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    FlowNodeStatus::Archived | FlowNodeStatus::Error | FlowNodeStatus::Retryable
                )
            })
            .cloned()
            .collect();
        if !completed.is_empty() {
            for hook in &self.on_complete {
                hook(completed.clone()).await;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if succeeded {
            self.deps.emitter.completed(&settled, forwarded, duration_ms);
        }
        if self.role == StageRole::Subscriber {
            let archived: Vec<FlowContext> = settled
                .iter()
                .filter(|c| c.status == FlowNodeStatus::Archived)
                .cloned()
                .collect();
            if !archived.is_empty() {
                self.deps.emitter.archived(&archived);
            }
        }

        tracing::debug!(
            stream_id = %self.stream_id,
            node_id = %self.node_id,
            settled = settled.len(),
            forwarded,
            duration_ms,
            "Stage step finished"
        );

        for (sub, batch) in routes {
            match sub.target() {
                Some(target) => {
                    tokio::spawn(async move { target.on_next(batch).await });
                }
                None => tracing::error!(
                    node_id = %self.node_id,
                    edge_id = %sub.edge_id,
                    "Subscriber of edge is gone, contexts stay pending at {}",
                    sub.target_id
                ),
            }
        }

        if let Some((to_batch, delay)) = readmit {
            self.schedule_readmit(to_batch, delay);
        }
    }

    fn schedule_readmit(&self, to_batch: String, delay: Duration) {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(stage) = this.upgrade() else {
                return;
            };
            let node_id = stage.node_id.clone();
            if let Err(e) = stage.readmit(to_batch.clone()).await {
                tracing::error!(node_id = %node_id, to_batch = %to_batch, "Re-admission failed: {}", e);
            }
        });
    }
}

fn panic_message(node_id: &str, panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("production of {} panicked: {}", node_id, detail)
}

#[async_trait]
impl Subscriber for Stage {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn on_next(&self, contexts: Vec<FlowContext>) {
        if let Some(strategy) = &self.block {
            tracing::info!(
                stream_id = %self.stream_id,
                node_id = %self.node_id,
                count = contexts.len(),
                "Contexts parked at manual node"
            );
            self.deps.emitter.blocked(&contexts);
            if let Some(notify) = &strategy.notify {
                notify(contexts).await;
            }
            return;
        }

        if let Err(e) = self.admit(contexts).await {
            tracing::error!(
                stream_id = %self.stream_id,
                node_id = %self.node_id,
                "Processing failed: {}",
                e
            );
        }
    }
}

impl Publisher for Stage {
    fn subscribe(
        &self,
        edge_id: &str,
        subscriber: &Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Result<(), FlowError> {
        if self.role == StageRole::Subscriber {
            return Err(FlowError::unsupported(format!(
                "subscribe to terminal node {}",
                self.node_id
            )));
        }
        let mut subs = self
            .subscriptions
            .write()
            .map_err(|e| FlowError::System(e.to_string()))?;
        subs.push(Subscription::new(edge_id, subscriber, whether));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::services::{MemoryContextRepo, MemoryLocks};
    use crate::{FlowData, HandlerError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deps(repo: Arc<MemoryContextRepo>, node: &str) -> StageDeps {
        StageDeps {
            repo,
            locks: Arc::new(MemoryLocks::new()),
            emitter: EventBus::new(64).create_emitter("s", node),
        }
    }

    fn passthrough() -> Produce {
        Arc::new(|contexts| async move { Ok(Production::pass(contexts)) }.boxed())
    }

    fn terminal() -> Produce {
        Arc::new(|contexts| async move { Ok(Production::consume(contexts)) }.boxed())
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn seed(repo: &MemoryContextRepo, node: &str) -> FlowContext {
        let ctx = FlowContext::origin("s", node, "t", FlowData::new("op"));
        repo.save(&[ctx.clone()]).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_forwards_to_subscriber_and_archives_input() {
        let repo = Arc::new(MemoryContextRepo::new());
        let head = Stage::builder("s", "a", StageRole::Publisher, passthrough(), deps(repo.clone(), "a")).build();
        let tail = Stage::builder("s", "b", StageRole::Subscriber, terminal(), deps(repo.clone(), "b")).build();
        let tail_dyn: Arc<dyn Subscriber> = tail.clone();
        head.subscribe("e1", &tail_dyn, None).unwrap();

        let ctx = seed(&repo, "a").await;
        assert_eq!(head.process(vec![ctx.clone()]).await.unwrap(), 1);

        let query = ContextQuery::stream("s").node("b").status(FlowNodeStatus::Archived);
        for _ in 0..100 {
            if !repo.query(&query).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = repo.query(&query).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].previous.as_deref(), Some(ctx.id.as_str()));

        let origin = repo.get_by_ids(&[ctx.id]).await.unwrap();
        assert_eq!(origin[0].status, FlowNodeStatus::Archived);
    }

    #[tokio::test]
    async fn test_contexts_are_claimed_once() {
        let repo = Arc::new(MemoryContextRepo::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let produce: Produce = Arc::new(move |contexts| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Production::consume(contexts)) }.boxed()
        });
        let stage = Stage::builder("s", "a", StageRole::Subscriber, produce, deps(repo.clone(), "a")).build();
        let ctx = seed(&repo, "a").await;

        let (first, second) = tokio::join!(stage.process(vec![ctx.clone()]), stage.process(vec![ctx]));
        assert_eq!(first.unwrap() + second.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_output_takes_the_error_path() {
        let repo = Arc::new(MemoryContextRepo::new());
        let stage = Stage::builder("s", "a", StageRole::Processor, passthrough(), deps(repo.clone(), "a")).build();
        let sink = Stage::builder("s", "b", StageRole::Subscriber, terminal(), deps(repo.clone(), "b")).build();
        let sink_dyn: Arc<dyn Subscriber> = sink.clone();
        let never: Whether = Arc::new(|_| Ok(false));
        stage.subscribe("e1", &sink_dyn, Some(never)).unwrap();

        let ctx = seed(&repo, "a").await;
        stage.process(vec![ctx.clone()]).await.unwrap();

        let stored = repo.get_by_ids(&[ctx.id]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Error);
        let info = stored[0].data.error_info().expect("error info attached");
        assert_eq!(info.error_code, crate::error::codes::CONDITION_RULE_FAILED);
    }

    #[tokio::test]
    async fn test_retrying_outcome_is_readmitted_after_delay() {
        let repo = Arc::new(MemoryContextRepo::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let produce: Produce = Arc::new(move |contexts| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(FlowError::job("flaky", HandlerError::failed(1, "boom")))
                } else {
                    Ok(Production::consume(contexts))
                }
            }
            .boxed()
        });
        let on_error: ErrorCallback = Arc::new(|_, contexts| {
            async move {
                let contexts = contexts
                    .into_iter()
                    .map(|mut c| {
                        c.to_batch = Some("batch-1".into());
                        c.set_status(FlowNodeStatus::Retryable);
                        c
                    })
                    .collect();
                ErrorOutcome::Retrying {
                    contexts,
                    to_batch: "batch-1".into(),
                    delay: Some(Duration::from_millis(10)),
                }
            }
            .boxed()
        });
        let stage = Stage::builder("s", "a", StageRole::Subscriber, produce, deps(repo.clone(), "a"))
            .on_error(on_error)
            .build();
        let ctx = seed(&repo, "a").await;
        stage.process(vec![ctx.clone()]).await.unwrap();

        wait_for(|| attempts.load(Ordering::SeqCst) >= 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stored = repo.get_by_ids(&[ctx.id]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Archived);
        assert_eq!(stored[0].to_batch.as_deref(), Some("batch-1"));
    }

    #[tokio::test]
    async fn test_blocked_stage_leaves_contexts_pending() {
        let repo = Arc::new(MemoryContextRepo::new());
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = notified.clone();
        let notify: ContextHook = Arc::new(move |contexts| {
            seen.fetch_add(contexts.len(), Ordering::SeqCst);
            async {}.boxed()
        });
        let stage = Stage::builder("s", "review", StageRole::Subscriber, terminal(), deps(repo.clone(), "review"))
            .block(BlockStrategy { notify: Some(notify) })
            .build();
        let ctx = seed(&repo, "review").await;

        stage.on_next(vec![ctx.clone()]).await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        let stored = repo.get_by_ids(&[ctx.id.clone()]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Pending);

        let handle = stage.block_handle().expect("manual stage has a handle");
        assert_eq!(handle.process(vec![ctx.clone()]).await.unwrap(), 1);
        let stored = repo.get_by_ids(&[ctx.id]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Archived);
    }

    #[tokio::test]
    async fn test_panicking_production_fails_and_releases_the_lock() {
        let repo = Arc::new(MemoryContextRepo::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let produce: Produce = Arc::new(move |contexts| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    panic!("handler blew up");
                }
                Ok::<_, FlowError>(Production::consume(contexts))
            }
            .boxed()
        });
        let failed = Arc::new(AtomicUsize::new(0));
        let seen = failed.clone();
        let on_failed: ContextHook = Arc::new(move |contexts| {
            seen.fetch_add(contexts.len(), Ordering::SeqCst);
            async {}.boxed()
        });
        let stage = Stage::builder("s", "a", StageRole::Subscriber, produce, deps(repo.clone(), "a"))
            .on_failed(on_failed)
            .build();

        let first = seed(&repo, "a").await;
        stage.process(vec![first.clone()]).await.unwrap();
        let stored = repo.get_by_ids(&[first.id]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Error);
        let info = stored[0].data.error_info().expect("error info attached");
        assert_eq!(info.error_code, crate::error::codes::SYSTEM_ERROR);
        assert!(info.error_message.contains("handler blew up"));
        assert_eq!(failed.load(Ordering::SeqCst), 1);

        let second = seed(&repo, "a").await;
        let processed = tokio::time::timeout(Duration::from_secs(1), stage.process(vec![second.clone()]))
            .await
            .expect("node lock was released");
        assert_eq!(processed.unwrap(), 1);
        let stored = repo.get_by_ids(&[second.id]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Archived);
    }

    #[tokio::test]
    async fn test_completion_hooks_skip_held_contexts() {
        let repo = Arc::new(MemoryContextRepo::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let produce: Produce = Arc::new(move |contexts| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Ok::<_, FlowError>(Production::hold(contexts))
                } else {
                    Ok(Production::consume(contexts))
                }
            }
            .boxed()
        });
        let completed = Arc::new(AtomicUsize::new(0));
        let seen = completed.clone();
        let hook: ContextHook = Arc::new(move |contexts| {
            seen.fetch_add(contexts.len(), Ordering::SeqCst);
            async {}.boxed()
        });
        let stage = Stage::builder("s", "a", StageRole::Subscriber, produce, deps(repo.clone(), "a"))
            .on_complete(hook)
            .build();
        let ctx = seed(&repo, "a").await;

        stage.process(vec![ctx.clone()]).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        let stored = repo.get_by_ids(&[ctx.id.clone()]).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Pending);

        stage.process(vec![ctx]).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}

//! Parallel fan-out and the matching join barrier.
//!
//! A parallel node copies each context once per fork branch and tags the
//! copies with a [`ParallelScope`]. The join collects the copies of one
//! group and merges them according to the group's [`ParallelMode`].

use super::NodeEnv;
use crate::definition::NodeKind;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use uuid::Uuid;
use waterflow_core::services::ContextQuery;
use waterflow_core::stream::{Produce, Production, Whether};
use waterflow_core::{FlowContext, FlowError, FlowNodeStatus, ParallelMode, ParallelScope};

/// Copy every input once per fork branch.
pub fn fan_out(env: &NodeEnv) -> Produce {
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| {
        let result = match &env.node.kind {
            NodeKind::Parallel { mode, forks } => Ok(split(&env, contexts, *mode, forks)),
            other => Err(FlowError::Contract(format!(
                "{} is a {} node, not a parallel node",
                env.node.meta_id,
                other.node_type()
            ))),
        };
        async move { result }.boxed()
    })
}

fn split(env: &NodeEnv, contexts: Vec<FlowContext>, mode: ParallelMode, forks: &[String]) -> Production {
    let mut outputs = Vec::with_capacity(contexts.len() * forks.len());
    for ctx in &contexts {
        let group = Uuid::new_v4().to_string();
        for fork in forks {
            let mut copy = env.stamp(ctx);
            copy.parallel.push(ParallelScope {
                group: group.clone(),
                mode,
                branches: forks.len(),
                branch: fork.clone(),
            });
            outputs.push(copy);
        }
        tracing::debug!(
            node_id = %env.node.meta_id,
            context_id = %ctx.id,
            group = %group,
            branches = forks.len(),
            "Fanned out"
        );
    }
    Production::forward(contexts, outputs)
}

/// Edge predicate of a branch leaving fork `fork_id`: the context must
/// belong to that branch and satisfy the edge's own rule, if any.
pub fn branch_predicate(fork_id: &str, rule: Option<Whether>) -> Whether {
    let fork_id = fork_id.to_string();
    Arc::new(move |ctx: &FlowContext| {
        if ctx.branch() != Some(fork_id.as_str()) {
            return Ok(false);
        }
        match &rule {
            Some(rule) => rule(ctx),
            None => Ok(true),
        }
    })
}

/// Merge the branches of each fan-out group once its mode is satisfied.
pub fn join(env: &NodeEnv) -> Produce {
    let env = env.clone();
    Arc::new(move |contexts: Vec<FlowContext>| collect(env.clone(), contexts).boxed())
}

async fn collect(env: NodeEnv, contexts: Vec<FlowContext>) -> Result<Production, FlowError> {
    let mut production = Production::default();
    let mut groups: BTreeMap<String, Vec<FlowContext>> = BTreeMap::new();
    for ctx in contexts {
        match ctx.scope() {
            Some(scope) => groups.entry(scope.group.clone()).or_default().push(ctx),
            None => {
                production.outputs.push(env.stamp(&ctx));
                production.consumed.push(ctx);
            }
        }
    }

    for (group, arrivals) in groups {
        let mode = arrivals
            .first()
            .and_then(|c| c.scope())
            .map(|s| s.mode)
            .unwrap_or_default();
        match mode {
            ParallelMode::All => join_all(&env, &group, arrivals, &mut production).await?,
            ParallelMode::Any => join_any(&env, &group, arrivals, &mut production).await?,
        }
    }
    Ok(production)
}

/// Contexts of `group` parked at the join with `status`.
async fn group_members(
    env: &NodeEnv,
    group: &str,
    status: FlowNodeStatus,
) -> Result<Vec<FlowContext>, FlowError> {
    let query = ContextQuery::stream(&env.stream_id)
        .node(&env.node.meta_id)
        .status(status);
    Ok(env
        .services
        .repo
        .query(&query)
        .await?
        .into_iter()
        .filter(|c| c.scope().map_or(false, |s| s.group == group))
        .collect())
}

async fn join_all(
    env: &NodeEnv,
    group: &str,
    arrivals: Vec<FlowContext>,
    production: &mut Production,
) -> Result<(), FlowError> {
    let mut seen: HashSet<String> = arrivals.iter().map(|c| c.id.clone()).collect();
    let mut members = arrivals.clone();
    for waiting in group_members(env, group, FlowNodeStatus::Pending).await? {
        if seen.insert(waiting.id.clone()) {
            members.push(waiting);
        }
    }

    let expected = members
        .iter()
        .filter_map(|c| c.scope())
        .map(|s| s.branches)
        .max()
        .unwrap_or(0);
    let arrived: BTreeSet<&str> = members.iter().filter_map(|c| c.branch()).collect();
    if arrived.len() < expected {
        tracing::debug!(
            node_id = %env.node.meta_id,
            group = %group,
            arrived = arrived.len(),
            expected,
            "Join waiting for branches"
        );
        production.held.extend(arrivals);
        return Ok(());
    }

    members.sort_by(|a, b| {
        a.branch()
            .cmp(&b.branch())
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    let merged = env.stamp(&merge(&members)?);
    tracing::info!(
        node_id = %env.node.meta_id,
        group = %group,
        members = members.len(),
        "Join merged branches"
    );
    production.outputs.push(merged);
    production.consumed.extend(members);
    Ok(())
}

async fn join_any(
    env: &NodeEnv,
    group: &str,
    arrivals: Vec<FlowContext>,
    production: &mut Production,
) -> Result<(), FlowError> {
    let already_joined = !group_members(env, group, FlowNodeStatus::Archived).await?.is_empty();
    let mut arrivals = arrivals.into_iter();
    if !already_joined {
        if let Some(first) = arrivals.next() {
            let mut winner = env.stamp(&first);
            winner.parallel.pop();
            production.outputs.push(winner);
            production.consumed.push(first);
        }
    }
    let late: Vec<FlowContext> = arrivals.collect();
    if !late.is_empty() {
        tracing::debug!(
            node_id = %env.node.meta_id,
            group = %group,
            count = late.len(),
            "Dropping late branches of a completed join"
        );
    }
    production.consumed.extend(late);
    Ok(())
}

/// Fold the branch copies of one group into a single context. Later
/// branches overwrite business and pass fields of earlier ones.
fn merge(members: &[FlowContext]) -> Result<FlowContext, FlowError> {
    let (base, rest) = members
        .split_first()
        .ok_or_else(|| FlowError::Contract("cannot merge an empty join group".to_string()))?;
    let mut merged = base.clone();
    for member in rest {
        merged.data = merged.data.merged_business(&member.data.business_data);
        for (key, value) in &member.data.pass_data {
            merged.data.pass_data.insert(key.clone(), value.clone());
        }
        merged.trace_ids.extend(member.trace_ids.iter().cloned());
    }
    merged.parallel.pop();
    Ok(merged)
}

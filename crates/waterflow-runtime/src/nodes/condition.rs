use super::{passthrough, NodeEnv};
use crate::definition::{FlowEvent, FlowNode, NodeKind};
use std::sync::Arc;
use waterflow_core::services::ConditionEvaluator;
use waterflow_core::stream::{Produce, Whether};
use waterflow_core::FlowContext;

/// Branch selection happens on the edges; the node itself only stamps.
pub fn producer(env: &NodeEnv) -> Produce {
    passthrough(env)
}

/// Predicate of every outgoing edge of `node`.
///
/// A ruled edge is taken when its rule holds. On a condition node, an
/// edge without a rule is the fallback taken when no ruled sibling holds;
/// elsewhere it is unconditional.
pub fn edge_predicates<'a>(
    node: &'a FlowNode,
    evaluator: &Arc<dyn ConditionEvaluator>,
) -> Vec<(&'a FlowEvent, Option<Whether>)> {
    let rules: Vec<String> = node
        .events
        .iter()
        .filter_map(|e| e.condition_rule.clone())
        .collect();
    let is_condition = matches!(node.kind, NodeKind::Condition);

    node.events
        .iter()
        .map(|event| {
            let whether = match &event.condition_rule {
                Some(rule) => Some(rule_predicate(evaluator.clone(), rule.clone())),
                None if is_condition && !rules.is_empty() => {
                    Some(otherwise_predicate(evaluator.clone(), rules.clone()))
                }
                None => None,
            };
            (event, whether)
        })
        .collect()
}

fn rule_predicate(evaluator: Arc<dyn ConditionEvaluator>, rule: String) -> Whether {
    Arc::new(move |ctx: &FlowContext| evaluator.evaluate(&rule, &ctx.data))
}

fn otherwise_predicate(evaluator: Arc<dyn ConditionEvaluator>, rules: Vec<String>) -> Whether {
    Arc::new(move |ctx: &FlowContext| {
        for rule in &rules {
            if evaluator.evaluate(rule, &ctx.data)? {
                return Ok(false);
            }
        }
        Ok(true)
    })
}

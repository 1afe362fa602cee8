//! Default condition evaluator for branch rules and filters, backed by a
//! sandboxed rhai engine.
//!
//! Rules see `businessData`, `passData` and `contextData` as object maps.
//! Business fields whose keys are plain identifiers are also in scope on
//! their own, so `amount > 10` reads `businessData.amount`. A missing map
//! field reads as `()` (also spelled `null`) and a rule yielding `()` is
//! false. Single-quoted literals are strings, not chars.

use rhai::{Dynamic, Engine, Scope, AST};
use serde::Serialize;
use std::borrow::Cow;
use waterflow_core::services::ConditionEvaluator;
use waterflow_core::{FlowData, FlowError};

const ROOTS: [&str; 3] = ["businessData", "passData", "contextData"];

#[derive(Debug)]
pub struct ExpressionEvaluator {
    engine: Engine,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(10_000);
        Self { engine }
    }

    /// Parses `expression` without evaluating it.
    pub fn check(&self, expression: &str) -> Result<(), FlowError> {
        self.compile(expression).map(|_| ())
    }

    fn compile(&self, expression: &str) -> Result<AST, FlowError> {
        self.engine
            .compile_expression(normalize(expression).as_ref())
            .map_err(|e| FlowError::condition(expression, e.to_string()))
    }
}

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, expression: &str, data: &FlowData) -> Result<bool, FlowError> {
        let ast = self.compile(expression)?;
        let mut scope = scope_for(data).map_err(|e| FlowError::condition(expression, e))?;
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| FlowError::condition(expression, e.to_string()))?;

        if result.is_unit() {
            return Ok(false);
        }
        result
            .as_bool()
            .map_err(|type_name| FlowError::condition(expression, format!("rule yields {}, not a boolean", type_name)))
    }
}

fn scope_for(data: &FlowData) -> Result<Scope<'static>, String> {
    let mut scope = Scope::new();
    for (key, value) in &data.business_data {
        if is_identifier(key) && !ROOTS.contains(&key.as_str()) {
            scope.push_dynamic(key.as_str(), to_dynamic(value)?);
        }
    }
    scope.push_dynamic("businessData", to_dynamic(&data.business_data)?);
    scope.push_dynamic("passData", to_dynamic(&data.pass_data)?);
    scope.push_dynamic("contextData", to_dynamic(&data.context_data)?);
    Ok(scope)
}

fn to_dynamic<T: Serialize>(value: &T) -> Result<Dynamic, String> {
    rhai::serde::to_dynamic(value).map_err(|e| e.to_string())
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Rewrites `'text'` literals as `"text"` and a bare `null` as `()`.
fn normalize(expression: &str) -> Cow<'_, str> {
    if !expression.contains('\'') && !expression.contains("null") {
        return Cow::Borrowed(expression);
    }
    let mut out = String::with_capacity(expression.len() + 2);
    let mut quote: Option<char> = None;
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(_), '\\') => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            (Some(open), _) if open == c => {
                quote = None;
                out.push('"');
            }
            (Some('\''), '"') => out.push_str("\\\""),
            (Some(_), _) => out.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                out.push('"');
            }
            (None, c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if word == "null" && !out.ends_with('.') {
                    out.push_str("()");
                } else {
                    out.push_str(&word);
                }
            }
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

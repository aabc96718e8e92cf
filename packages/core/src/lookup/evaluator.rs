//! Minimal expression evaluator
//!
//! Understands a small expression language, enough for conditions and label
//! rules in embedded rulesets:
//!
//! - literals: `true`, `false`, `null`, numbers, `"text"` / `'text'`
//! - variables: `$var.name`
//! - node symbols: `this.Label`, `this.ClassName`, `this.Kind`,
//!   `this.GroupedCount`, and the same on `parent`
//! - operators: `!expr`, `a == b`, `a != b`, `a && b`, `a || b` (no grouping)

use crate::error::{HierarchyError, Result};
use crate::models::NavNode;
use serde_json::Value;

use super::{ExpressionContext, ExpressionEvaluator};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleExpressionEvaluator;

impl SimpleExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn value(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<Value> {
        let expression = expression.trim();
        match expression {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "null" => return Ok(Value::Null),
            _ => {}
        }
        if let Some(quoted) = strip_quotes(expression) {
            return Ok(Value::String(quoted.to_string()));
        }
        if let Ok(number) = expression.parse::<i64>() {
            return Ok(Value::from(number));
        }
        if let Ok(number) = expression.parse::<f64>() {
            return Ok(Value::from(number));
        }
        if let Some(name) = expression.strip_prefix("$var.") {
            return Ok(context.variables.get(name));
        }
        if let Some(symbol) = expression.strip_prefix("this.") {
            return node_symbol(context.node, symbol, expression);
        }
        if let Some(symbol) = expression.strip_prefix("parent.") {
            return node_symbol(context.parent, symbol, expression);
        }
        Err(HierarchyError::expression(expression, "unrecognized symbol"))
    }

    fn boolean(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<bool> {
        let expression = expression.trim();
        if let Some((left, right)) = expression.split_once("||") {
            return Ok(self.boolean(left, context)? || self.boolean(right, context)?);
        }
        if let Some((left, right)) = expression.split_once("&&") {
            return Ok(self.boolean(left, context)? && self.boolean(right, context)?);
        }
        if let Some((left, right)) = expression.split_once("!=") {
            return Ok(self.value(left, context)? != self.value(right, context)?);
        }
        if let Some((left, right)) = expression.split_once("==") {
            return Ok(self.value(left, context)? == self.value(right, context)?);
        }
        if let Some(inner) = expression.strip_prefix('!') {
            return Ok(!self.boolean(inner, context)?);
        }
        Ok(truthy(&self.value(expression, context)?))
    }
}

fn strip_quotes(expression: &str) -> Option<&str> {
    if expression.len() < 2 {
        return None;
    }
    let quote = expression.chars().next()?;
    if (quote == '"' || quote == '\'') && expression.ends_with(quote) {
        return Some(&expression[1..expression.len() - 1]);
    }
    None
}

fn node_symbol(node: Option<&NavNode>, symbol: &str, expression: &str) -> Result<Value> {
    let Some(node) = node else {
        return Ok(Value::Null);
    };
    match symbol {
        "Label" => Ok(Value::String(node.label.clone())),
        "ClassName" => Ok(node
            .key
            .class_name
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null)),
        "Kind" => Ok(Value::String(node.kind().as_str().to_string())),
        "GroupedCount" => Ok(node
            .extended
            .grouped_count
            .map(Value::from)
            .unwrap_or(Value::Null)),
        _ => Err(HierarchyError::expression(expression, "unknown node property")),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(value) => !value.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate_bool(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<bool> {
        self.boolean(expression, context)
    }

    fn evaluate_value(&self, expression: &str, context: &ExpressionContext<'_>) -> Result<Value> {
        self.value(expression, context)
    }
}

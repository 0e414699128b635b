use rustpython_ast::{Constant, Expr, Keyword};
use serde_json::Value;
use std::collections::BTreeMap;

/// The three sentinel decorator names recognized anywhere in decorator
/// position, bare or called, however imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoratorKind {
    Workflow,
    Tool,
    DataProvider,
}

impl DecoratorKind {
    fn from_terminal_name(name: &str) -> Option<Self> {
        match name {
            "workflow" => Some(DecoratorKind::Workflow),
            "tool" => Some(DecoratorKind::Tool),
            "data_provider" => Some(DecoratorKind::DataProvider),
            _ => None,
        }
    }
}

/// The terminal identifier of a decorator expression: `@workflow` → `workflow`,
/// `@sdk.workflow(...)` → `workflow`, `@sdk.workflow` → `workflow`.
fn terminal_identifier(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Name(name) => Some(name.id.as_str()),
        Expr::Attribute(attr) => Some(attr.attr.as_str()),
        Expr::Call(call) => terminal_identifier(&call.func),
        _ => None,
    }
}

/// Recognizes a decorator expression, returning its kind and any keyword
/// arguments as a JSON object (call form only; bare decorators have no
/// arguments).
pub fn recognize(expr: &Expr) -> Option<(DecoratorKind, BTreeMap<String, Value>)> {
    let name = terminal_identifier(expr)?;
    let kind = DecoratorKind::from_terminal_name(name)?;
    let keywords = match expr {
        Expr::Call(call) => call.keywords.iter().filter_map(keyword_to_pair).collect(),
        _ => BTreeMap::new(),
    };
    Some((kind, keywords))
}

fn keyword_to_pair(keyword: &Keyword) -> Option<(String, Value)> {
    let key = keyword.arg.as_ref()?.to_string();
    Some((key, expr_to_json(&keyword.value)))
}

/// Best-effort conversion of a literal AST expression to a JSON value:
/// constants, lists/tuples, and dict literals convert directly; anything
/// else (a variable reference, a function call) becomes a JSON string of
/// its source-level shape since it can't be evaluated without running code.
pub fn expr_to_json(expr: &Expr) -> Value {
    match expr {
        Expr::Constant(c) => constant_to_json(&c.value),
        Expr::List(list) => Value::Array(list.elts.iter().map(expr_to_json).collect()),
        Expr::Tuple(tuple) => Value::Array(tuple.elts.iter().map(expr_to_json).collect()),
        Expr::Dict(dict) => {
            let mut map = serde_json::Map::new();
            for (key, value) in dict.keys.iter().zip(dict.values.iter()) {
                if let Some(Expr::Constant(c)) = key {
                    if let Constant::Str(s) = &c.value {
                        map.insert(s.to_string(), expr_to_json(value));
                    }
                }
            }
            Value::Object(map)
        }
        Expr::UnaryOp(unary) => expr_to_json(&unary.operand),
        _ => Value::Null,
    }
}

fn constant_to_json(constant: &Constant) -> Value {
    match constant {
        Constant::None => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Str(s) => Value::String(s.to_string()),
        Constant::Int(i) => serde_json::Number::from_i128(i.try_into().unwrap_or_default())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Constant::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

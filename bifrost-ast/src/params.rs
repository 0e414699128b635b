use bifrost_common::model::Parameter;
use rustpython_ast::{Arguments, Constant, Expr, Operator};
use serde_json::Value;

use crate::decorator::expr_to_json;

/// Parameter names dropped unconditionally, plus the bare type name treated
/// as "the execution context type" regardless of how it was imported.
const IMPLICIT_PARAMS: [&str; 2] = ["self", "cls"];
const CONTEXT_TYPE_NAME: &str = "ExecutionContext";

/// Extracts the UI-facing parameter list from a function's signature:
/// type annotation, default value, `Optional[T]`/`T | None` detection, and
/// `Literal[...]` option enumeration.
pub fn extract_parameters(args: &Arguments) -> Vec<Parameter> {
    let mut params = Vec::new();

    let positional = args.posonlyargs.iter().chain(args.args.iter());
    for arg_with_default in positional {
        let name = arg_with_default.def.arg.as_str();
        if IMPLICIT_PARAMS.contains(&name) {
            continue;
        }
        let annotation = arg_with_default.def.annotation.as_deref();
        if annotation_is_context_type(annotation) {
            continue;
        }
        let default = arg_with_default.default.as_deref().map(expr_to_json);
        params.push(build_parameter(name, annotation, default));
    }

    for arg_with_default in args.kwonlyargs.iter() {
        let name = arg_with_default.def.arg.as_str();
        if IMPLICIT_PARAMS.contains(&name) {
            continue;
        }
        let annotation = arg_with_default.def.annotation.as_deref();
        if annotation_is_context_type(annotation) {
            continue;
        }
        let default = arg_with_default.default.as_deref().map(expr_to_json);
        params.push(build_parameter(name, annotation, default));
    }

    params
}

fn build_parameter(name: &str, annotation: Option<&Expr>, default: Option<Value>) -> Parameter {
    let (inner, optional_annotation) = match annotation {
        Some(expr) => match unwrap_optional(expr) {
            Some(inner) => (Some(inner), true),
            None => (Some(expr), false),
        },
        None => (None, false),
    };
    let required = !(optional_annotation || default.is_some());

    let (ui_type, options) = inner.map(annotation_to_ui_type).unwrap_or(("string", None));

    Parameter {
        name: name.to_string(),
        r#type: ui_type.to_string(),
        required,
        label: humanize_label(name),
        default,
        options,
    }
}

/// `user_id` → `"User Id"`: title-cased, underscore-to-space label
/// derivation.
fn humanize_label(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn annotation_is_context_type(annotation: Option<&Expr>) -> bool {
    annotation
        .and_then(terminal_name)
        .map(|name| name == CONTEXT_TYPE_NAME)
        .unwrap_or(false)
}

fn terminal_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Name(name) => Some(name.id.as_str()),
        Expr::Attribute(attr) => Some(attr.attr.as_str()),
        Expr::Subscript(subscript) => terminal_name(&subscript.value),
        _ => None,
    }
}

/// Unwraps `Optional[T]` and `T | None` to `T`. Returns `None` if the
/// annotation is not optional.
fn unwrap_optional(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Subscript(subscript) if terminal_name(&subscript.value) == Some("Optional") => {
            Some(subscript.slice.as_ref())
        }
        Expr::BinOp(binop) if matches!(binop.op, Operator::BitOr) => {
            if is_none_literal(&binop.right) {
                Some(&binop.left)
            } else if is_none_literal(&binop.left) {
                Some(&binop.right)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn is_none_literal(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Constant(c) if matches!(c.value, Constant::None)
    )
}

const CONTAINER_TYPES: [&str; 5] = ["list", "List", "Set", "set", "FrozenSet"];
const MAPPING_TYPES: [&str; 4] = ["dict", "Dict", "Mapping", "Any"];
const PRIMITIVE_TYPES: [(&str, &str); 4] =
    [("str", "string"), ("int", "int"), ("float", "float"), ("bool", "bool")];

/// Maps a (non-Optional) annotation expression to a UI parameter type plus
/// literal enumeration options, if any.
fn annotation_to_ui_type(expr: &Expr) -> (&'static str, Option<Vec<String>>) {
    if let Expr::Subscript(subscript) = expr {
        if terminal_name(&subscript.value) == Some("Literal") {
            return ("string", Some(extract_literal_options(&subscript.slice)));
        }
        if let Some(name) = terminal_name(&subscript.value) {
            if CONTAINER_TYPES.contains(&name) {
                return ("list", None);
            }
            if MAPPING_TYPES.contains(&name) {
                return ("json", None);
            }
        }
    }

    let Some(name) = terminal_name(expr) else {
        return ("json", None);
    };

    for (type_name, ui_type) in PRIMITIVE_TYPES {
        if name == type_name {
            return (ui_type, None);
        }
    }
    if CONTAINER_TYPES.contains(&name) {
        return ("list", None);
    }
    if MAPPING_TYPES.contains(&name) {
        return ("json", None);
    }
    // Any other structured/custom type maps to a free-form JSON value.
    ("json", None)
}

fn extract_literal_options(slice: &Expr) -> Vec<String> {
    let exprs: Vec<&Expr> = match slice {
        Expr::Tuple(tuple) => tuple.elts.iter().collect(),
        other => vec![other],
    };
    exprs
        .into_iter()
        .filter_map(|expr| match expr {
            Expr::Constant(c) => match &c.value {
                Constant::Str(s) => Some(s.to_string()),
                Constant::Int(i) => Some(i.to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_label_title_cases_and_spaces() {
        assert_eq!(humanize_label("user_id"), "User Id");
        assert_eq!(humanize_label("name"), "Name");
        assert_eq!(humanize_label("a_b_c"), "A B C");
    }
}

use bifrost_common::model::Parameter;
use rustpython_ast::{self as ast, Stmt};
use rustpython_parser::{Mode, ParseError};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::decorator::{self, DecoratorKind};
use crate::fast_path_is_plain_module;
use crate::params::extract_parameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    /// No decorator sentinel present; classified without a full parse.
    Module,
    /// At least one recognized decorator was found on a top-level function.
    Executable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl From<ParseError> for SyntaxIssue {
    fn from(err: ParseError) -> Self {
        SyntaxIssue {
            line: err.location.row.to_usize(),
            column: err.location.column.to_usize(),
            message: err.error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub function_symbol: String,
    pub kind: DecoratorKind,
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub endpoint_enabled: bool,
    pub allowed_methods: Vec<String>,
    pub execution_mode: String,
    pub is_tool: bool,
    pub tool_description: Option<String>,
    pub timeout_seconds: i64,
    pub time_saved: Option<Value>,
    pub value: Option<Value>,
    pub cache_ttl_seconds: i64,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InspectionResult {
    pub entities: Vec<EntityMetadata>,
    pub syntax_errors: Vec<SyntaxIssue>,
}

/// Parses `source` and extracts entity metadata for every recognized
/// decorator on a top-level function. Callers should first check
/// `fast_path_is_plain_module` to avoid invoking this at all for large
/// non-entity files.
pub fn inspect(source: &str) -> InspectionResult {
    if fast_path_is_plain_module(source) {
        return InspectionResult::default();
    }

    let module = match rustpython_parser::parse(source, Mode::Module, "<module>") {
        Ok(ast::Mod::Module(module)) => module,
        Ok(_) => return InspectionResult::default(),
        Err(err) => {
            return InspectionResult {
                entities: Vec::new(),
                syntax_errors: vec![err.into()],
            }
        }
    };

    let mut entities = Vec::new();
    for stmt in module.body.iter() {
        if let Some(function) = as_function_def(stmt) {
            entities.extend(inspect_function(function));
        }
    }

    InspectionResult {
        entities,
        syntax_errors: Vec::new(),
    }
}

/// A uniform view over `Stmt::FunctionDef` and `Stmt::AsyncFunctionDef` —
/// both declare entities identically for our purposes.
struct FunctionView<'a> {
    name: &'a str,
    args: &'a ast::Arguments,
    decorator_list: &'a [ast::Expr],
    body: &'a [Stmt],
}

fn as_function_def(stmt: &Stmt) -> Option<FunctionView<'_>> {
    match stmt {
        Stmt::FunctionDef(f) => Some(FunctionView {
            name: f.name.as_str(),
            args: &f.args,
            decorator_list: &f.decorator_list,
            body: &f.body,
        }),
        Stmt::AsyncFunctionDef(f) => Some(FunctionView {
            name: f.name.as_str(),
            args: &f.args,
            decorator_list: &f.decorator_list,
            body: &f.body,
        }),
        _ => None,
    }
}

fn inspect_function(function: FunctionView<'_>) -> Vec<EntityMetadata> {
    function
        .decorator_list
        .iter()
        .filter_map(decorator::recognize)
        .map(|(kind, keywords)| build_entity_metadata(function.name, kind, keywords, &function))
        .collect()
}

fn build_entity_metadata(
    function_symbol: &str,
    kind: DecoratorKind,
    keywords: BTreeMap<String, Value>,
    function: &FunctionView<'_>,
) -> EntityMetadata {
    let docstring_first_line = docstring_first_line(function.body);

    let name = keywords
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| function_symbol.to_string());

    let description = keywords
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(docstring_first_line);

    let default_timeout = match kind {
        DecoratorKind::Workflow | DecoratorKind::Tool => 1800,
        DecoratorKind::DataProvider => 300,
    };

    let endpoint_enabled = keywords
        .get("endpoint_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    EntityMetadata {
        function_symbol: function_symbol.to_string(),
        kind,
        id: keywords.get("id").and_then(Value::as_str).map(str::to_string),
        name,
        description,
        category: keywords
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "General".to_string()),
        tags: keywords
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
        endpoint_enabled,
        allowed_methods: keywords
            .get("allowed_methods")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_else(|| vec!["POST".to_string()]),
        execution_mode: keywords
            .get("execution_mode")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if endpoint_enabled { "sync" } else { "async" }.to_string()
            }),
        is_tool: keywords.get("is_tool").and_then(Value::as_bool).unwrap_or(false),
        tool_description: keywords
            .get("tool_description")
            .and_then(Value::as_str)
            .map(str::to_string),
        timeout_seconds: keywords
            .get("timeout_seconds")
            .and_then(Value::as_i64)
            .unwrap_or(default_timeout),
        time_saved: keywords.get("time_saved").cloned(),
        value: keywords.get("value").cloned(),
        cache_ttl_seconds: keywords
            .get("cache_ttl_seconds")
            .and_then(Value::as_i64)
            .unwrap_or(300),
        parameters: extract_parameters(function.args),
    }
}

fn docstring_first_line(body: &[Stmt]) -> Option<String> {
    let first = body.first()?;
    let Stmt::Expr(expr_stmt) = first else {
        return None;
    };
    let ast::Expr::Constant(constant) = expr_stmt.value.as_ref() else {
        return None;
    };
    let ast::Constant::Str(s) = &constant.value else {
        return None;
    };
    s.lines().next().map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_skips_parsing_plain_modules() {
        let source = "def helper():\n    return 1\n";
        let result = inspect(source);
        assert!(result.entities.is_empty());
        assert!(result.syntax_errors.is_empty());
    }

    #[test]
    fn recognizes_bare_and_call_decorators() {
        let source = r#"
@workflow(name="Greet", timeout_seconds=30)
def greet(name: str):
    """Say hello."""
    return name

@tool
def bare_tool():
    pass
"#;
        let result = inspect(source);
        assert_eq!(result.entities.len(), 2);
        let greet = result
            .entities
            .iter()
            .find(|e| e.function_symbol == "greet")
            .unwrap();
        assert_eq!(greet.name, "Greet");
        assert_eq!(greet.timeout_seconds, 30);
        assert_eq!(greet.kind, DecoratorKind::Workflow);
    }

    #[test]
    fn missing_description_falls_back_to_docstring() {
        let source = "@workflow\ndef greet():\n    \"\"\"First line.\n    more.\"\"\"\n    pass\n";
        let result = inspect(source);
        assert_eq!(result.entities[0].description.as_deref(), Some("First line."));
    }

    #[test]
    fn data_provider_defaults_to_shorter_timeout() {
        let source = "@data_provider\ndef options():\n    return []\n";
        let result = inspect(source);
        assert_eq!(result.entities[0].timeout_seconds, 300);
        assert_eq!(result.entities[0].category, "General");
        assert_eq!(result.entities[0].allowed_methods, vec!["POST".to_string()]);
    }

    #[test]
    fn execution_mode_defaults_to_async_without_endpoint() {
        let source = "@workflow\ndef greet():\n    pass\n";
        let result = inspect(source);
        assert_eq!(result.entities[0].execution_mode, "async");
    }

    #[test]
    fn execution_mode_defaults_to_sync_when_endpoint_enabled() {
        let source = "@workflow(endpoint_enabled=True)\ndef greet():\n    pass\n";
        let result = inspect(source);
        assert_eq!(result.entities[0].execution_mode, "sync");
    }

    #[test]
    fn defaulted_non_optional_parameter_is_not_required() {
        let source = "@workflow\ndef greet(name: str, count: int = 5):\n    pass\n";
        let result = inspect(source);
        let params = &result.entities[0].parameters;
        let count = params.iter().find(|p| p.name == "count").unwrap();
        assert_eq!(count.r#type, "int");
        assert!(!count.required, "a parameter with a default must not be required even when its annotation isn't Optional");
        let name = params.iter().find(|p| p.name == "name").unwrap();
        assert!(name.required);
    }

    #[test]
    fn syntax_errors_are_reported_without_panicking() {
        let source = "@workflow\ndef broken(:\n";
        let result = inspect(source);
        assert!(result.entities.is_empty());
        assert_eq!(result.syntax_errors.len(), 1);
    }
}

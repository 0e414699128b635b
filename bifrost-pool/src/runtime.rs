use async_trait::async_trait;
use bifrost_common::model::{ErrorKind, ExecutionContext};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("target symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("execution raised: {0}")]
    ExecutionError(String),
}

impl RuntimeError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RuntimeError::SymbolNotFound(_) | RuntimeError::ExecutionError(_) => {
                ErrorKind::ExecutionError
            }
        }
    }
}

/// Invokes a parsed module's target function (§4.9 step 5: "invoke the
/// target"). Implementations are swappable so pool/worker tests never
/// depend on a real interpreter.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    async fn invoke(
        &self,
        source: &str,
        function_symbol: &str,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, RuntimeError>;
}

type MockFn = dyn Fn(&ExecutionContext) -> Result<serde_json::Value, String> + Send + Sync;

/// Test double driven by a closure table keyed by function symbol, used
/// in place of a real interpreter for worker/pool tests.
#[derive(Default)]
pub struct MockRuntime {
    handlers: DashMap<String, Arc<MockFn>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, function_symbol: &str, handler: F)
    where
        F: Fn(&ExecutionContext) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(function_symbol.to_string(), Arc::new(handler));
    }
}

#[async_trait]
impl WorkflowRuntime for MockRuntime {
    async fn invoke(
        &self,
        _source: &str,
        function_symbol: &str,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, RuntimeError> {
        let handler = self
            .handlers
            .get(function_symbol)
            .ok_or_else(|| RuntimeError::SymbolNotFound(function_symbol.to_string()))?
            .clone();
        handler(ctx).map_err(RuntimeError::ExecutionError)
    }
}

/// Production runtime: executes the parsed module in a fresh
/// `rustpython-vm` interpreter scope per invocation. Each call gets its
/// own `vm::Interpreter`, so state never leaks between executions sharing
/// the same worker.
#[cfg(feature = "rustpython-runtime")]
pub struct RustPythonRuntime;

#[cfg(feature = "rustpython-runtime")]
impl RustPythonRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "rustpython-runtime")]
impl Default for RustPythonRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rustpython-runtime")]
#[async_trait]
impl WorkflowRuntime for RustPythonRuntime {
    async fn invoke(
        &self,
        source: &str,
        function_symbol: &str,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, RuntimeError> {
        let source = source.to_string();
        let function_symbol = function_symbol.to_string();
        let params = ctx.parameters.clone();

        tokio::task::spawn_blocking(move || -> Result<serde_json::Value, RuntimeError> {
            use rustpython_vm::Interpreter;

            let interpreter = Interpreter::without_stdlib(Default::default());
            interpreter.enter(|vm| {
                let scope = vm.new_scope_with_builtins();
                vm.run_code_string(scope.clone(), &source, "<module>".to_owned())
                    .map_err(|e| RuntimeError::ExecutionError(format!("{e:?}")))?;

                let target = scope
                    .locals
                    .get_item(function_symbol.as_str(), vm)
                    .map_err(|_| RuntimeError::SymbolNotFound(function_symbol.clone()))?;

                let kwargs = python_value_from_json(vm, &params);
                let result = target
                    .call((), vm)
                    .or_else(|_| vm.invoke(&target, (kwargs,)))
                    .map_err(|e| RuntimeError::ExecutionError(format!("{e:?}")))?;

                json_from_python_value(vm, &result)
                    .map_err(|e| RuntimeError::ExecutionError(e.to_string()))
            })
        })
        .await
        .map_err(|e| RuntimeError::ExecutionError(e.to_string()))?
    }
}

#[cfg(feature = "rustpython-runtime")]
fn python_value_from_json(
    vm: &rustpython_vm::VirtualMachine,
    value: &serde_json::Value,
) -> rustpython_vm::PyObjectRef {
    use rustpython_vm::builtins::{PyDict, PyFloat, PyInt, PyList, PyStr};
    use rustpython_vm::convert::ToPyObject;

    match value {
        serde_json::Value::Null => vm.ctx.none(),
        serde_json::Value::Bool(b) => b.to_pyobject(vm),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                PyInt::from(i).into_pyobject(vm)
            } else {
                PyFloat::from(n.as_f64().unwrap_or_default()).into_pyobject(vm)
            }
        }
        serde_json::Value::String(s) => PyStr::from(s.as_str()).into_pyobject(vm),
        serde_json::Value::Array(items) => {
            let elements: Vec<_> = items.iter().map(|v| python_value_from_json(vm, v)).collect();
            PyList::from(elements).into_pyobject(vm)
        }
        serde_json::Value::Object(map) => {
            let dict = PyDict::new_ref(&vm.ctx);
            for (k, v) in map {
                let _ = dict.set_item(k.as_str(), python_value_from_json(vm, v), vm);
            }
            dict.into_pyobject(vm)
        }
    }
}

#[cfg(feature = "rustpython-runtime")]
fn json_from_python_value(
    vm: &rustpython_vm::VirtualMachine,
    value: &rustpython_vm::PyObjectRef,
) -> Result<serde_json::Value, String> {
    let repr = value
        .str(vm)
        .map_err(|e| format!("{e:?}"))?
        .as_str()
        .to_string();
    serde_json::from_str(&repr).or(Ok(serde_json::Value::String(repr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_ctx() -> ExecutionContext {
        ExecutionContext {
            execution_id: "exec-1".to_string(),
            user_id: "user-1".to_string(),
            org_id: "org-1".to_string(),
            workflow_name: "greet".to_string(),
            parameters: serde_json::json!({"name": "Ada"}),
            timeout_seconds: 60,
            deadline: Utc::now() + chrono::Duration::seconds(60),
        }
    }

    #[test_r::test(tokio::test)]
    async fn mock_runtime_invokes_registered_handler() {
        let runtime = MockRuntime::new();
        runtime.register("greet", |ctx| Ok(serde_json::json!(format!("hi {}", ctx.org_id))));
        let result = runtime.invoke("", "greet", &sample_ctx()).await.unwrap();
        assert_eq!(result, serde_json::json!("hi org-1"));
    }

    #[test_r::test(tokio::test)]
    async fn mock_runtime_errors_on_unknown_symbol() {
        let runtime = MockRuntime::new();
        let result = runtime.invoke("", "missing", &sample_ctx()).await;
        assert!(matches!(result, Err(RuntimeError::SymbolNotFound(_))));
    }
}

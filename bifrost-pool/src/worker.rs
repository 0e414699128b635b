use std::sync::Arc;
use std::time::Instant;

use bifrost_common::model::{ErrorKind, ExecutionResult};
use bifrost_context::ContextStore;
use bifrost_storage::{BlobStore, ModuleCache, TextIndex};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{WorkItem, WorkResult};
use crate::runtime::WorkflowRuntime;

tokio::task_local! {
    /// Process-wide (per invocation) execution context, installed for the
    /// duration of a single invocation so SDK calls inside the runtime can
    /// read it without threading a parameter (§4.9 step 4).
    static CURRENT_EXECUTION: String;
}

/// Returns the `execution_id` of the invocation currently running on this
/// task, if any.
pub fn current_execution_id() -> Option<String> {
    CURRENT_EXECUTION.try_with(|id| id.clone()).ok()
}

/// Resolves `(org, workflow_name)` to the artifact path and callable
/// symbol that serve it (§4.9 step 3). Cached in-process per pool
/// lifetime by implementations; `bifrost-indexing`'s `EntityRepo` is the
/// natural backing store.
#[async_trait::async_trait]
pub trait WorkflowLookup: Send + Sync {
    async fn resolve(&self, workflow_name: &str) -> Option<ResolvedTarget>;
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub path: String,
    pub function_symbol: String,
}

/// The worker's main loop (§4.9): block for work, fetch context, resolve
/// and load the target, invoke it within its deadline budget, emit a
/// result, repeat. Runs as a `tokio::task` for the in-process transport;
/// the OS-process transport runs the same loop inside a re-exec'd child
/// (wired in `bifrost-server`'s worker entrypoint).
pub async fn run_worker_loop<C, B, T, M, R>(
    mut work_rx: mpsc::Receiver<WorkItem>,
    result_tx: mpsc::Sender<WorkResult>,
    context_store: Arc<C>,
    lookup: Arc<dyn WorkflowLookup>,
    blobs: Arc<B>,
    text_index: Arc<T>,
    module_cache: Arc<M>,
    runtime: Arc<R>,
) where
    C: ContextStore,
    B: BlobStore,
    T: TextIndex,
    M: ModuleCache,
    R: WorkflowRuntime,
{
    while let Some(item) = work_rx.recv().await {
        let result = execute_one(
            &item.execution_id,
            context_store.as_ref(),
            lookup.as_ref(),
            blobs.as_ref(),
            text_index.as_ref(),
            module_cache.as_ref(),
            runtime.as_ref(),
        )
        .await;

        if result_tx.send(WorkResult { result }).await.is_err() {
            warn!("result channel closed, worker loop exiting");
            break;
        }
    }
}

async fn execute_one<C, B, T, M, R>(
    execution_id: &str,
    context_store: &C,
    lookup: &dyn WorkflowLookup,
    blobs: &B,
    text_index: &T,
    module_cache: &M,
    runtime: &R,
) -> ExecutionResult
where
    C: ContextStore,
    B: BlobStore,
    T: TextIndex,
    M: ModuleCache,
    R: WorkflowRuntime,
{
    let start = Instant::now();

    let ctx = match context_store.get(execution_id).await {
        Ok(ctx) => ctx,
        Err(err) => return failure(execution_id, ErrorKind::ExecutionError, err.to_string(), start),
    };

    let target = match lookup.resolve(&ctx.workflow_name).await {
        Some(target) => target,
        None => {
            return failure(
                execution_id,
                ErrorKind::ExecutionError,
                format!("no target registered for workflow {}", ctx.workflow_name),
                start,
            )
        }
    };

    let source = match module_cache.get(&target.path) {
        Some(cached) => String::from_utf8_lossy(&cached.content).into_owned(),
        None => match text_index.get(&target.path).await {
            Ok(Some(indexed)) => indexed.content,
            _ => match blobs.get(&target.path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    return failure(execution_id, ErrorKind::ExecutionError, err.to_string(), start)
                }
            },
        },
    };

    let execution_id_owned = execution_id.to_string();
    let remaining = std::time::Duration::from_secs(ctx.timeout_seconds);
    let invocation = CURRENT_EXECUTION.scope(
        execution_id_owned.clone(),
        runtime.invoke(&source, &target.function_symbol, &ctx),
    );

    match tokio::time::timeout(remaining, invocation).await {
        Ok(Ok(value)) => {
            info!(execution_id, "execution completed");
            ExecutionResult {
                execution_id: execution_id.to_string(),
                success: true,
                value: Some(value),
                error_kind: None,
                error_message: None,
                duration_ms: start.elapsed().as_millis() as u64,
                input_tokens: None,
                output_tokens: None,
            }
        }
        Ok(Err(err)) => failure(execution_id, err.error_kind(), err.to_string(), start),
        Err(_) => failure(
            execution_id,
            ErrorKind::TimeoutError,
            "execution exceeded its deadline".to_string(),
            start,
        ),
    }
}

fn failure(
    execution_id: &str,
    error_kind: ErrorKind,
    message: String,
    start: Instant,
) -> ExecutionResult {
    ExecutionResult {
        execution_id: execution_id.to_string(),
        success: false,
        value: None,
        error_kind: Some(error_kind),
        error_message: Some(message),
        duration_ms: start.elapsed().as_millis() as u64,
        input_tokens: None,
        output_tokens: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use bifrost_context::InMemoryContextStore;
    use bifrost_storage::{InMemoryBlobStore, InMemoryModuleCache, InMemoryTextIndex};
    use chrono::Utc;
    use std::time::Duration;

    struct StaticLookup(ResolvedTarget);

    #[async_trait::async_trait]
    impl WorkflowLookup for StaticLookup {
        async fn resolve(&self, _workflow_name: &str) -> Option<ResolvedTarget> {
            Some(self.0.clone())
        }
    }

    #[test_r::test(tokio::test)]
    async fn successful_invocation_produces_a_result() {
        let context_store = Arc::new(InMemoryContextStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let text_index = Arc::new(InMemoryTextIndex::new());
        let cache = Arc::new(InMemoryModuleCache::new());
        let runtime = Arc::new(MockRuntime::new());
        runtime.register("greet", |ctx| Ok(serde_json::json!(ctx.workflow_name.clone())));

        let lookup: Arc<dyn WorkflowLookup> = Arc::new(StaticLookup(ResolvedTarget {
            path: "workflows/greet.py".to_string(),
            function_symbol: "greet".to_string(),
        }));
        cache.set("workflows/greet.py", b"ignored".to_vec(), "h".to_string());

        context_store
            .set(
                "exec-1",
                bifrost_common::model::ExecutionContext {
                    execution_id: "exec-1".to_string(),
                    user_id: "user-1".to_string(),
                    org_id: "org-1".to_string(),
                    workflow_name: "greet".to_string(),
                    parameters: serde_json::json!({}),
                    timeout_seconds: 5,
                    deadline: Utc::now() + chrono::Duration::seconds(5),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);
        tokio::spawn(run_worker_loop(
            work_rx, result_tx, context_store, lookup, blobs, text_index, cache, runtime,
        ));

        work_tx
            .send(WorkItem { execution_id: "exec-1".to_string() })
            .await
            .unwrap();

        let outcome = result_rx.recv().await.unwrap();
        assert!(outcome.result.success);
        assert_eq!(outcome.result.value, Some(serde_json::json!("greet")));
    }

    #[test_r::test(tokio::test)]
    async fn missing_context_produces_execution_error() {
        let context_store = Arc::new(InMemoryContextStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let text_index = Arc::new(InMemoryTextIndex::new());
        let cache = Arc::new(InMemoryModuleCache::new());
        let runtime = Arc::new(MockRuntime::new());
        let lookup: Arc<dyn WorkflowLookup> = Arc::new(StaticLookup(ResolvedTarget {
            path: "workflows/greet.py".to_string(),
            function_symbol: "greet".to_string(),
        }));

        let result = execute_one(
            "missing-exec",
            context_store.as_ref(),
            lookup.as_ref(),
            blobs.as_ref(),
            text_index.as_ref(),
            cache.as_ref(),
            runtime.as_ref(),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ExecutionError));
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use bifrost_ast::{inspect, DecoratorKind, EntityMetadata};
use bifrost_common::model::{ArtifactRoute, Entity, EntityKind, ExecutionMode};
use bifrost_storage::{content_hash, BlobStore, BlobStoreError, ModuleCache, TextIndex};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{parse_agent_yaml, resolve_agent_references, AgentRepo};
use crate::deactivation::{
    AvailableReplacement, DeactivationError, DeactivationGuard, ExecutionHistoryLookup, PendingDeactivationInfo,
};
use crate::entities::{EntityRepo, RepoError};
use crate::forms::{parse_form_yaml, resolve_form_workflow_refs, FormRepo};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Deactivation(#[from] DeactivationError),
}

/// The write path's response shape: exactly one of a successful ingest, a
/// block on unresolved deactivations, or a rejection that never touched
/// storage. `WriteError` is reserved for transport/infra failures that
/// leave the caller unable to tell which of these three happened.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Ok {
        path: String,
        content_hash: String,
        entities_upserted: Vec<Entity>,
        diagnostics: Vec<String>,
        content_modified: bool,
    },
    PendingDeactivation {
        pending: Vec<PendingDeactivationInfo>,
        replacements: Vec<AvailableReplacement>,
    },
    Invalid {
        reason: String,
    },
}

/// Paths excluded from indexing outright: VCS metadata, virtualenvs,
/// bytecode caches, and OS-generated clutter files.
const EXCLUDED_PREFIXES: [&str; 4] = [".git/", ".venv/", "__pycache__/", ".DS_Store"];

fn is_excluded(path: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Orchestrates the full write path for one file: reject excluded paths,
/// pre-parse executables, run the deactivation guard, put the blob, upsert
/// the text index, refresh the module cache, ingest entities/forms/agents,
/// and finally apply deactivations that had no confirmed replacement.
pub struct WritePipeline<B, T, C, R, F, A, H>
where
    B: BlobStore,
    T: TextIndex,
    C: ModuleCache,
    R: EntityRepo,
    F: FormRepo,
    A: AgentRepo,
    H: ExecutionHistoryLookup,
{
    blobs: Arc<B>,
    text_index: Arc<T>,
    module_cache: Arc<C>,
    entities: Arc<R>,
    forms: Arc<F>,
    agents: Arc<A>,
    guard: DeactivationGuard<R, F, A, H>,
}

impl<B, T, C, R, F, A, H> WritePipeline<B, T, C, R, F, A, H>
where
    B: BlobStore,
    T: TextIndex,
    C: ModuleCache,
    R: EntityRepo,
    F: FormRepo,
    A: AgentRepo,
    H: ExecutionHistoryLookup,
{
    pub fn new(
        blobs: Arc<B>,
        text_index: Arc<T>,
        module_cache: Arc<C>,
        entities: Arc<R>,
        forms: Arc<F>,
        agents: Arc<A>,
        history: Arc<H>,
    ) -> Self {
        let guard = DeactivationGuard::new(entities.clone(), forms.clone(), agents.clone(), history);
        Self {
            blobs,
            text_index,
            module_cache,
            entities,
            forms,
            agents,
            guard,
        }
    }

    /// `updated_by` is attached to tracing spans; ownership/audit trails
    /// are out of this pipeline's scope.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: Option<String>,
        updated_by: &str,
        force_deactivation: bool,
        replacements: &HashMap<Uuid, String>,
    ) -> Result<WriteOutcome, WriteError> {
        if is_excluded(path) {
            return Ok(WriteOutcome::Invalid { reason: format!("path is excluded from indexing: {path}") });
        }

        let route = ArtifactRoute::classify(path);

        match route {
            ArtifactRoute::Executable => {
                self.write_executable(path, content, content_type, updated_by, force_deactivation, replacements)
                    .await
            }
            ArtifactRoute::Form => self.write_form(path, content).await,
            ArtifactRoute::Agent => self.write_agent(path, content).await,
            ArtifactRoute::Blob => self.write_blob(path, content, content_type).await,
        }
    }

    async fn write_executable(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: Option<String>,
        updated_by: &str,
        force_deactivation: bool,
        replacements: &HashMap<Uuid, String>,
    ) -> Result<WriteOutcome, WriteError> {
        let hash = content_hash(&content);
        let text = String::from_utf8_lossy(&content).into_owned();
        let inspected = inspect(&text);

        let mut diagnostics: Vec<String> = inspected
            .syntax_errors
            .iter()
            .map(|e| format!("syntax error at {}:{}: {}", e.line, e.column, e.message))
            .collect();

        if !diagnostics.is_empty() && inspected.entities.is_empty() {
            warn!(path, updated_by, "rejecting write with syntax errors");
            return Ok(WriteOutcome::Invalid { reason: diagnostics.join("; ") });
        }

        // Step 3: the deactivation guard (§4.6). Caller-confirmed
        // replacements are applied before normal ingest so the renamed
        // entity's identity (and thus execution history) is preserved.
        for (&old_id, new_symbol) in replacements {
            self.guard.apply_replacement(old_id, new_symbol).await?;
        }

        let (pending, available_replacements) = self
            .guard
            .detect_pending_deactivations(path, &inspected.entities)
            .await?;

        if !pending.is_empty() && !force_deactivation {
            return Ok(WriteOutcome::PendingDeactivation { pending, replacements: available_replacements });
        }

        self.blobs.put(path, &content, content_type.as_deref()).await?;

        if let Err(err) = self.text_index.upsert(path, &text, &hash, Utc::now()).await {
            warn!(path, error = %err, "text index upsert failed; blob is newer than index until next reindex");
            diagnostics.push(format!("text index not yet updated: {err}"));
        }
        self.module_cache.set(path, content.clone(), hash.clone());

        let new_symbols: Vec<String> = inspected.entities.iter().map(|e| e.function_symbol.clone()).collect();
        let mut entities_upserted = Vec::new();
        for metadata in &inspected.entities {
            match self.entities.upsert(to_entity(path, metadata)).await {
                Ok(entity) => entities_upserted.push(entity),
                Err(err) => {
                    warn!(path, symbol = %metadata.function_symbol, error = %err, "entity ingest failed");
                    diagnostics.push(format!("failed to index {}: {err}", metadata.function_symbol));
                }
            }
        }

        if force_deactivation {
            self.guard.deactivate_unreplaced(path, &new_symbols).await?;
        }

        info!(path, updated_by, entities = entities_upserted.len(), "write complete");

        Ok(WriteOutcome::Ok {
            path: path.to_string(),
            content_hash: hash,
            entities_upserted,
            diagnostics,
            content_modified: false,
        })
    }

    async fn write_form(&self, path: &str, content: Vec<u8>) -> Result<WriteOutcome, WriteError> {
        let hash = content_hash(&content);
        let text = String::from_utf8_lossy(&content);

        let parsed = match parse_form_yaml(&text) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(WriteOutcome::Invalid { reason: format!("invalid form YAML: {err}") }),
        };
        let content_modified = parsed.content_modified;
        let form = resolve_form_workflow_refs(parsed, self.entities.as_ref()).await;

        self.blobs.put(path, &content, Some("application/yaml")).await?;
        let stored = self.forms.upsert(form).await.map_err(|err| {
            warn!(path, error = %err, "form ingest failed");
            err
        });

        let (entities_upserted, diagnostics) = match stored {
            Ok(_) => (Vec::new(), Vec::new()),
            Err(err) => (Vec::new(), vec![format!("failed to index form: {err}")]),
        };

        Ok(WriteOutcome::Ok {
            path: path.to_string(),
            content_hash: hash,
            entities_upserted,
            diagnostics,
            content_modified,
        })
    }

    async fn write_agent(&self, path: &str, content: Vec<u8>) -> Result<WriteOutcome, WriteError> {
        let hash = content_hash(&content);
        let text = String::from_utf8_lossy(&content);

        let parsed = match parse_agent_yaml(&text) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                return Ok(WriteOutcome::Invalid { reason: "agent file missing name or system_prompt".to_string() })
            }
            Err(err) => return Ok(WriteOutcome::Invalid { reason: format!("invalid agent YAML: {err}") }),
        };
        let (agent, content_modified) = parsed;

        let resolved = resolve_agent_references(agent, self.entities.as_ref(), self.agents.as_ref()).await;
        for dropped in &resolved.dropped_tool_refs {
            warn!(path, tool_id = %dropped, "agent references non-existent workflow");
        }
        for dropped in &resolved.dropped_delegated_refs {
            warn!(path, delegate_id = %dropped, "agent references non-existent agent");
        }

        self.blobs.put(path, &content, Some("application/yaml")).await?;
        let mut diagnostics = Vec::new();
        if let Err(err) = self.agents.upsert(resolved.agent).await {
            warn!(path, error = %err, "agent ingest failed");
            diagnostics.push(format!("failed to index agent: {err}"));
        }

        Ok(WriteOutcome::Ok {
            path: path.to_string(),
            content_hash: hash,
            entities_upserted: Vec::new(),
            diagnostics,
            content_modified,
        })
    }

    async fn write_blob(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<WriteOutcome, WriteError> {
        let hash = content_hash(&content);
        self.blobs.put(path, &content, content_type.as_deref()).await?;
        Ok(WriteOutcome::Ok {
            path: path.to_string(),
            content_hash: hash,
            entities_upserted: Vec::new(),
            diagnostics: Vec::new(),
            content_modified: false,
        })
    }

    pub async fn delete(&self, path: &str) -> Result<u64, WriteError> {
        self.blobs.delete(path).await?;
        match ArtifactRoute::classify(path) {
            ArtifactRoute::Executable => {
                self.text_index.delete(path).await?;
                self.module_cache.invalidate(path);
                Ok(self.entities.deactivate_all_for_path(path).await?)
            }
            ArtifactRoute::Form => match virtual_id_from_path(path, "forms/", ".form.yaml") {
                Some(id) => match self.forms.delete(id).await {
                    Ok(()) => Ok(1),
                    Err(err) => {
                        warn!(path, error = %err, "failed to delete form record");
                        Ok(0)
                    }
                },
                None => {
                    warn!(path, "cannot extract form id from path");
                    Ok(0)
                }
            },
            ArtifactRoute::Agent => match virtual_id_from_path(path, "agents/", ".agent.yaml") {
                Some(id) => match self.agents.delete(id).await {
                    Ok(()) => Ok(1),
                    Err(err) => {
                        warn!(path, error = %err, "failed to delete agent record");
                        Ok(0)
                    }
                },
                None => {
                    warn!(path, "cannot extract agent id from path");
                    Ok(0)
                }
            },
            ArtifactRoute::Blob => Ok(0),
        }
    }
}

/// Recovers the virtual entity id embedded in a form/agent path, e.g.
/// `forms/{uuid}.form.yaml` -> `uuid`. Grounded on `form.py`/`agent.py`'s
/// `delete_form_for_file`/`delete_agent_for_file`, which key deletion off
/// the path itself rather than a stored path column.
fn virtual_id_from_path(path: &str, prefix: &str, suffix: &str) -> Option<Uuid> {
    path.strip_prefix(prefix)?.strip_suffix(suffix).and_then(|s| Uuid::parse_str(s).ok())
}

fn to_entity(path: &str, metadata: &EntityMetadata) -> Entity {
    let kind = match metadata.kind {
        DecoratorKind::Workflow => EntityKind::Workflow,
        DecoratorKind::Tool => EntityKind::Tool,
        DecoratorKind::DataProvider => EntityKind::DataProvider,
    };
    let execution_mode = if metadata.execution_mode == "async" {
        ExecutionMode::Async
    } else {
        ExecutionMode::Sync
    };

    Entity {
        id: metadata
            .id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4),
        name: metadata.name.clone(),
        function_symbol: metadata.function_symbol.clone(),
        path: path.to_string(),
        kind,
        description: metadata.description.clone(),
        category: metadata.category.clone(),
        tags: metadata.tags.clone(),
        parameters_schema: metadata.parameters.clone(),
        endpoint_enabled: metadata.endpoint_enabled,
        allowed_methods: metadata.allowed_methods.clone(),
        execution_mode,
        timeout_seconds: metadata.timeout_seconds,
        cache_ttl_seconds: metadata.cache_ttl_seconds,
        is_active: true,
        is_orphaned: false,
        last_seen_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::InMemoryAgentRepo;
    use crate::deactivation::NoExecutionHistory;
    use crate::entities::InMemoryEntityRepo;
    use crate::forms::InMemoryFormRepo;
    use bifrost_storage::{InMemoryBlobStore, InMemoryModuleCache, InMemoryTextIndex};

    type TestPipeline = WritePipeline<
        InMemoryBlobStore,
        InMemoryTextIndex,
        InMemoryModuleCache,
        InMemoryEntityRepo,
        InMemoryFormRepo,
        InMemoryAgentRepo,
        NoExecutionHistory,
    >;

    fn pipeline() -> TestPipeline {
        WritePipeline::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryTextIndex::new()),
            Arc::new(InMemoryModuleCache::new()),
            Arc::new(InMemoryEntityRepo::new()),
            Arc::new(InMemoryFormRepo::new()),
            Arc::new(InMemoryAgentRepo::new()),
            Arc::new(NoExecutionHistory),
        )
    }

    async fn write(
        pipeline: &TestPipeline,
        path: &str,
        content: Vec<u8>,
        force_deactivation: bool,
        replacements: &HashMap<Uuid, String>,
    ) -> WriteOutcome {
        pipeline
            .write(path, content, None, "tester", force_deactivation, replacements)
            .await
            .unwrap()
    }

    #[test_r::test(tokio::test)]
    async fn excluded_paths_are_rejected() {
        let pipeline = pipeline();
        let outcome = write(&pipeline, ".git/HEAD", vec![1, 2, 3], false, &HashMap::new()).await;
        assert!(matches!(outcome, WriteOutcome::Invalid { .. }));
    }

    #[test_r::test(tokio::test)]
    async fn writing_a_workflow_file_registers_its_entity() {
        let pipeline = pipeline();
        let source = b"@workflow(name=\"Greet\")\ndef greet(name: str):\n    return name\n".to_vec();
        let outcome = write(&pipeline, "workflows/greet.py", source, false, &HashMap::new()).await;

        match outcome {
            WriteOutcome::Ok { entities_upserted, .. } => {
                assert_eq!(entities_upserted.len(), 1);
                assert_eq!(entities_upserted[0].name, "Greet");
                assert_eq!(entities_upserted[0].kind, EntityKind::Workflow);
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test_r::test(tokio::test)]
    async fn removing_a_symbol_blocks_without_force_deactivation() {
        let pipeline = pipeline();
        let first = b"@workflow\ndef send_email(to: str):\n    pass\n".to_vec();
        write(&pipeline, "workflows/a.py", first, false, &HashMap::new()).await;

        let second = b"@workflow\ndef send_email_v2(to: str):\n    pass\n".to_vec();
        let outcome = write(&pipeline, "workflows/a.py", second, false, &HashMap::new()).await;

        match outcome {
            WriteOutcome::PendingDeactivation { pending, replacements } => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].removed.function_symbol, "send_email");
                assert_eq!(replacements.len(), 1);
            }
            other => panic!("expected PendingDeactivation, got {other:?}"),
        }

        let active = pipeline.entities.list_active_by_path("workflows/a.py").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].function_symbol, "send_email");
    }

    #[test_r::test(tokio::test)]
    async fn force_deactivation_deactivates_the_removed_symbol() {
        let pipeline = pipeline();
        let first = b"@workflow\ndef send_email(to: str):\n    pass\n".to_vec();
        write(&pipeline, "workflows/a.py", first, false, &HashMap::new()).await;

        let second = b"@workflow\ndef totally_different(to: str):\n    pass\n".to_vec();
        let outcome = write(&pipeline, "workflows/a.py", second, true, &HashMap::new()).await;

        assert!(matches!(outcome, WriteOutcome::Ok { .. }));
        let active = pipeline.entities.list_active_by_path("workflows/a.py").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].function_symbol, "totally_different");
    }

    #[test_r::test(tokio::test)]
    async fn replacement_preserves_identity_across_rename() {
        let pipeline = pipeline();
        let first = b"@workflow\ndef send_email(to: str):\n    pass\n".to_vec();
        let first_outcome = write(&pipeline, "workflows/a.py", first, false, &HashMap::new()).await;
        let original_id = match first_outcome {
            WriteOutcome::Ok { entities_upserted, .. } => entities_upserted[0].id,
            other => panic!("expected Ok, got {other:?}"),
        };

        let second = b"@workflow\ndef send_email_v2(to: str):\n    pass\n".to_vec();
        let mut replacements = HashMap::new();
        replacements.insert(original_id, "send_email_v2".to_string());
        let outcome = write(&pipeline, "workflows/a.py", second, false, &replacements).await;

        match outcome {
            WriteOutcome::Ok { entities_upserted, .. } => {
                assert_eq!(entities_upserted[0].id, original_id);
                assert_eq!(entities_upserted[0].function_symbol, "send_email_v2");
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test_r::test(tokio::test)]
    async fn syntax_errors_reject_the_whole_write() {
        let pipeline = pipeline();
        let broken = b"@workflow\ndef broken(:\n".to_vec();
        let outcome = write(&pipeline, "workflows/broken.py", broken, false, &HashMap::new()).await;
        assert!(matches!(outcome, WriteOutcome::Invalid { .. }));
    }

    #[test_r::test(tokio::test)]
    async fn delete_clears_blob_and_entities() {
        let pipeline = pipeline();
        let source = b"@tool\ndef helper():\n    pass\n".to_vec();
        write(&pipeline, "tools/helper.py", source, false, &HashMap::new()).await;

        let deactivated = pipeline.delete("tools/helper.py").await.unwrap();
        assert_eq!(deactivated, 1);
        assert!(pipeline.blobs.get("tools/helper.py").await.is_err());
    }

    #[test_r::test(tokio::test)]
    async fn writing_a_form_injects_an_id_and_reports_content_modified() {
        let pipeline = pipeline();
        let outcome = write(&pipeline, "forms/greet.form.yaml", b"name: Greet Form\n".to_vec(), false, &HashMap::new())
            .await;

        match outcome {
            WriteOutcome::Ok { content_modified, .. } => assert!(content_modified),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test_r::test(tokio::test)]
    async fn writing_an_agent_without_system_prompt_is_invalid() {
        let pipeline = pipeline();
        let outcome = write(&pipeline, "agents/bot.agent.yaml", b"name: Bot\n".to_vec(), false, &HashMap::new()).await;
        assert!(matches!(outcome, WriteOutcome::Invalid { .. }));
    }

    #[test_r::test(tokio::test)]
    async fn deleting_a_form_file_removes_its_record() {
        let pipeline = pipeline();
        let id = Uuid::new_v4();
        let path = format!("forms/{id}.form.yaml");
        let content = format!("id: {id}\nname: Greet Form\n").into_bytes();
        write(&pipeline, &path, content, false, &HashMap::new()).await;
        assert!(pipeline.forms.find_by_id(id).await.unwrap().is_some());

        let removed = pipeline.delete(&path).await.unwrap();
        assert_eq!(removed, 1);
        assert!(pipeline.forms.find_by_id(id).await.unwrap().is_none());
    }

    #[test_r::test(tokio::test)]
    async fn deleting_an_agent_file_removes_its_record() {
        let pipeline = pipeline();
        let id = Uuid::new_v4();
        let path = format!("agents/{id}.agent.yaml");
        let content = format!("id: {id}\nname: Bot\nsystem_prompt: Be helpful\n").into_bytes();
        write(&pipeline, &path, content, false, &HashMap::new()).await;
        assert!(pipeline.agents.find_by_id(id).await.unwrap().is_some());

        let removed = pipeline.delete(&path).await.unwrap();
        assert_eq!(removed, 1);
        assert!(pipeline.agents.find_by_id(id).await.unwrap().is_none());
    }

    #[test_r::test(tokio::test)]
    async fn deleting_a_form_file_with_unparseable_id_reports_zero() {
        let pipeline = pipeline();
        let removed = pipeline.delete("forms/not-a-uuid.form.yaml").await.unwrap();
        assert_eq!(removed, 0);
    }
}

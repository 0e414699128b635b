use crate::agents::{AgentRepo, AgentRepoError};
use crate::entities::{EntityRepo, RepoError};
use crate::forms::{FormRepo, FormRepoError};
use crate::similarity::{similarity, REPLACEMENT_THRESHOLD};
use async_trait::async_trait;
use bifrost_ast::{DecoratorKind, EntityMetadata};
use bifrost_common::model::{Entity, EntityKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DeactivationError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Form(#[from] FormRepoError),
    #[error(transparent)]
    Agent(#[from] AgentRepoError),
}

/// An entity that references a workflow and would therefore be affected by
/// its deactivation. Grounded on
/// `deactivation.py::find_affected_entities`'s flat dict shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedEntity {
    pub entity_type: &'static str,
    pub id: Uuid,
    pub name: String,
    /// Comma-joined reference kinds, e.g. `"workflow, launch_workflow"`.
    pub reference_type: String,
}

/// A workflow/tool/data_provider that would be silently deactivated by the
/// write in progress, enriched with enough context for an operator to
/// decide whether to confirm, rename, or let it happen
/// (`deactivation.py::PendingDeactivationInfo`).
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDeactivationInfo {
    pub removed: Entity,
    pub has_executions: bool,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub endpoint_enabled: bool,
    pub affected_entities: Vec<AffectedEntity>,
}

/// A new function in the incoming content that scored above
/// [`REPLACEMENT_THRESHOLD`] against at least one pending deactivation —
/// a candidate an operator can point a removed entity's identity at via
/// [`DeactivationGuard::apply_replacement`].
#[derive(Debug, Clone, PartialEq)]
pub struct AvailableReplacement {
    pub function_symbol: String,
    pub name: String,
    pub decorator_type: DecoratorKind,
    pub similarity_score: f64,
}

/// Looks up the most recent execution of a workflow by name, so the guard
/// can warn when a workflow with real execution history is about to be
/// dropped. Executions are linked by `workflow_name`, not `id`, since an
/// entity's `id` can change across renames but its name is what callers
/// invoked.
#[async_trait]
pub trait ExecutionHistoryLookup: Send + Sync {
    async fn last_execution(&self, workflow_name: &str) -> Option<DateTime<Utc>>;
}

/// No execution-history backing at all — every workflow reports as never
/// executed. Used where a deployment has no execution-history store wired
/// in yet (the guard's enrichment is then always conservative, reporting
/// no history rather than failing).
pub struct NoExecutionHistory;

#[async_trait]
impl ExecutionHistoryLookup for NoExecutionHistory {
    async fn last_execution(&self, _workflow_name: &str) -> Option<DateTime<Utc>> {
        None
    }
}

/// Guards against silently orphaning callers of a workflow/tool whose
/// function was renamed or removed. Grounded on
/// `deactivation.py::DeactivationProtectionService`.
pub struct DeactivationGuard<R: EntityRepo, F: FormRepo, A: AgentRepo, H: ExecutionHistoryLookup> {
    entities: Arc<R>,
    forms: Arc<F>,
    agents: Arc<A>,
    history: Arc<H>,
}

impl<R: EntityRepo, F: FormRepo, A: AgentRepo, H: ExecutionHistoryLookup> DeactivationGuard<R, F, A, H> {
    pub fn new(entities: Arc<R>, forms: Arc<F>, agents: Arc<A>, history: Arc<H>) -> Self {
        Self { entities, forms, agents, history }
    }

    /// Forms, and agents that reference `workflow_id`, each annotated with
    /// how they reference it (`find_affected_entities`).
    pub async fn find_affected_entities(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<AffectedEntity>, DeactivationError> {
        let mut affected = Vec::new();

        for form in self.forms.list_active_referencing_workflow(workflow_id).await? {
            let mut ref_types = Vec::new();
            if form.workflow_ref == Some(workflow_id) {
                ref_types.push("workflow");
            }
            if form.launch_workflow_ref == Some(workflow_id) {
                ref_types.push("launch_workflow");
            }
            affected.push(AffectedEntity {
                entity_type: "form",
                id: form.id,
                name: form.name,
                reference_type: ref_types.join(", "),
            });
        }

        for form in self.forms.list_active_referencing_data_provider(workflow_id).await? {
            if affected.iter().any(|e| e.entity_type == "form" && e.id == form.id) {
                continue;
            }
            affected.push(AffectedEntity {
                entity_type: "form",
                id: form.id,
                name: form.name,
                reference_type: "data_provider".to_string(),
            });
        }

        for agent in self.agents.list_active_referencing_tool(workflow_id).await? {
            affected.push(AffectedEntity {
                entity_type: "agent",
                id: agent.id,
                name: agent.name,
                reference_type: "tool".to_string(),
            });
        }

        Ok(affected)
    }

    /// Entities declared at `path` before this write whose symbols do not
    /// appear among `new_entities`, each enriched with execution history
    /// and affected-entity context, alongside the new entities in this
    /// write that plausibly replace one of them
    /// (`detect_pending_deactivations`'s `(pending, replacements)` pair).
    pub async fn detect_pending_deactivations(
        &self,
        path: &str,
        new_entities: &[EntityMetadata],
    ) -> Result<(Vec<PendingDeactivationInfo>, Vec<AvailableReplacement>), DeactivationError> {
        let new_symbols: Vec<&str> = new_entities.iter().map(|e| e.function_symbol.as_str()).collect();
        let active = self.entities.list_active_by_path(path).await?;
        let existing_symbols: std::collections::HashSet<String> =
            active.iter().map(|e| e.function_symbol.clone()).collect();

        let removed: Vec<Entity> = active
            .into_iter()
            .filter(|e| !new_symbols.contains(&e.function_symbol.as_str()))
            .collect();

        let mut pending = Vec::with_capacity(removed.len());
        for entity in removed {
            let last_execution_at = self.history.last_execution(&entity.function_symbol).await;
            let affected_entities = self.find_affected_entities(entity.id).await?;
            pending.push(PendingDeactivationInfo {
                has_executions: last_execution_at.is_some(),
                last_execution_at,
                endpoint_enabled: entity.endpoint_enabled,
                affected_entities,
                removed: entity,
            });
        }

        let mut replacements = Vec::new();
        if !pending.is_empty() {
            for candidate in new_entities
                .iter()
                .filter(|c| !existing_symbols.contains(c.function_symbol.as_str()))
            {
                let best_score = pending
                    .iter()
                    .map(|pd| similarity(&pd.removed.function_symbol, &candidate.function_symbol))
                    .fold(0.0_f64, f64::max);

                if best_score >= REPLACEMENT_THRESHOLD {
                    replacements.push(AvailableReplacement {
                        function_symbol: candidate.function_symbol.clone(),
                        name: candidate.name.clone(),
                        decorator_type: candidate.kind,
                        similarity_score: (best_score * 100.0).round() / 100.0,
                    });
                }
            }
            replacements.sort_by(|a, b| b.similarity_score.partial_cmp(&a.similarity_score).unwrap());
        }

        Ok((pending, replacements))
    }

    /// Applies an operator- or caller-confirmed rename: the old entity's
    /// `id` is preserved and its `function_symbol` rewritten to the new
    /// name, so every reference that pointed at the old identity
    /// transparently follows (`apply_workflow_replacements`).
    pub async fn apply_replacement(
        &self,
        removed_id: Uuid,
        new_function_symbol: &str,
    ) -> Result<(), DeactivationError> {
        self.entities
            .rename_function_symbol(removed_id, new_function_symbol)
            .await?;
        Ok(())
    }

    /// Deactivates every active entity at `path` whose symbol is absent
    /// from `remaining_symbols` with no caller-confirmed replacement
    /// (`deactivate_removed_workflows`): the final, unconditional half of
    /// the guard once pending deactivations have been resolved or
    /// ignored.
    pub async fn deactivate_unreplaced(
        &self,
        path: &str,
        remaining_symbols: &[String],
    ) -> Result<u64, DeactivationError> {
        Ok(self
            .entities
            .deactivate_missing_symbols(path, remaining_symbols)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::InMemoryAgentRepo;
    use crate::entities::InMemoryEntityRepo;
    use crate::forms::InMemoryFormRepo;
    use bifrost_common::model::{Agent, ExecutionMode, Form};

    fn sample(path: &str, symbol: &str) -> Entity {
        Entity {
            id: Uuid::new_v4(),
            name: symbol.to_string(),
            function_symbol: symbol.to_string(),
            path: path.to_string(),
            kind: EntityKind::Workflow,
            description: None,
            category: "General".to_string(),
            tags: vec![],
            parameters_schema: vec![],
            endpoint_enabled: true,
            allowed_methods: vec!["POST".to_string()],
            execution_mode: ExecutionMode::Sync,
            timeout_seconds: 1800,
            cache_ttl_seconds: 300,
            is_active: true,
            is_orphaned: false,
            last_seen_at: Utc::now(),
        }
    }

    fn metadata(symbol: &str) -> EntityMetadata {
        EntityMetadata {
            function_symbol: symbol.to_string(),
            kind: DecoratorKind::Workflow,
            id: None,
            name: symbol.to_string(),
            description: None,
            category: "General".to_string(),
            tags: vec![],
            endpoint_enabled: true,
            allowed_methods: vec!["POST".to_string()],
            execution_mode: "sync".to_string(),
            is_tool: false,
            tool_description: None,
            timeout_seconds: 1800,
            time_saved: None,
            value: None,
            cache_ttl_seconds: 300,
            parameters: vec![],
        }
    }

    fn guard(
        entities: Arc<InMemoryEntityRepo>,
    ) -> DeactivationGuard<InMemoryEntityRepo, InMemoryFormRepo, InMemoryAgentRepo, NoExecutionHistory> {
        DeactivationGuard::new(
            entities,
            Arc::new(InMemoryFormRepo::new()),
            Arc::new(InMemoryAgentRepo::new()),
            Arc::new(NoExecutionHistory),
        )
    }

    #[test_r::test(tokio::test)]
    async fn renamed_symbol_surfaces_as_high_scoring_candidate() {
        let entities = Arc::new(InMemoryEntityRepo::new());
        entities.upsert(sample("wf/a.py", "send_email")).await.unwrap();
        let guard = guard(entities);

        let (pending, replacements) = guard
            .detect_pending_deactivations("wf/a.py", &[metadata("send_email_v2")])
            .await
            .unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].removed.function_symbol, "send_email");
        assert!(!pending[0].has_executions);
        assert_eq!(replacements.len(), 1);
        assert!(replacements[0].similarity_score >= REPLACEMENT_THRESHOLD);
    }

    #[test_r::test(tokio::test)]
    async fn unrelated_replacement_gets_no_candidate() {
        let entities = Arc::new(InMemoryEntityRepo::new());
        entities.upsert(sample("wf/a.py", "send_email")).await.unwrap();
        let guard = guard(entities);

        let (pending, replacements) = guard
            .detect_pending_deactivations("wf/a.py", &[metadata("totally_unrelated_xyz")])
            .await
            .unwrap();

        assert_eq!(pending.len(), 1);
        assert!(replacements.is_empty());
    }

    #[test_r::test(tokio::test)]
    async fn unchanged_sibling_symbol_is_not_offered_as_replacement() {
        let entities = Arc::new(InMemoryEntityRepo::new());
        entities.upsert(sample("wf/a.py", "process_order")).await.unwrap();
        entities.upsert(sample("wf/a.py", "process_refund")).await.unwrap();
        let guard = guard(entities);

        let (pending, replacements) = guard
            .detect_pending_deactivations(
                "wf/a.py",
                &[metadata("process_order")],
            )
            .await
            .unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].removed.function_symbol, "process_refund");
        assert!(
            replacements.is_empty(),
            "an unchanged, still-present symbol must never be offered as a replacement for its removed sibling"
        );
    }

    #[test_r::test(tokio::test)]
    async fn deactivate_unreplaced_clears_active_flag() {
        let entities = Arc::new(InMemoryEntityRepo::new());
        entities.upsert(sample("wf/a.py", "send_email")).await.unwrap();
        let guard = guard(entities.clone());

        let count = guard.deactivate_unreplaced("wf/a.py", &[]).await.unwrap();
        assert_eq!(count, 1);
        assert!(entities.list_active_by_path("wf/a.py").await.unwrap().is_empty());
    }

    #[test_r::test(tokio::test)]
    async fn affected_entities_include_referencing_forms_and_agents() {
        let entities = Arc::new(InMemoryEntityRepo::new());
        let workflow = entities.upsert(sample("wf/a.py", "send_email")).await.unwrap();

        let forms = Arc::new(InMemoryFormRepo::new());
        forms
            .upsert(Form {
                id: Uuid::new_v4(),
                name: "Contact form".to_string(),
                description: None,
                workflow_ref: Some(workflow.id),
                launch_workflow_ref: None,
                fields: vec![],
                organization_id: None,
                is_active: true,
            })
            .await
            .unwrap();

        let agents = Arc::new(InMemoryAgentRepo::new());
        agents
            .upsert(Agent {
                id: Uuid::new_v4(),
                name: "Support bot".to_string(),
                system_prompt: "help".to_string(),
                tool_refs: vec![workflow.id],
                delegated_agent_refs: vec![],
                channels: vec!["chat".to_string()],
                is_active: true,
            })
            .await
            .unwrap();

        let guard = DeactivationGuard::new(entities, forms, agents, Arc::new(NoExecutionHistory));
        let affected = guard.find_affected_entities(workflow.id).await.unwrap();

        assert_eq!(affected.len(), 2);
        assert!(affected.iter().any(|e| e.entity_type == "form" && e.reference_type == "workflow"));
        assert!(affected.iter().any(|e| e.entity_type == "agent" && e.reference_type == "tool"));
    }
}

use async_trait::async_trait;
use bifrost_common::model::Agent;
use dashmap::DashMap;
use sqlx::{Database, Pool};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::entities::EntityRepo;

#[derive(Debug, Error)]
pub enum AgentRepoError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Agent records (one file maps to one record). Upsert is keyed on `id`,
/// with the tool/delegation join tables synced alongside it.
#[async_trait]
pub trait AgentRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Agent>, AgentRepoError>;

    async fn upsert(&self, agent: Agent) -> Result<Agent, AgentRepoError>;

    async fn delete(&self, id: Uuid) -> Result<(), AgentRepoError>;

    /// Active agents whose `tool_refs` include `workflow_id` — the
    /// deactivation guard's agent-side affected-entity query.
    async fn list_active_referencing_tool(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Agent>, AgentRepoError>;

    fn exists_sync(&self, id: Uuid) -> bool;
}

#[derive(Default)]
pub struct InMemoryAgentRepo {
    agents: DashMap<Uuid, Agent>,
}

impl InMemoryAgentRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepo for InMemoryAgentRepo {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Agent>, AgentRepoError> {
        Ok(self.agents.get(&id).map(|e| e.clone()))
    }

    async fn upsert(&self, agent: Agent) -> Result<Agent, AgentRepoError> {
        self.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn delete(&self, id: Uuid) -> Result<(), AgentRepoError> {
        self.agents.remove(&id);
        Ok(())
    }

    async fn list_active_referencing_tool(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Agent>, AgentRepoError> {
        Ok(self
            .agents
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|a| a.is_active && a.tool_refs.contains(&workflow_id))
            .collect())
    }

    fn exists_sync(&self, id: Uuid) -> bool {
        self.agents.contains_key(&id)
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    name: String,
    system_prompt: String,
    tool_refs: serde_json::Value,
    delegated_agent_refs: serde_json::Value,
    channels: serde_json::Value,
    is_active: bool,
}

impl TryFrom<AgentRow> for Agent {
    type Error = AgentRepoError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(Agent {
            id: row.id,
            name: row.name,
            system_prompt: row.system_prompt,
            tool_refs: serde_json::from_value(row.tool_refs).unwrap_or_default(),
            delegated_agent_refs: serde_json::from_value(row.delegated_agent_refs).unwrap_or_default(),
            channels: serde_json::from_value(row.channels).unwrap_or_default(),
            is_active: row.is_active,
        })
    }
}

/// `sqlx`-backed `AgentRepo`, generic over the backend.
pub struct SqlAgentRepo<DB: Database> {
    pool: Arc<Pool<DB>>,
}

impl<DB: Database> SqlAgentRepo<DB> {
    pub fn new(pool: Arc<Pool<DB>>) -> Self {
        Self { pool }
    }
}

macro_rules! impl_sql_agent_repo {
    ($backend:ty, $upsert:literal) => {
        #[async_trait]
        impl AgentRepo for SqlAgentRepo<$backend> {
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Agent>, AgentRepoError> {
                let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
                    .bind(id)
                    .fetch_optional(self.pool.deref())
                    .await?;
                row.map(Agent::try_from).transpose()
            }

            async fn upsert(&self, agent: Agent) -> Result<Agent, AgentRepoError> {
                let row = sqlx::query_as::<_, AgentRow>($upsert)
                    .bind(agent.id)
                    .bind(&agent.name)
                    .bind(&agent.system_prompt)
                    .bind(serde_json::to_value(&agent.tool_refs).unwrap_or_default())
                    .bind(serde_json::to_value(&agent.delegated_agent_refs).unwrap_or_default())
                    .bind(serde_json::to_value(&agent.channels).unwrap_or_default())
                    .bind(agent.is_active)
                    .fetch_one(self.pool.deref())
                    .await?;
                Agent::try_from(row)
            }

            async fn delete(&self, id: Uuid) -> Result<(), AgentRepoError> {
                sqlx::query("DELETE FROM agents WHERE id = $1")
                    .bind(id)
                    .execute(self.pool.deref())
                    .await?;
                Ok(())
            }

            async fn list_active_referencing_tool(
                &self,
                workflow_id: Uuid,
            ) -> Result<Vec<Agent>, AgentRepoError> {
                let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE is_active = true")
                    .fetch_all(self.pool.deref())
                    .await?;
                rows.into_iter()
                    .map(Agent::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map(|agents| {
                        agents
                            .into_iter()
                            .filter(|a| a.tool_refs.contains(&workflow_id))
                            .collect()
                    })
            }

            fn exists_sync(&self, _id: Uuid) -> bool {
                // The sqlx-backed repo has no synchronous path to the
                // database; callers needing an existence check against
                // this backend should use `find_by_id` instead. Ingest
                // code paths that call `exists_sync` are only exercised
                // against the in-memory repo in tests.
                false
            }
        }
    };
}

impl_sql_agent_repo!(
    sqlx::Postgres,
    r#"
    INSERT INTO agents (id, name, system_prompt, tool_refs, delegated_agent_refs, channels, is_active)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO UPDATE SET
        name = $2, system_prompt = $3, tool_refs = $4, delegated_agent_refs = $5, channels = $6, is_active = $7
    RETURNING *
    "#
);

impl_sql_agent_repo!(
    sqlx::Sqlite,
    r#"
    INSERT INTO agents (id, name, system_prompt, tool_refs, delegated_agent_refs, channels, is_active)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (id) DO UPDATE SET
        name = excluded.name, system_prompt = excluded.system_prompt, tool_refs = excluded.tool_refs,
        delegated_agent_refs = excluded.delegated_agent_refs, channels = excluded.channels, is_active = excluded.is_active
    RETURNING *
    "#
);

/// Outcome of parsing and cross-checking a `agents/<uuid>.agent.yaml` body.
/// `dropped_tool_refs`/`dropped_delegated_refs` record references that
/// didn't resolve to anything and were silently excluded, mirroring
/// `index_agent`'s "existence check to prevent FK violations" behaviour —
/// callers should log these as warnings rather than fail the write.
pub struct ParsedAgent {
    pub agent: Agent,
    pub content_modified: bool,
    pub dropped_tool_refs: Vec<String>,
    pub dropped_delegated_refs: Vec<Uuid>,
}

/// Parses an agent YAML body, requiring `name` and `system_prompt`
/// (`index_agent` logs a warning and skips the file when either is
/// missing; the pipeline surfaces that as an ingest error instead).
pub fn parse_agent_yaml(content: &str) -> Result<Option<(Agent, bool)>, serde_yaml::Error> {
    let mut raw: serde_yaml::Value = serde_yaml::from_str(content)?;
    if let serde_yaml::Value::Mapping(map) = &mut raw {
        map.remove(serde_yaml::Value::String("_export".to_string()));
    }

    let name = match raw.get("name").and_then(|v| v.as_str()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Ok(None),
    };
    let system_prompt = match raw.get("system_prompt").and_then(|v| v.as_str()) {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => return Ok(None),
    };

    let mut content_modified = false;
    let id = match raw.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) {
        Some(id) => id,
        None => {
            content_modified = true;
            Uuid::new_v4()
        }
    };

    let channels = raw
        .get("channels")
        .and_then(|v| v.as_sequence())
        .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_else(|| vec!["chat".to_string()]);

    let is_active = raw.get("is_active").and_then(|v| v.as_bool()).unwrap_or(true);

    // Accept `tool_ids` or the friendlier `tools` alias; association
    // resolution (dropping unknown refs) happens in the pipeline, which
    // has access to the entity repo.
    let tool_refs_raw: Vec<String> = raw
        .get("tool_ids")
        .or_else(|| raw.get("tools"))
        .and_then(|v| v.as_sequence())
        .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let delegated_refs_raw: Vec<Uuid> = raw
        .get("delegated_agent_ids")
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect()
        })
        .unwrap_or_default();

    // tool_refs is resolved against the entity repo downstream (it names
    // workflow UUIDs); store the raw strings alongside the partially-built
    // Agent via a sentinel — simpler: parse here is best-effort, and
    // `resolve_agent_references` below does the existence-checked join.
    let tool_refs = tool_refs_raw
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();

    Ok(Some((
        Agent {
            id,
            name,
            system_prompt,
            tool_refs,
            delegated_agent_refs: delegated_refs_raw,
            channels,
            is_active,
        },
        content_modified,
    )))
}

/// Existence-checks `agent.tool_refs` against the workflow entity repo and
/// `agent.delegated_agent_refs` against the agent repo, dropping (and
/// reporting) any reference that doesn't resolve. Mirrors `index_agent`'s
/// per-reference FK-existence checks, done in application code here since
/// there is no database-level foreign key to lean on across backends.
pub async fn resolve_agent_references(
    mut agent: Agent,
    entities: &dyn EntityRepo,
    agents: &dyn AgentRepo,
) -> ParsedAgent {
    let mut kept_tools = Vec::new();
    let mut dropped_tool_refs = Vec::new();
    let mut seen_tools = HashSet::new();
    for tool_id in std::mem::take(&mut agent.tool_refs) {
        if !seen_tools.insert(tool_id) {
            continue;
        }
        match entities.find_by_id(tool_id).await {
            Ok(Some(_)) => kept_tools.push(tool_id),
            _ => {
                warn!(agent = %agent.name, workflow_id = %tool_id, "agent references non-existent workflow");
                dropped_tool_refs.push(tool_id.to_string());
            }
        }
    }

    let mut kept_delegations = Vec::new();
    let mut dropped_delegated_refs = Vec::new();
    for child_id in std::mem::take(&mut agent.delegated_agent_refs) {
        match agents.find_by_id(child_id).await {
            Ok(Some(_)) => kept_delegations.push(child_id),
            _ => {
                warn!(agent = %agent.name, delegate_id = %child_id, "agent references non-existent agent");
                dropped_delegated_refs.push(child_id);
            }
        }
    }

    agent.tool_refs = kept_tools;
    agent.delegated_agent_refs = kept_delegations;

    ParsedAgent {
        agent,
        content_modified: false,
        dropped_tool_refs,
        dropped_delegated_refs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::InMemoryEntityRepo;

    #[test]
    fn parse_requires_name_and_system_prompt() {
        assert!(parse_agent_yaml("name: Bot\n").unwrap().is_none());
        assert!(parse_agent_yaml("system_prompt: hi\n").unwrap().is_none());
    }

    #[test]
    fn parse_injects_missing_id_and_defaults_channels() {
        let (agent, modified) = parse_agent_yaml("name: Bot\nsystem_prompt: Be helpful\n")
            .unwrap()
            .unwrap();
        assert!(modified);
        assert_eq!(agent.channels, vec!["chat".to_string()]);
    }

    #[test_r::test(tokio::test)]
    async fn resolve_drops_unknown_tool_and_delegate_refs() {
        let entities = InMemoryEntityRepo::new();
        let other_agents = InMemoryAgentRepo::new();

        let unknown_tool = Uuid::new_v4();
        let unknown_delegate = Uuid::new_v4();
        let agent = Agent {
            id: Uuid::new_v4(),
            name: "Bot".to_string(),
            system_prompt: "Be helpful".to_string(),
            tool_refs: vec![unknown_tool],
            delegated_agent_refs: vec![unknown_delegate],
            channels: vec!["chat".to_string()],
            is_active: true,
        };

        let resolved = resolve_agent_references(agent, &entities, &other_agents).await;
        assert!(resolved.agent.tool_refs.is_empty());
        assert!(resolved.agent.delegated_agent_refs.is_empty());
        assert_eq!(resolved.dropped_tool_refs, vec![unknown_tool.to_string()]);
        assert_eq!(resolved.dropped_delegated_refs, vec![unknown_delegate]);
    }
}

use std::collections::BTreeMap;

use bifrost_common::model::{Agent, Entity, EntityKind, ExecutionMode, Form, FormField, Parameter};
use bifrost_indexing::{AvailableReplacement, PendingDeactivationInfo};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ParameterDto {
    pub name: String,
    pub r#type: String,
    pub required: bool,
    pub label: String,
    pub default: Option<serde_json::Value>,
    pub options: Option<Vec<String>>,
}

impl From<Parameter> for ParameterDto {
    fn from(p: Parameter) -> Self {
        ParameterDto {
            name: p.name,
            r#type: p.r#type,
            required: p.required,
            label: p.label,
            default: p.default,
            options: p.options,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct EntityDto {
    pub id: Uuid,
    pub name: String,
    pub function_symbol: String,
    pub path: String,
    pub kind: String,
    pub description: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub parameters_schema: Vec<ParameterDto>,
    pub endpoint_enabled: bool,
    pub allowed_methods: Vec<String>,
    pub execution_mode: String,
    pub timeout_seconds: i64,
    pub cache_ttl_seconds: i64,
    pub is_active: bool,
    pub is_orphaned: bool,
}

impl From<Entity> for EntityDto {
    fn from(e: Entity) -> Self {
        EntityDto {
            id: e.id,
            name: e.name,
            function_symbol: e.function_symbol,
            path: e.path,
            kind: match e.kind {
                EntityKind::Workflow => "workflow",
                EntityKind::Tool => "tool",
                EntityKind::DataProvider => "data_provider",
            }
            .to_string(),
            description: e.description,
            category: e.category,
            tags: e.tags,
            parameters_schema: e.parameters_schema.into_iter().map(ParameterDto::from).collect(),
            endpoint_enabled: e.endpoint_enabled,
            allowed_methods: e.allowed_methods,
            execution_mode: match e.execution_mode {
                ExecutionMode::Sync => "sync",
                ExecutionMode::Async => "async",
            }
            .to_string(),
            timeout_seconds: e.timeout_seconds,
            cache_ttl_seconds: e.cache_ttl_seconds,
            is_active: e.is_active,
            is_orphaned: e.is_orphaned,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct FormFieldDto {
    pub name: String,
    pub label: Option<String>,
    pub r#type: String,
    pub required: bool,
    pub position: i32,
    pub data_provider_id: Option<Uuid>,
    pub default_value: Option<serde_json::Value>,
    pub options: Option<Vec<String>>,
}

impl From<FormField> for FormFieldDto {
    fn from(f: FormField) -> Self {
        FormFieldDto {
            name: f.name,
            label: f.label,
            r#type: f.r#type,
            required: f.required,
            position: f.position,
            data_provider_id: f.data_provider_id,
            default_value: f.default_value,
            options: f.options,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct FormDto {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub workflow_ref: Option<Uuid>,
    pub launch_workflow_ref: Option<Uuid>,
    pub fields: Vec<FormFieldDto>,
    pub organization_id: Option<Uuid>,
    pub is_active: bool,
}

impl From<Form> for FormDto {
    fn from(f: Form) -> Self {
        FormDto {
            id: f.id,
            name: f.name,
            description: f.description,
            workflow_ref: f.workflow_ref,
            launch_workflow_ref: f.launch_workflow_ref,
            fields: f.fields.into_iter().map(FormFieldDto::from).collect(),
            organization_id: f.organization_id,
            is_active: f.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct AgentDto {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub tool_refs: Vec<Uuid>,
    pub delegated_agent_refs: Vec<Uuid>,
    pub channels: Vec<String>,
    pub is_active: bool,
}

impl From<Agent> for AgentDto {
    fn from(a: Agent) -> Self {
        AgentDto {
            id: a.id,
            name: a.name,
            system_prompt: a.system_prompt,
            tool_refs: a.tool_refs,
            delegated_agent_refs: a.delegated_agent_refs,
            channels: a.channels,
            is_active: a.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct AffectedEntityDto {
    pub entity_type: String,
    pub id: Uuid,
    pub name: String,
    pub reference_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct PendingDeactivationDto {
    pub removed: EntityDto,
    pub has_executions: bool,
    pub endpoint_enabled: bool,
    pub affected_entities: Vec<AffectedEntityDto>,
}

impl From<PendingDeactivationInfo> for PendingDeactivationDto {
    fn from(p: PendingDeactivationInfo) -> Self {
        PendingDeactivationDto {
            removed: p.removed.into(),
            has_executions: p.has_executions,
            endpoint_enabled: p.endpoint_enabled,
            affected_entities: p
                .affected_entities
                .into_iter()
                .map(|a| AffectedEntityDto {
                    entity_type: a.entity_type.to_string(),
                    id: a.id,
                    name: a.name,
                    reference_type: a.reference_type,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct AvailableReplacementDto {
    pub function_symbol: String,
    pub name: String,
    pub similarity_score: f64,
}

impl From<AvailableReplacement> for AvailableReplacementDto {
    fn from(r: AvailableReplacement) -> Self {
        AvailableReplacementDto {
            function_symbol: r.function_symbol,
            name: r.name,
            similarity_score: r.similarity_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct WriteRequest {
    pub path: String,
    /// UTF-8 source text. Binary blobs aren't accepted through this endpoint.
    pub content: String,
    pub content_type: Option<String>,
    pub updated_by: String,
    #[oai(default)]
    pub force_deactivation: bool,
    /// `removed entity id -> new function_symbol` to graft onto, resolving a
    /// prior `PendingDeactivation` response.
    #[oai(default)]
    pub replacements: BTreeMap<Uuid, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct WriteOkResponse {
    pub path: String,
    pub content_hash: String,
    pub entities_upserted: Vec<EntityDto>,
    pub diagnostics: Vec<String>,
    pub content_modified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct PendingDeactivationResponse {
    pub pending: Vec<PendingDeactivationDto>,
    pub replacements: Vec<AvailableReplacementDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub entities_deactivated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub workflow_name: String,
    pub user_id: String,
    pub org_id: String,
    #[oai(default)]
    pub parameters: serde_json::Value,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ExecutionResultDto {
    pub execution_id: String,
    pub success: bool,
    pub value: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl From<bifrost_common::model::ExecutionResult> for ExecutionResultDto {
    fn from(r: bifrost_common::model::ExecutionResult) -> Self {
        ExecutionResultDto {
            execution_id: r.execution_id,
            success: r.success,
            value: r.value,
            error_kind: r.error_kind.map(|k| format!("{k:?}")),
            error_message: r.error_message,
            duration_ms: r.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct PoolResizeRequest {
    pub min_workers: usize,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct RecycleRequest {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct RecycleResponse {
    pub recycled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ReindexCountsDto {
    pub files_indexed: u64,
    pub files_removed: u64,
    pub workflows_deactivated: u64,
    pub ids_corrected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ReindexErrorDto {
    pub path: String,
    pub field: String,
    pub referenced_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ReindexResponse {
    pub counts: ReindexCountsDto,
    pub errors: Vec<ReindexErrorDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct ProcessStatusDto {
    pub process_id: String,
    pub pid: Option<u32>,
    pub state: String,
    pub uptime_seconds: f64,
    pub executions_completed: u64,
    pub pending_recycle: bool,
    pub current_execution_id: Option<String>,
}

impl From<bifrost_pool::ProcessStatus> for ProcessStatusDto {
    fn from(p: bifrost_pool::ProcessStatus) -> Self {
        ProcessStatusDto {
            process_id: p.process_id,
            pid: p.pid,
            state: format!("{:?}", p.state).to_lowercase(),
            uptime_seconds: p.uptime_seconds,
            executions_completed: p.executions_completed,
            pending_recycle: p.pending_recycle,
            current_execution_id: p.current_execution_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
pub struct PoolStatusDto {
    pub started: bool,
    pub shutdown: bool,
    pub worker_id: String,
    pub pool_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub processes: Vec<ProcessStatusDto>,
}

impl From<bifrost_pool::PoolStatus> for PoolStatusDto {
    fn from(s: bifrost_pool::PoolStatus) -> Self {
        PoolStatusDto {
            started: s.started,
            shutdown: s.shutdown,
            worker_id: s.worker_id,
            pool_size: s.pool_size,
            min_workers: s.min_workers,
            max_workers: s.max_workers,
            processes: s.processes.into_iter().map(Into::into).collect(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A forward-slash string uniquely identifying source content.
///
/// Paths carry routing information by convention: `*.py` is executable
/// source, `forms/<uuid>.form.yaml` and `agents/<uuid>.agent.yaml` are
/// single-entity records, everything else is an opaque blob.
pub type ArtifactPath = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRoute {
    Executable,
    Form,
    Agent,
    Blob,
}

impl ArtifactRoute {
    pub fn classify(path: &str) -> Self {
        if path.ends_with(".py") {
            ArtifactRoute::Executable
        } else if path.starts_with("forms/") && path.ends_with(".form.yaml") {
            ArtifactRoute::Form
        } else if path.starts_with("agents/") && path.ends_with(".agent.yaml") {
            ArtifactRoute::Agent
        } else {
            ArtifactRoute::Blob
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub key: ArtifactPath,
    pub content: Vec<u8>,
    pub content_hash: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedText {
    pub path: ArtifactPath,
    pub content: String,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModule {
    pub content: Vec<u8>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workflow,
    Tool,
    DataProvider,
}

impl EntityKind {
    /// Default execution timeout: 1800s for workflow/tool, 300s for data
    /// providers.
    pub fn default_timeout_seconds(self) -> i64 {
        match self {
            EntityKind::Workflow | EntityKind::Tool => 1800,
            EntityKind::DataProvider => 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub r#type: String,
    pub required: bool,
    pub label: String,
    pub default: Option<serde_json::Value>,
    pub options: Option<Vec<String>>,
}

/// A registered executable unit. Identity key for upsert is
/// `(path, function_symbol)`; `id` is stable across renames and edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub function_symbol: String,
    pub path: ArtifactPath,
    pub kind: EntityKind,
    pub description: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub parameters_schema: Vec<Parameter>,
    pub endpoint_enabled: bool,
    pub allowed_methods: Vec<String>,
    pub execution_mode: ExecutionMode,
    pub timeout_seconds: i64,
    pub cache_ttl_seconds: i64,
    pub is_active: bool,
    pub is_orphaned: bool,
    pub last_seen_at: DateTime<Utc>,
}

impl Entity {
    pub fn identity_key(&self) -> (ArtifactPath, String) {
        (self.path.clone(), self.function_symbol.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub label: Option<String>,
    pub r#type: String,
    pub required: bool,
    pub position: i32,
    pub data_provider_id: Option<Uuid>,
    pub data_provider_inputs: Option<BTreeMap<String, serde_json::Value>>,
    pub default_value: Option<serde_json::Value>,
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub workflow_ref: Option<Uuid>,
    pub launch_workflow_ref: Option<Uuid>,
    pub fields: Vec<FormField>,
    pub organization_id: Option<Uuid>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub tool_refs: Vec<Uuid>,
    pub delegated_agent_refs: Vec<Uuid>,
    pub channels: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub user_id: String,
    pub org_id: String,
    pub workflow_name: String,
    pub parameters: serde_json::Value,
    pub timeout_seconds: u64,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TimeoutError,
    CancelledError,
    ProcessCrashError,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    pub value: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Killed,
}

#[derive(Debug, Clone)]
pub struct CurrentExecution {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub os_pid: u32,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub current_execution: Option<CurrentExecution>,
    pub completed_count: u64,
    pub pending_recycle: bool,
}

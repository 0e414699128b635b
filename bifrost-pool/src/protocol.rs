use bifrost_common::model::ExecutionResult;

/// Message sent from the pool manager down a worker's private work
/// channel (§4.9 step 1). `OsProcessTransport` serializes this as one
/// JSON line over the child's stdin.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkItem {
    pub execution_id: String,
}

/// Message sent back up a worker's private result channel (§4.9 step 6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkResult {
    pub result: ExecutionResult,
}

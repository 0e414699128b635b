use std::sync::Arc;

use async_trait::async_trait;
use bifrost_indexing::EntityRepo;
use bifrost_pool::{ResolvedTarget, WorkflowLookup};

/// Resolves a workflow name to its artifact path and callable symbol by
/// looking it up in the entity table (§4.9 step 3). When a name is active
/// in more than one path, the most recently seen one wins — a write always
/// refreshes `last_seen_at`, so this favors whichever file most recently
/// declared the name.
pub struct EntityRepoLookup {
    entities: Arc<dyn EntityRepo + Send + Sync>,
}

impl EntityRepoLookup {
    pub fn new(entities: Arc<dyn EntityRepo + Send + Sync>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl WorkflowLookup for EntityRepoLookup {
    async fn resolve(&self, workflow_name: &str) -> Option<ResolvedTarget> {
        let mut matches = self.entities.find_active_by_name(workflow_name).await.ok()?;
        matches.sort_by_key(|e| e.last_seen_at);
        let entity = matches.pop()?;
        Some(ResolvedTarget {
            path: entity.path,
            function_symbol: entity.function_symbol,
        })
    }
}

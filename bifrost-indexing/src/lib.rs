pub mod agents;
pub mod deactivation;
pub mod entities;
pub mod forms;
pub mod pipeline;
pub mod similarity;

pub use agents::{
    parse_agent_yaml, resolve_agent_references, AgentRepo, AgentRepoError, InMemoryAgentRepo, ParsedAgent,
    SqlAgentRepo,
};
pub use deactivation::{
    AffectedEntity, AvailableReplacement, DeactivationError, DeactivationGuard, ExecutionHistoryLookup,
    NoExecutionHistory, PendingDeactivationInfo,
};
pub use entities::{EntityRepo, InMemoryEntityRepo, RepoError, SqlEntityRepo};
pub use forms::{parse_form_yaml, resolve_form_workflow_refs, FormRepo, FormRepoError, InMemoryFormRepo, ParsedForm, SqlFormRepo};
pub use pipeline::{WriteError, WriteOutcome, WritePipeline};

#[cfg(test)]
test_r::enable!();

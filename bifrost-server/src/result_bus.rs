use std::sync::Arc;

use async_trait::async_trait;
use bifrost_bus::PubSubBus;
use bifrost_common::model::ExecutionResult;
use bifrost_pool::ResultSink;
use tracing::warn;

/// Delivers a finished execution's result by publishing it on a
/// per-execution bus channel. The dispatch API's long-poll handler
/// subscribes to the same channel before routing the work, so it can catch
/// a result that arrives before the poll request is even issued (§4.9 step
/// 6 / §6's "caller polls, worker publishes" delivery shape).
pub struct BusResultSink {
    bus: Arc<dyn PubSubBus + Send + Sync>,
}

impl BusResultSink {
    pub fn new(bus: Arc<dyn PubSubBus + Send + Sync>) -> Self {
        Self { bus }
    }
}

pub fn result_channel(execution_id: &str) -> String {
    format!("result:{execution_id}")
}

#[async_trait]
impl ResultSink for BusResultSink {
    async fn handle(&self, result: ExecutionResult) {
        let channel = result_channel(&result.execution_id);
        let payload = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(err) => {
                warn!(execution_id = %result.execution_id, error = %err, "failed to serialize execution result");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&channel, payload).await {
            warn!(execution_id = %result.execution_id, error = %err, "failed to publish execution result");
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use bifrost_common::model::ExecutionContext;
use bifrost_pool::PoolError;
use chrono::Utc;
use poem_openapi::payload::Json;
use poem_openapi::*;
use uuid::Uuid;

use crate::api::dto::{DispatchRequest, ErrorBody, ExecutionResultDto};
use crate::api::ApiTags;
use crate::result_bus::result_channel;
use crate::services::Services;

#[derive(ApiResponse, Debug, Clone)]
pub enum DispatchApiError {
    #[oai(status = 400)]
    Invalid(Json<ErrorBody>),
    #[oai(status = 503)]
    NoWorkerAvailable(Json<ErrorBody>),
    #[oai(status = 504)]
    Timeout(Json<ErrorBody>),
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

type Result<T> = std::result::Result<T, DispatchApiError>;

pub struct DispatchApi {
    services: Arc<Services>,
}

/// A thin adapter over §4.9/§4.10's callback-delivered execution result:
/// the subscription to the per-execution result channel is opened *before*
/// the execution is routed, so a worker that finishes between `route()`
/// returning and the caller starting to wait can't race the caller out of
/// its own result (mirrors `result_bus::BusResultSink`'s doc comment).
#[OpenApi(prefix_path = "/v1/executions", tag = ApiTags::Dispatch)]
impl DispatchApi {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Dispatch a workflow execution and wait for its result
    ///
    /// Writes an `ExecutionContext` to the context store, routes it to an
    /// idle pool worker (scaling up if needed), and blocks until the pool
    /// manager's result callback fires for this execution id — whether
    /// that is a success, a timeout, a cancellation, or a crash. The HTTP
    /// call itself times out a little after the execution's own deadline
    /// so a wedged pool can't hang the connection forever.
    #[oai(path = "/dispatch", method = "post", operation_id = "dispatch_execution")]
    async fn dispatch(&self, body: Json<DispatchRequest>) -> Result<Json<ExecutionResultDto>> {
        let body = body.0;
        if body.workflow_name.trim().is_empty() {
            return Err(DispatchApiError::Invalid(Json(ErrorBody {
                error: "workflow_name must not be empty".to_string(),
            })));
        }

        let timeout_seconds = match body.timeout_seconds {
            Some(0) | None => self.services.default_timeout_seconds,
            Some(t) => t,
        };
        let execution_id = Uuid::new_v4().to_string();
        let channel = result_channel(&execution_id);

        let mut subscription = self.services.bus.subscribe(&channel).await.map_err(|err| {
            DispatchApiError::Internal(Json(ErrorBody { error: err.to_string() }))
        })?;

        let context = ExecutionContext {
            execution_id: execution_id.clone(),
            user_id: body.user_id,
            org_id: body.org_id,
            workflow_name: body.workflow_name,
            parameters: body.parameters,
            timeout_seconds,
            deadline: Utc::now() + chrono::Duration::seconds(timeout_seconds as i64),
        };

        self.services.pool.route(context).await.map_err(|err| match err {
            PoolError::NoIdleWorker => {
                DispatchApiError::NoWorkerAvailable(Json(ErrorBody { error: err.to_string() }))
            }
            PoolError::MinWorkersTooLow { .. } | PoolError::MinExceedsMax { .. } => {
                DispatchApiError::Invalid(Json(ErrorBody { error: err.to_string() }))
            }
            PoolError::Context(_) => DispatchApiError::Internal(Json(ErrorBody { error: err.to_string() })),
        })?;

        let wait_budget =
            Duration::from_secs(timeout_seconds + self.services.graceful_shutdown_seconds + 5);
        match tokio::time::timeout(wait_budget, subscription.recv()).await {
            Ok(Some(payload)) => {
                let result: bifrost_common::model::ExecutionResult =
                    serde_json::from_value(payload).map_err(|err| {
                        DispatchApiError::Internal(Json(ErrorBody { error: err.to_string() }))
                    })?;
                Ok(Json(result.into()))
            }
            Ok(None) => Err(DispatchApiError::Internal(Json(ErrorBody {
                error: "result bus subscription closed before a result arrived".to_string(),
            }))),
            Err(_) => Err(DispatchApiError::Timeout(Json(ErrorBody {
                error: format!("no result for execution {execution_id} within {wait_budget:?}"),
            }))),
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bifrost_common::model::ExecutionContext;
use bifrost_pool::PoolError;
use chrono::Utc;
use tonic::transport::{Error, Server};
use tonic::{Request, Response, Status};
use tracing::warn;
use uuid::Uuid;

use crate::result_bus::result_channel;
use crate::services::Services;

pub mod proto {
    tonic::include_proto!("bifrost.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("dispatch");
}

use proto::dispatch_service_server::{DispatchService, DispatchServiceServer};
use proto::{DispatchRequest, DispatchResult};

/// Thin gRPC mirror of `api::dispatch::DispatchApi`, for callers that
/// prefer a typed RPC over the JSON HTTP surface. Both adapters delegate
/// to the same `ProcessPoolManager`/result-bus plumbing; neither holds any
/// logic of its own.
pub struct DispatchGrpcApi {
    services: Arc<Services>,
}

impl DispatchGrpcApi {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[tonic::async_trait]
impl DispatchService for DispatchGrpcApi {
    async fn dispatch(&self, request: Request<DispatchRequest>) -> Result<Response<DispatchResult>, Status> {
        let req = request.into_inner();
        if req.workflow_name.trim().is_empty() {
            return Err(Status::invalid_argument("workflow_name must not be empty"));
        }

        let parameters: serde_json::Value = if req.parameters_json.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&req.parameters_json)
                .map_err(|err| Status::invalid_argument(format!("invalid parameters_json: {err}")))?
        };

        let timeout_seconds = if req.timeout_seconds == 0 {
            self.services.default_timeout_seconds
        } else {
            req.timeout_seconds
        };

        let execution_id = Uuid::new_v4().to_string();
        let channel = result_channel(&execution_id);
        let mut subscription = self
            .services
            .bus
            .subscribe(&channel)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let context = ExecutionContext {
            execution_id: execution_id.clone(),
            user_id: req.user_id,
            org_id: req.org_id,
            workflow_name: req.workflow_name,
            parameters,
            timeout_seconds,
            deadline: Utc::now() + chrono::Duration::seconds(timeout_seconds as i64),
        };

        self.services.pool.route(context).await.map_err(|err| match err {
            PoolError::NoIdleWorker => Status::resource_exhausted(err.to_string()),
            PoolError::MinWorkersTooLow { .. } | PoolError::MinExceedsMax { .. } => {
                Status::invalid_argument(err.to_string())
            }
            PoolError::Context(_) => Status::internal(err.to_string()),
        })?;

        let wait_budget = Duration::from_secs(timeout_seconds + self.services.graceful_shutdown_seconds + 5);
        let payload = match tokio::time::timeout(wait_budget, subscription.recv()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(Status::internal("result bus subscription closed before a result arrived")),
            Err(_) => return Err(Status::deadline_exceeded(format!("no result within {wait_budget:?}"))),
        };

        let result: bifrost_common::model::ExecutionResult =
            serde_json::from_value(payload).map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(DispatchResult {
            execution_id: result.execution_id,
            success: result.success,
            value_json: result.value.map(|v| v.to_string()).unwrap_or_default(),
            error_kind: result.error_kind.map(|k| format!("{k:?}")).unwrap_or_default(),
            error_message: result.error_message.unwrap_or_default(),
            duration_ms: result.duration_ms,
        }))
    }
}

pub async fn start_grpc_server(addr: SocketAddr, services: Arc<Services>) -> Result<(), Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_serving::<DispatchServiceServer<DispatchGrpcApi>>().await;

    let reflection_service = match tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
    {
        Ok(service) => Some(service),
        Err(err) => {
            warn!(error = %err, "failed to build gRPC reflection service, continuing without it");
            None
        }
    };

    let router = Server::builder()
        .add_service(health_service)
        .add_service(DispatchServiceServer::new(DispatchGrpcApi::new(services)));

    match reflection_service {
        Some(reflection_service) => router.add_service(reflection_service).serve(addr).await,
        None => router.serve(addr).await,
    }
}

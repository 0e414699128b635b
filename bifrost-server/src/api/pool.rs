use std::sync::Arc;

use bifrost_bus::channels;
use poem_openapi::payload::Json;
use poem_openapi::*;
use serde_json::json;

use crate::api::dto::{ErrorBody, PoolResizeRequest, PoolStatusDto, RecycleRequest, RecycleResponse};
use crate::api::ApiTags;
use crate::services::Services;

#[derive(ApiResponse, Debug, Clone)]
pub enum PoolApiError {
    #[oai(status = 400)]
    Invalid(Json<ErrorBody>),
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

type Result<T> = std::result::Result<T, PoolApiError>;

pub struct PoolApi {
    services: Arc<Services>,
}

/// Admin surface over the process pool manager (§4.10 / §6's worker
/// command contract). `resize` and `recycle` call the manager directly
/// since both are plain public methods; `recycle-all` goes out over the
/// pool's own command channel instead, the same path an operator's
/// out-of-process tool would use, since the manager only exposes that one
/// as a broadcast command (§4.10's `recycle_all`).
#[OpenApi(prefix_path = "/v1/pool", tag = ApiTags::Pool)]
impl PoolApi {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Current pool status
    #[oai(path = "/status", method = "get", operation_id = "pool_status")]
    async fn status(&self) -> Json<PoolStatusDto> {
        Json(self.services.pool.status().await.into())
    }

    /// Resize the pool's min/max worker bounds
    #[oai(path = "/resize", method = "post", operation_id = "pool_resize")]
    async fn resize(&self, body: Json<PoolResizeRequest>) -> Result<Json<PoolStatusDto>> {
        self.services
            .pool
            .resize(body.0.min_workers, body.0.max_workers)
            .await
            .map_err(|err| PoolApiError::Invalid(Json(ErrorBody { error: err.to_string() })))?;
        Ok(Json(self.services.pool.status().await.into()))
    }

    /// Recycle a single worker (or any idle worker if no pid is given)
    #[oai(path = "/recycle", method = "post", operation_id = "pool_recycle")]
    async fn recycle(&self, body: Json<RecycleRequest>) -> Json<RecycleResponse> {
        let recycled = self.services.pool.recycle_by_pid(body.0.pid).await;
        Json(RecycleResponse { recycled })
    }

    /// Mark every worker for recycling; idle workers recycle immediately,
    /// busy ones recycle when their current execution finishes
    #[oai(path = "/recycle-all", method = "post", operation_id = "pool_recycle_all")]
    async fn recycle_all(&self) -> Result<Json<RecycleResponse>> {
        let worker_id = self.services.pool.status().await.worker_id;
        let channel = channels::pool_commands(&worker_id);
        self.services
            .bus
            .publish(&channel, json!({"action": "recycle_all", "reason": "admin API request"}))
            .await
            .map_err(|err| PoolApiError::Internal(Json(ErrorBody { error: err.to_string() })))?;
        Ok(Json(RecycleResponse { recycled: true }))
    }
}

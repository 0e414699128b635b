use std::sync::Arc;

use poem_openapi::payload::Json;
use poem_openapi::*;

use crate::api::dto::{ErrorBody, ReindexCountsDto, ReindexErrorDto, ReindexResponse};
use crate::api::ApiTags;
use crate::services::Services;

#[derive(ApiResponse, Debug, Clone)]
pub enum ReindexApiError {
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

pub struct ReindexApi {
    services: Arc<Services>,
}

/// On-demand trigger for the reconciliation sweep (C12, §4.12). Production
/// deployments also run this on a timer; the endpoint exists for operator-
/// triggered repairs between ticks.
#[OpenApi(prefix_path = "/v1/reindex", tag = ApiTags::Reindex)]
impl ReindexApi {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    #[oai(path = "/", method = "post", operation_id = "trigger_reindex")]
    async fn reindex(&self) -> std::result::Result<Json<ReindexResponse>, ReindexApiError> {
        let result = self
            .services
            .reindexer
            .sweep()
            .await
            .map_err(|err| ReindexApiError::Internal(Json(ErrorBody { error: err.to_string() })))?;

        Ok(Json(ReindexResponse {
            counts: ReindexCountsDto {
                files_indexed: result.counts.files_indexed,
                files_removed: result.counts.files_removed,
                workflows_deactivated: result.counts.workflows_deactivated,
                ids_corrected: result.counts.ids_corrected,
            },
            errors: result
                .errors
                .into_iter()
                .map(|e| ReindexErrorDto {
                    path: e.path,
                    field: e.field,
                    referenced_id: e.referenced_id,
                    message: e.message,
                })
                .collect(),
        }))
    }
}

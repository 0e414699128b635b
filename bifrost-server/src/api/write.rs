use std::sync::Arc;

use bifrost_indexing::WriteOutcome;
use poem_openapi::param::Query;
use poem_openapi::payload::Json;
use poem_openapi::*;

use crate::api::dto::{
    AvailableReplacementDto, DeleteResponse, ErrorBody, PendingDeactivationDto, PendingDeactivationResponse,
    WriteOkResponse, WriteRequest,
};
use crate::api::ApiTags;
use crate::services::Services;

#[derive(ApiResponse, Debug, Clone)]
pub enum WriteApiError {
    #[oai(status = 400)]
    Invalid(Json<ErrorBody>),
    #[oai(status = 409)]
    PendingDeactivation(Json<PendingDeactivationResponse>),
    #[oai(status = 500)]
    Internal(Json<ErrorBody>),
}

impl From<bifrost_indexing::WriteError> for WriteApiError {
    fn from(err: bifrost_indexing::WriteError) -> Self {
        WriteApiError::Internal(Json(ErrorBody { error: err.to_string() }))
    }
}

type Result<T> = std::result::Result<T, WriteApiError>;

pub struct WriteApi {
    services: Arc<Services>,
}

#[OpenApi(prefix_path = "/v1/artifacts", tag = ApiTags::Write)]
impl WriteApi {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Write (create or update) a source artifact
    ///
    /// Routes the content by path convention: `*.py` is parsed for workflow,
    /// tool, and data-provider entities; `forms/<uuid>.form.yaml` and
    /// `agents/<uuid>.agent.yaml` upsert a single form or agent record;
    /// everything else is stored as an opaque blob. A write that would
    /// silently deactivate an entity with execution history or an active
    /// endpoint comes back as `409` instead, unless `forceDeactivation` is
    /// set or every affected entity is covered by `replacements`.
    #[oai(path = "/", method = "post", operation_id = "write_artifact")]
    async fn write(&self, body: Json<WriteRequest>) -> Result<Json<WriteOkResponse>> {
        let body = body.0;
        let outcome = self
            .services
            .write_pipeline
            .write(
                &body.path,
                body.content.into_bytes(),
                body.content_type,
                &body.updated_by,
                body.force_deactivation,
                &body.replacements.into_iter().collect(),
            )
            .await?;

        match outcome {
            WriteOutcome::Ok { path, content_hash, entities_upserted, diagnostics, content_modified } => {
                Ok(Json(WriteOkResponse {
                    path,
                    content_hash,
                    entities_upserted: entities_upserted.into_iter().map(Into::into).collect(),
                    diagnostics,
                    content_modified,
                }))
            }
            WriteOutcome::PendingDeactivation { pending, replacements } => {
                Err(WriteApiError::PendingDeactivation(Json(PendingDeactivationResponse {
                    pending: pending.into_iter().map(PendingDeactivationDto::from).collect(),
                    replacements: replacements.into_iter().map(AvailableReplacementDto::from).collect(),
                })))
            }
            WriteOutcome::Invalid { reason } => Err(WriteApiError::Invalid(Json(ErrorBody { error: reason }))),
        }
    }

    /// Delete a source artifact
    ///
    /// Removes the blob (and, for executable/form/agent routes, the
    /// corresponding index rows) and deactivates every entity that was
    /// registered at the path. Returns the number of entities deactivated.
    #[oai(path = "/", method = "delete", operation_id = "delete_artifact")]
    async fn delete(&self, path: Query<String>) -> Result<Json<DeleteResponse>> {
        let entities_deactivated = self.services.write_pipeline.delete(&path.0).await?;
        Ok(Json(DeleteResponse { entities_deactivated }))
    }
}

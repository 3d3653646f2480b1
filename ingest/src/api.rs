use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("event submitted without a tenant id")]
    MissingTenantId,
    #[error("record {index} holds an undecodable json payload")]
    RecordPayloadInvalid { index: usize },
    #[error("batch exceeds the configured limit of {limit} records")]
    BatchTooLarge { limit: usize },

    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum event size exceeded")]
    EventTooBig,
    #[error("invalid event could not be processed")]
    NonRetryableSinkError,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::RequestDecodingError(_)
            | IngestError::RequestParsingError(_)
            | IngestError::MissingTenantId
            | IngestError::RecordPayloadInvalid { .. }
            | IngestError::BatchTooLarge { .. }
            | IngestError::EventTooBig
            | IngestError::NonRetryableSinkError => (StatusCode::BAD_REQUEST, self.to_string()),

            IngestError::RetryableSinkError => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

/// One record of the batch ingestion call. The payload travels as an
/// opaque JSON string so partners can ship arbitrary shapes in a single
/// round trip.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventRecord {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub received_at: Option<String>,
    #[serde(default)]
    pub json_payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub events: Vec<RawEventRecord>,
}

/// The batch response carries only the accepted count, with no
/// per-item breakdown.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchResponse {
    pub accepted: usize,
}

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{Map, Value};
use tracing::instrument;

use pipeline_common::envelope::EventEnvelope;

use crate::api::{BatchRequest, BatchResponse, IngestError, RawEventRecord};
use crate::time::TimeSource;
use crate::{router, sinks};

/// Single-event ingestion, forwarded to the internal partitioned log.
#[instrument(skip_all, fields(tenant))]
pub async fn event(
    state: State<router::State>,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    let envelope = decode_envelope(body)?;
    tracing::Span::current().record("tenant", envelope.tenant_id.as_str());

    accept_envelope(state.log_sink.clone(), state.timesource.now(), envelope).await?;

    Ok(StatusCode::ACCEPTED)
}

/// Single-event partner ingestion, routed to the partner shard stream
/// instead of the internal log. The destination is the only difference
/// with the plain event path.
#[instrument(skip_all, fields(tenant))]
pub async fn partner_event(
    state: State<router::State>,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    let envelope = decode_envelope(body)?;
    tracing::Span::current().record("tenant", envelope.tenant_id.as_str());

    accept_envelope(state.partner_sink.clone(), state.timesource.now(), envelope).await?;

    Ok(StatusCode::ACCEPTED)
}

/// Batch ingestion: one call carrying a bounded list of raw records.
///
/// An unparseable timestamp on a record is defaulted and processing
/// continues, but a record whose json payload does not decode fails the
/// whole call: the decoded payload is structurally required downstream,
/// and the response carries no per-item breakdown that could report a
/// partial acceptance.
#[instrument(skip_all, fields(batch_size))]
pub async fn batch(
    state: State<router::State>,
    body: Bytes,
) -> Result<Json<BatchResponse>, IngestError> {
    let request: BatchRequest = serde_json::from_slice(&body)?;
    tracing::Span::current().record("batch_size", request.events.len());

    if request.events.len() > state.max_batch_size {
        return Err(IngestError::BatchTooLarge {
            limit: state.max_batch_size,
        });
    }

    let now = state.timesource.now();
    let envelopes = request
        .events
        .iter()
        .enumerate()
        .map(|(index, record)| build_envelope(record, index, now))
        .collect::<Result<Vec<EventEnvelope>, IngestError>>()?;

    let accepted = envelopes.len();
    counter!("ingest_events_received_total").increment(accepted as u64);

    state.log_sink.send_batch(envelopes).await?;

    Ok(Json(BatchResponse { accepted }))
}

fn decode_envelope(body: Bytes) -> Result<EventEnvelope, IngestError> {
    tracing::debug!(len = body.len(), "decoding new event");
    let envelope = serde_json::from_slice::<EventEnvelope>(&body)?;
    Ok(envelope)
}

/// Validates and forwards one envelope to the given destination. Envelopes
/// without a tenant never reach a broker; publish failures propagate to
/// the caller, which decides whether to fail the request.
async fn accept_envelope(
    sink: Arc<dyn sinks::Event + Send + Sync>,
    now: DateTime<Utc>,
    mut envelope: EventEnvelope,
) -> Result<(), IngestError> {
    if !envelope.has_tenant() {
        counter!("ingest_events_dropped_total", "cause" => "missing_tenant").increment(1);
        return Err(IngestError::MissingTenantId);
    }
    envelope.ensure_received_at(now);

    counter!("ingest_events_received_total").increment(1);

    sink.send(envelope).await
}

/// Normalizes one raw batch record into an envelope.
fn build_envelope(
    record: &RawEventRecord,
    index: usize,
    now: DateTime<Utc>,
) -> Result<EventEnvelope, IngestError> {
    if record.tenant_id.trim().is_empty() {
        counter!("ingest_events_dropped_total", "cause" => "missing_tenant").increment(1);
        return Err(IngestError::MissingTenantId);
    }

    let payload = serde_json::from_str::<Map<String, Value>>(&record.json_payload).map_err(|e| {
        tracing::warn!("rejected batch record {} with invalid payload: {}", index, e);
        IngestError::RecordPayloadInvalid { index }
    })?;

    // Unparseable timestamps default to processing time, they do not
    // reject the record.
    let received_at = record
        .received_at
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(now);

    Ok(EventEnvelope {
        tenant_id: record.tenant_id.clone(),
        source: record.source.clone(),
        schema_version: record.schema_version.clone(),
        received_at: Some(received_at),
        payload,
    })
}

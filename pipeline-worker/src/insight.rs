use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pipeline_common::audit::{parse_tenant_id, AuditLogEntry};
use pipeline_common::storage::{Storage, StorageError};

use crate::config::InsightConfig;

/// Actor recorded on audit entries produced by automated enrichment.
pub const INSIGHT_ACTOR: &str = "openai";
/// Action code marking insight creation.
pub const INSIGHT_ACTION: &str = "INSIGHT_CREATED";
/// Substitute detail text when the external call yields nothing usable.
pub const NO_INSIGHT_FALLBACK: &str = "no insight generated";

const SUMMARY_PROMPT: &str = "Summarize anomalies from this payload in 2 sentences:";

#[derive(Serialize)]
struct InsightRequest<'a> {
    model: &'a str,
    input: String,
}

#[derive(Deserialize)]
struct InsightResponse {
    output_text: Option<String>,
}

/// Turns raw payloads into analyst-readable summaries through an external
/// model call, and records each produced insight as an audit entry.
///
/// Enrichment is strictly best-effort: a failed or empty model response
/// downgrades to a fixed placeholder, it never fails the owning job. Only
/// the audit write can fail the call.
pub struct InsightService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    enabled: bool,
    storage: Arc<dyn Storage + Send + Sync>,
}

impl InsightService {
    pub fn new(
        config: &InsightConfig,
        storage: Arc<dyn Storage + Send + Sync>,
        request_timeout: Duration,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(api_key) = &config.insight_api_key {
            if let Ok(mut value) = header::HeaderValue::from_str(&format!("Bearer {api_key}")) {
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("event-pipeline insight worker")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for insights");

        Self {
            client,
            base_url: config.insight_base_url.trim_end_matches('/').to_owned(),
            model: config.insight_model.clone(),
            enabled: config.insight_enabled,
            storage,
        }
    }

    /// Generates and stores one insight for the payload, if enabled.
    /// There is deliberately no deduplication: re-running the same payload
    /// produces an independent audit entry every time.
    pub async fn generate_insight(
        &self,
        tenant_id: &str,
        payload: &str,
    ) -> Result<(), StorageError> {
        if !self.enabled {
            return Ok(());
        }

        let details = self.summarize(payload).await;

        let entry = AuditLogEntry {
            tenant_id: parse_tenant_id(tenant_id),
            actor: INSIGHT_ACTOR.to_owned(),
            action: INSIGHT_ACTION.to_owned(),
            occurred_at: Utc::now(),
            details,
        };
        self.storage.persist_audit(&entry).await?;

        counter!("insight_audit_entries_total").increment(1);
        Ok(())
    }

    async fn summarize(&self, payload: &str) -> String {
        let request = InsightRequest {
            model: &self.model,
            input: format!("{SUMMARY_PROMPT} {payload}"),
        };

        let response = match self
            .client
            .post(format!("{}/v1/responses", self.base_url))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                counter!("insight_requests_failed_total").increment(1);
                warn!("insight request failed: {}", err);
                return NO_INSIGHT_FALLBACK.to_owned();
            }
        };

        if !response.status().is_success() {
            counter!("insight_requests_failed_total").increment(1);
            warn!("insight request rejected with status {}", response.status());
            return NO_INSIGHT_FALLBACK.to_owned();
        }

        match response.json::<InsightResponse>().await {
            Ok(InsightResponse {
                output_text: Some(text),
            }) if !text.trim().is_empty() => text,
            Ok(_) => NO_INSIGHT_FALLBACK.to_owned(),
            Err(err) => {
                warn!("could not parse insight response: {}", err);
                NO_INSIGHT_FALLBACK.to_owned()
            }
        }
    }
}

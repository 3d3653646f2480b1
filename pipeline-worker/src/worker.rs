use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use tracing::{error, info, warn};

use pipeline_common::envelope::EventEnvelope;
use pipeline_common::jobqueue::{Job, PgQueue, ScoringJob};
use pipeline_common::storage::StorageError;

use crate::error::WorkerError;
use crate::insight::InsightService;

/// Sentinel tenant recorded when a job payload cannot be parsed.
pub const UNKNOWN_TENANT: &str = "unknown";

/// Consumes scoring jobs from the work queue, one at a time. Several
/// workers may run against the same queue; delivery is at-least-once and
/// each job goes to exactly one of them.
pub struct ScoringWorker {
    queue: Arc<PgQueue>,
    insights: InsightService,
    poll_interval: Duration,
    liveness: HealthHandle,
}

impl ScoringWorker {
    pub fn new(
        queue: Arc<PgQueue>,
        insights: InsightService,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            insights,
            poll_interval,
            liveness,
        }
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            while let Some(job) = self.queue.dequeue::<ScoringJob>().await? {
                self.process(job).await?;
            }
        }
    }

    /// Process one claimed job and record its outcome in the queue. Only
    /// queue bookkeeping failures abort the worker.
    async fn process(&self, job: Job<ScoringJob>) -> Result<(), WorkerError> {
        counter!("scoring_jobs_total").increment(1);

        match score_payload(&job.parameters.payload, &self.insights).await {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                counter!("scoring_jobs_completed_total").increment(1);
            }
            Err(err) => {
                error!("scoring job {} failed: {}", job.id, err);
                self.queue.fail(job.id).await?;
                counter!("scoring_jobs_failed_total").increment(1);
            }
        }

        Ok(())
    }
}

/// Score one raw payload and trigger optional insight generation.
pub async fn score_payload(
    payload: &str,
    insights: &InsightService,
) -> Result<(), StorageError> {
    let tenant_id = tenant_for_payload(payload);

    // TODO: call the anomaly scoring service and persist scores once it is deployed.
    info!(length = payload.len(), tenant_id = %tenant_id, "scoring payload");

    insights.generate_insight(&tenant_id, payload).await
}

/// Best-effort attribution: scoring can proceed without tenant context, so
/// an unparseable payload downgrades to the sentinel tenant instead of
/// failing the job.
pub fn tenant_for_payload(payload: &str) -> String {
    match EventEnvelope::from_payload(payload) {
        Ok(envelope) => envelope.tenant_id,
        Err(err) => {
            warn!(
                "unable to parse tenant id from payload, defaulting to {}: {}",
                UNKNOWN_TENANT, err
            );
            UNKNOWN_TENANT.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::routing::post;
    use axum::Router;

    use crate::config::InsightConfig;
    use crate::insight::{InsightService, NO_INSIGHT_FALLBACK};
    use crate::testing::MemoryStorage;
    use crate::worker::{score_payload, tenant_for_payload, UNKNOWN_TENANT};

    const JOB_PAYLOAD: &str =
        r#"{"tenantId":"t-1","source":"agent","schemaVersion":"v1","payload":{}}"#;

    fn service(base_url: &str, enabled: bool, storage: Arc<MemoryStorage>) -> InsightService {
        let config = InsightConfig {
            insight_enabled: enabled,
            insight_model: "gpt-4o-mini".to_string(),
            insight_base_url: base_url.to_string(),
            insight_api_key: None,
        };
        InsightService::new(&config, storage, Duration::from_secs(5))
    }

    #[test]
    fn tenant_comes_from_the_payload() {
        assert_eq!(tenant_for_payload(JOB_PAYLOAD), "t-1");
    }

    #[test]
    fn unparseable_payload_defaults_to_the_sentinel() {
        assert_eq!(tenant_for_payload("][ garbage"), UNKNOWN_TENANT);
    }

    #[tokio::test]
    async fn disabled_enrichment_writes_no_audit_entry() {
        let storage = Arc::new(MemoryStorage::default());
        let insights = service("http://localhost:1", false, storage.clone());

        score_payload(JOB_PAYLOAD, &insights)
            .await
            .expect("job failed");

        assert!(storage.audits().is_empty());
    }

    #[tokio::test]
    async fn enrichment_without_usable_text_records_the_fallback() {
        // A model endpoint that answers with no usable text
        let app = Router::new().route(
            "/v1/responses",
            post(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    "{}",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let storage = Arc::new(MemoryStorage::default());
        let insights = service(&format!("http://{addr}"), true, storage.clone());

        score_payload(JOB_PAYLOAD, &insights)
            .await
            .expect("job failed");

        let audits = storage.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].details, NO_INSIGHT_FALLBACK);
        // "t-1" is not numeric, so the entry carries no tenant
        assert_eq!(audits[0].tenant_id, None);
    }
}

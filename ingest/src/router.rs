use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use pipeline_common::metrics::{setup_metrics_recorder, track_metrics};

use crate::{ingest, sinks, time::TimeSource};

#[derive(Clone)]
pub struct State {
    pub log_sink: Arc<dyn sinks::Event + Send + Sync>,
    pub partner_sink: Arc<dyn sinks::Event + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub max_batch_size: usize,
}

async fn index() -> &'static str {
    "ingest"
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    L: sinks::Event + Send + Sync + 'static,
    P: sinks::Event + Send + Sync + 'static,
>(
    timesource: TZ,
    log_sink: L,
    partner_sink: P,
    liveness: HealthRegistry,
    max_batch_size: usize,
    metrics: bool,
) -> Router {
    let state = State {
        log_sink: Arc::new(log_sink),
        partner_sink: Arc::new(partner_sink),
        timesource: Arc::new(timesource),
        max_batch_size,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/events", post(ingest::event))
        .route("/events/batch", post(ingest::batch))
        .route("/partners/events", post(ingest::partner_event))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when ingest is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

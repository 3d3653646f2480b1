//! Consume the internal log, poll the partner stream, and run scoring jobs.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use health::HealthRegistry;

use pipeline_common::jobqueue::{JobSink, PgQueue};
use pipeline_common::metrics::{serve, setup_metrics_router};
use pipeline_common::storage::{HttpStorage, Storage};
use pipeline_worker::config::Config;
use pipeline_worker::consumer::FanoutConsumer;
use pipeline_worker::error::WorkerError;
use pipeline_worker::insight::InsightService;
use pipeline_worker::poller::PartnerPoller;
use pipeline_worker::stream::KinesisStream;
use pipeline_worker::worker::ScoringWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let storage: Arc<dyn Storage + Send + Sync> = Arc::new(HttpStorage::new(
        &config.storage_base_url,
        config.request_timeout.0,
    ));
    let queue = Arc::new(
        PgQueue::new(&config.queue_table, &config.database_url)
            .await
            .expect("failed to initialize queue"),
    );
    let jobs: Arc<dyn JobSink + Send + Sync> = queue.clone();

    let bind = config.bind();
    let liveness_router = liveness.clone();
    tokio::task::spawn(async move {
        let router = setup_metrics_router()
            .route("/_liveness", get(move || ready(liveness_router.get_status())));
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let consumer_liveness = liveness
        .register("consumer".to_string(), time::Duration::seconds(60))
        .await;
    let consumer = FanoutConsumer::new(
        &config.kafka,
        storage.clone(),
        jobs.clone(),
        consumer_liveness,
    )?;
    tokio::spawn(async move {
        if let Err(err) = consumer.run().await {
            tracing::error!("log consumer exited: {}", err);
            std::process::exit(1);
        }
    });

    let poller_liveness = liveness
        .register("poller".to_string(), time::Duration::seconds(60))
        .await;
    let stream = Arc::new(KinesisStream::new(&config.partner).await);
    let poller = PartnerPoller::new(
        stream,
        storage.clone(),
        jobs,
        config.partner.partner_poll_enabled,
        config.partner.partner_fetch_limit,
        config.partner.partner_poll_interval.0,
        poller_liveness,
    );
    tokio::spawn(poller.run());

    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;
    let insights = InsightService::new(&config.insight, storage, config.request_timeout.0);
    let worker = ScoringWorker::new(
        queue,
        insights,
        config.queue_poll_interval.0,
        worker_liveness,
    );

    worker.run().await?;

    Ok(())
}

use std::future::Future;

use health::HealthRegistry;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::kinesis::KinesisSink;
use crate::sinks::PrintSink;
use crate::{router, time};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let app = if config.print_sink {
        router::router(
            time::SystemTime {},
            PrintSink {},
            PrintSink {},
            liveness,
            config.max_batch_size,
            config.export_prometheus,
        )
    } else {
        let sink_liveness = liveness
            .register("rdkafka".to_string(), ::time::Duration::seconds(30))
            .await;
        let log_sink =
            KafkaSink::new(config.kafka, sink_liveness).expect("failed to start Kafka sink");
        let partner_sink = KinesisSink::new(&config.partner).await;

        router::router(
            time::SystemTime {},
            log_sink,
            partner_sink,
            liveness,
            config.max_batch_size,
            config.export_prometheus,
        )
    };

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap()
}

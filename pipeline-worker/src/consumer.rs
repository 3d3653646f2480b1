use std::sync::Arc;

use health::HealthHandle;
use metrics::counter;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message};
use thiserror::Error;
use tracing::{debug, error};

use pipeline_common::envelope::EventEnvelope;
use pipeline_common::jobqueue::{JobSink, QueueError};
use pipeline_common::storage::{Storage, StorageError};

use crate::config::KafkaConsumerConfig;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("failed to decode log message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("log message is not valid utf-8")]
    Encoding,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

struct FanoutContext {
    liveness: HealthHandle,
}

impl ClientContext for FanoutContext {
    fn stats(&self, _stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }
}

impl ConsumerContext for FanoutContext {}

/// Consumes the internal partitioned log and fans every event out to the
/// storage boundary and the scoring queue.
///
/// Offsets are stored manually, only once a message made it through both
/// steps, so redelivery covers anything the process drops on the floor.
/// Within a tenant's partition, persistence and enqueue happen in delivery
/// order, and an event that was not durably stored never produces a
/// scoring job.
pub struct FanoutConsumer {
    consumer: StreamConsumer<FanoutContext>,
    topic: String,
    storage: Arc<dyn Storage + Send + Sync>,
    jobs: Arc<dyn JobSink + Send + Sync>,
}

impl FanoutConsumer {
    pub fn new(
        config: &KafkaConsumerConfig,
        storage: Arc<dyn Storage + Send + Sync>,
        jobs: Arc<dyn JobSink + Send + Sync>,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer<FanoutContext> =
            client_config.create_with_context(FanoutContext { liveness })?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
            storage,
            jobs,
        })
    }

    /// Run until the broker connection fails. Broker errors are not
    /// retried here, they propagate to the caller.
    pub async fn run(&self) -> Result<(), KafkaError> {
        loop {
            let message = self.consumer.recv().await?;

            let handled = match message.payload() {
                Some(payload) => match std::str::from_utf8(payload) {
                    Ok(raw) => {
                        handle_payload(raw, self.storage.as_ref(), self.jobs.as_ref()).await
                    }
                    Err(_) => Err(FanoutError::Encoding),
                },
                None => Err(FanoutError::Encoding),
            };

            match handled {
                Ok(()) => {
                    // Only a fully fanned-out message moves the offset forward.
                    self.consumer.store_offset(
                        &self.topic,
                        message.partition(),
                        message.offset(),
                    )?;
                    counter!("fanout_events_consumed_total").increment(1);
                    debug!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "fanned out event"
                    );
                }
                Err(err @ (FanoutError::Decode(_) | FanoutError::Encoding)) => {
                    // Undecodable messages are left to the broker's
                    // redelivery; the offset is not stored.
                    counter!("fanout_decode_errors_total").increment(1);
                    error!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "failed to decode log message: {}",
                        err
                    );
                }
                Err(err) => {
                    counter!("fanout_errors_total").increment(1);
                    error!("failed to fan out event: {}", err);
                }
            }
        }
    }
}

/// Decode, persist, then enqueue, in that order. Persistence failure
/// aborts before the enqueue.
pub async fn handle_payload(
    raw: &str,
    storage: &dyn Storage,
    jobs: &dyn JobSink,
) -> Result<(), FanoutError> {
    let envelope = EventEnvelope::from_payload(raw)?;
    storage.persist_event(&envelope).await?;
    jobs.enqueue_payload(raw).await?;
    Ok(())
}

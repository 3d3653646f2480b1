use thiserror::Error;

use pipeline_common::jobqueue::QueueError;
use pipeline_common::storage::StorageError;

/// Enumeration of errors that terminate a worker loop. Per-record and
/// per-job failures are handled where they happen; only broker and queue
/// level conditions bubble up this far.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred: {0}")]
    Queue(#[from] QueueError),
    #[error("a kafka error occurred: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("a storage error occurred: {0}")]
    Storage(#[from] StorageError),
}

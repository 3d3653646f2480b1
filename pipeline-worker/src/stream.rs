use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::config::Region;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use thiserror::Error;
use tracing::info;

use crate::config::PartnerStreamConfig;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("partner stream request failed: {0}")]
    Request(String),
}

/// One fetch worth of records plus the token to resume from. A None token
/// means the shard is closed and fully consumed.
pub struct RecordBatch {
    pub records: Vec<Vec<u8>>,
    pub next_cursor: Option<String>,
}

/// The partner-facing shard stream: independently ordered shards, each
/// read through an explicit position token. Modeled as a trait so the
/// poller can be exercised without a live stream.
#[async_trait]
pub trait PartnerStream {
    async fn list_shards(&self) -> Result<Vec<String>, StreamError>;
    /// A cursor positioned at the oldest retained record of the shard.
    async fn oldest_cursor(&self, shard_id: &str) -> Result<Option<String>, StreamError>;
    async fn fetch(&self, cursor: &str, limit: i32) -> Result<RecordBatch, StreamError>;
}

/// Kinesis-backed partner stream.
pub struct KinesisStream {
    client: Client,
    stream_name: String,
}

impl KinesisStream {
    /// Uses the default AWS credential chain; the endpoint override is for
    /// localstack.
    pub async fn new(config: &PartnerStreamConfig) -> KinesisStream {
        let region = Region::new(config.partner_stream_region.clone());

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_kinesis::config::Builder::from(&aws_config).region(region);
        if let Some(endpoint) = &config.partner_stream_endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!("polling partner stream {}", config.partner_stream_name);

        KinesisStream {
            client: Client::from_conf(builder.build()),
            stream_name: config.partner_stream_name.clone(),
        }
    }
}

#[async_trait]
impl PartnerStream for KinesisStream {
    async fn list_shards(&self) -> Result<Vec<String>, StreamError> {
        let response = self
            .client
            .list_shards()
            .stream_name(&self.stream_name)
            .send()
            .await
            .map_err(|e| StreamError::Request(e.to_string()))?;

        Ok(response
            .shards()
            .iter()
            .map(|shard| shard.shard_id().to_owned())
            .collect())
    }

    async fn oldest_cursor(&self, shard_id: &str) -> Result<Option<String>, StreamError> {
        let response = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(ShardIteratorType::TrimHorizon)
            .send()
            .await
            .map_err(|e| StreamError::Request(e.to_string()))?;

        Ok(response.shard_iterator().map(str::to_owned))
    }

    async fn fetch(&self, cursor: &str, limit: i32) -> Result<RecordBatch, StreamError> {
        let response = self
            .client
            .get_records()
            .shard_iterator(cursor)
            .limit(limit)
            .send()
            .await
            .map_err(|e| StreamError::Request(e.to_string()))?;

        let records = response
            .records()
            .iter()
            .map(|record| record.data().as_ref().to_vec())
            .collect();

        Ok(RecordBatch {
            records,
            next_cursor: response.next_shard_iterator().map(str::to_owned),
        })
    }
}

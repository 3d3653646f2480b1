use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditLogEntry;
use crate::envelope::EventEnvelope;

/// Enumeration of errors raised by the storage boundary. The storage
/// service owns persistence; callers only see transport and status
/// failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage rejected the request with status {0}")]
    ErrorStatus(reqwest::StatusCode),
}

/// A persisted event as returned by the storage service: the envelope
/// fields plus the storage-assigned document id.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub envelope: EventEnvelope,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTenant {
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
}

/// The storage boundary as seen from the pipeline: persist events and
/// audit entries, plus the tenant glue used by operational tooling. The
/// persistence layer itself lives behind this API.
#[async_trait]
pub trait Storage {
    async fn persist_event(&self, envelope: &EventEnvelope) -> Result<StoredEvent, StorageError>;
    async fn persist_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StorageError>;
    async fn create_tenant(&self, tenant: &NewTenant) -> Result<Tenant, StorageError>;
}

/// HTTP client for the storage service.
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStorage {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("event-pipeline storage client")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for storage");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Storage for HttpStorage {
    async fn persist_event(&self, envelope: &EventEnvelope) -> Result<StoredEvent, StorageError> {
        let response = self
            .client
            .post(self.url("/api/v1/storage/events"))
            .json(envelope)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::ErrorStatus(response.status()));
        }
        Ok(response.json::<StoredEvent>().await?)
    }

    async fn persist_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.url("/api/v1/storage/audit"))
            .json(entry)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::ErrorStatus(response.status()));
        }
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StorageError> {
        let response = self
            .client
            .get(self.url("/api/v1/storage/tenants"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::ErrorStatus(response.status()));
        }
        Ok(response.json::<Vec<Tenant>>().await?)
    }

    async fn create_tenant(&self, tenant: &NewTenant) -> Result<Tenant, StorageError> {
        let response = self
            .client
            .post(self.url("/api/v1/storage/tenants"))
            .json(tenant)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::ErrorStatus(response.status()));
        }
        Ok(response.json::<Tenant>().await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{StoredEvent, Tenant};

    #[test]
    fn stored_event_flattens_the_envelope() {
        let raw = json!({
            "id": "663fae1",
            "tenantId": "t-1",
            "source": "agent",
            "schemaVersion": "v1",
            "receivedAt": "2024-05-01T12:00:00Z",
            "payload": {"cpu": 0.5}
        });

        let stored: StoredEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(stored.id, "663fae1");
        assert_eq!(stored.envelope.tenant_id, "t-1");
        assert_eq!(stored.envelope.payload.get("cpu"), Some(&json!(0.5)));
    }

    #[test]
    fn tenant_decodes_without_industry() {
        let tenant: Tenant = serde_json::from_value(json!({"id": 7, "name": "acme"})).unwrap();
        assert_eq!(tenant.id, 7);
        assert_eq!(tenant.name, "acme");
        assert_eq!(tenant.industry, None);
    }
}

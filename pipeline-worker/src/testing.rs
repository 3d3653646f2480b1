use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use pipeline_common::audit::AuditLogEntry;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::jobqueue::{JobSink, QueueError};
use pipeline_common::storage::{NewTenant, Storage, StorageError, StoredEvent, Tenant};

/// In-memory storage double, recording what the pipeline persisted.
#[derive(Default)]
pub(crate) struct MemoryStorage {
    pub events: Mutex<Vec<EventEnvelope>>,
    pub audits: Mutex<Vec<AuditLogEntry>>,
    pub fail_events: AtomicBool,
    counter: AtomicUsize,
}

impl MemoryStorage {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn audits(&self) -> Vec<AuditLogEntry> {
        self.audits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist_event(&self, envelope: &EventEnvelope) -> Result<StoredEvent, StorageError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(StorageError::ErrorStatus(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(envelope.clone());
        Ok(StoredEvent {
            id: format!("mem-{id}"),
            envelope: envelope.clone(),
        })
    }

    async fn persist_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        self.audits.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StorageError> {
        Ok(vec![])
    }

    async fn create_tenant(&self, tenant: &NewTenant) -> Result<Tenant, StorageError> {
        Ok(Tenant {
            id: 1,
            name: tenant.name.clone(),
            industry: tenant.industry.clone(),
        })
    }
}

/// In-memory job sink double, recording enqueued raw payloads.
#[derive(Default)]
pub(crate) struct MemoryJobSink {
    pub payloads: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl MemoryJobSink {
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSink for MemoryJobSink {
    async fn enqueue_payload(&self, raw: &str) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionError {
                error: sqlx::Error::PoolClosed,
            });
        }
        self.payloads.lock().unwrap().push(raw.to_owned());
        Ok(())
    }
}

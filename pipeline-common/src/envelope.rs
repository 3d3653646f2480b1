use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Normalized wrapper for operational events, shared by the REST, batch and
/// partner ingestion paths so that downstream streaming, persistence and
/// scoring components see a single shape.
///
/// The payload is an open JSON object: this layer never validates it
/// against a schema, it only requires that it decodes as an object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Routing requires a tenant: envelopes with a blank tenant id must be
    /// rejected before they reach any broker.
    pub fn has_tenant(&self) -> bool {
        !self.tenant_id.trim().is_empty()
    }

    /// Fills in the received-at timestamp when the caller did not supply
    /// one, so every published envelope carries a usable ordering hint.
    pub fn ensure_received_at(&mut self, now: DateTime<Utc>) {
        self.received_at.get_or_insert(now);
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Timestamps arrive from partners in varying states of repair. An absent
/// or unparseable value maps to None and is later defaulted to processing
/// time, rather than failing the whole envelope.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
        .map(|parsed| parsed.with_timezone(&Utc)))
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit entry persisted through the storage boundary. Tenant ids travel
/// as strings through the pipeline but are numeric keys in storage, hence
/// the Option<i64> here.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub tenant_id: Option<i64>,
    pub actor: String,
    pub action: String,
    pub occurred_at: DateTime<Utc>,
    pub details: String,
}

/// Converts a pipeline tenant id into the numeric form storage expects.
/// Blank and non-numeric values mean "no tenant", not an error: audit
/// entries produced by automated jobs must never be dropped over
/// attribution.
pub fn parse_tenant_id(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::parse_tenant_id;

    #[test]
    fn numeric_tenant_ids_convert() {
        assert_eq!(parse_tenant_id("42"), Some(42));
        assert_eq!(parse_tenant_id(" 7 "), Some(7));
    }

    #[test]
    fn blank_and_non_numeric_mean_no_tenant() {
        assert_eq!(parse_tenant_id(""), None);
        assert_eq!(parse_tenant_id("   "), None);
        assert_eq!(parse_tenant_id("t-1"), None);
        assert_eq!(parse_tenant_id("unknown"), None);
    }
}

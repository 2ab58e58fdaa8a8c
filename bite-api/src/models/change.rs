use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    pub count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    pub changes: BTreeMap<String, FieldChange>,
}

impl Change {
    /// True if any of the given fields changed.
    pub fn touches<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        fields.iter().any(|f| self.changes.contains_key(f.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touches() {
        let mut change = Change::default();
        change.changes.insert(
            "status".to_string(),
            FieldChange {
                removed: Some("NEW".to_string()),
                added: Some("ASSIGNED".to_string()),
            },
        );

        assert!(change.touches(&["status"]));
        assert!(change.touches(&["owner", "status"]));
        assert!(!change.touches(&["owner"]));
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cidc_macros::{insertion, ordinal_columns_enum, query_request, selection};
use cidc_schema::trial_metadata;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Delimited, Endpoint};

const ENDPOINT: &str = "/trial_metadata";

/// Top-level document fields holding per-participant or per-assay data.
/// They are dropped from list responses.
pub const PRUNED_FIELDS: [&str; 4] = ["participants", "assays", "analysis", "shipments"];

/// Top-level document fields that a trial-level patch may not touch.
pub const PROTECTED_FIELDS: [&str; 5] = [
    "participants",
    "assays",
    "analysis",
    "shipments",
    "protocol_identifier",
];

#[insertion(trial_metadata)]
pub struct NewTrialMetadata {
    #[garde(length(min = 1))]
    pub trial_id: String,
    pub metadata_json: Value,
}
impl Endpoint for NewTrialMetadata {
    fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

#[selection(trial_metadata)]
#[derive(Deserialize, PartialEq)]
pub struct TrialMetadata {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag")]
    pub etag: String,
    pub trial_id: String,
    pub metadata_json: Value,
}
impl Endpoint for TrialMetadata {
    fn endpoint() -> String {
        format!("{ENDPOINT}/{{trial_id}}")
    }
}

impl TrialMetadata {
    #[must_use]
    pub fn summaries_endpoint() -> String {
        format!("{ENDPOINT}/summaries")
    }

    /// Replace the document with a copy that omits [`PRUNED_FIELDS`].
    #[must_use]
    pub fn pruned(mut self) -> Self {
        if let Value::Object(document) = &mut self.metadata_json {
            for field in PRUNED_FIELDS {
                document.remove(field);
            }
        }

        self
    }
}

/// A trial-level update of top-level document fields. Protected fields may
/// be echoed back but not changed.
#[derive(Deserialize, Debug, Clone)]
pub struct TrialMetadataPatch {
    pub metadata_json: Map<String, Value>,
}

impl TrialMetadataPatch {
    /// The protected fields whose patched value differs from `current`.
    #[must_use]
    pub fn changed_protected_fields(&self, current: &Value) -> Vec<&'static str> {
        PROTECTED_FIELDS
            .into_iter()
            .filter(|f| {
                self.metadata_json
                    .get(*f)
                    .is_some_and(|patched| current.get(*f) != Some(patched))
            })
            .collect()
    }
}

#[query_request]
pub struct TrialQuery {
    pub trial_ids: Delimited,
    pub include_counts: bool,
}

#[ordinal_columns_enum]
pub enum TrialOrdinalColumn {
    TrialId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Serialize, Debug, Clone)]
pub struct TrialListItem {
    #[serde(flatten)]
    pub trial: TrialMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_participants: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_samples: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataCounts {
    pub num_trials: i64,
    pub num_participants: i64,
    pub num_samples: i64,
}

/// Platform-wide totals shown on the public data overview.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DataOverview {
    pub num_trials: i64,
    pub num_participants: i64,
    pub num_samples: i64,
    pub num_files: i64,
    pub num_bytes: i64,
    pub num_assays: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialSummary {
    pub trial_id: String,
    pub num_participants: i64,
    pub num_samples: i64,
    pub num_files: i64,
    pub file_size_bytes: i64,
    pub records_per_assay: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn pruning_keeps_trial_level_fields() {
        let trial = TrialMetadata {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: "abc".to_string(),
            trial_id: "10021".to_string(),
            metadata_json: json!({
                "protocol_identifier": "10021",
                "nct_id": "NCT01",
                "participants": [],
                "shipments": [],
                "assays": {},
                "analysis": {}
            }),
        };

        assert_eq!(
            trial.pruned().metadata_json,
            json!({"protocol_identifier": "10021", "nct_id": "NCT01"})
        );
    }

    #[test]
    fn patch_reports_changed_protected_fields() {
        let current = json!({"protocol_identifier": "10021", "participants": [{"cimac_participant_id": "CTTTPPP"}]});
        let patch: TrialMetadataPatch = serde_json::from_value(json!({
            "metadata_json": {"nct_id": "NCT02", "participants": [], "protocol_identifier": "10021"}
        }))
        .unwrap();

        assert_eq!(patch.changed_protected_fields(&current), ["participants"]);
    }
}

//! The canonical JSON document of a trial, its validation and its schema.
//!
//! Stored documents stay [`serde_json::Value`]s so that fields this crate
//! does not model survive a round trip unchanged. [`TrialDocument`] is the
//! typed view used to validate them.

use std::{
    collections::{HashMap, HashSet},
    sync::LazyLock,
};

use regex::Regex;
use schemars::{JsonSchema, schema::RootSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod merge;

pub use merge::merge_patch;

static CIMAC_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^C[A-Z0-9]{3}[A-Z0-9]{3}[A-Z0-9]{2}\.[0-9]{2}$").unwrap()
});
static CIMAC_PARTICIPANT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^C[A-Z0-9]{3}[A-Z0-9]{3}$").unwrap());

/// Length of the participant prefix of a CIMAC id.
const PARTICIPANT_PREFIX_LEN: usize = 7;

#[derive(thiserror::Error, Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("invalid trial document: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
    #[error("malformed trial document: {message}")]
    Malformed { message: String },
    #[error("conflicting values at {path}")]
    MergeConflict {
        path: String,
        base: Value,
        patch: Value,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[must_use]
pub fn is_cimac_id(s: &str) -> bool {
    CIMAC_ID.is_match(s)
}

#[must_use]
pub fn is_cimac_participant_id(s: &str) -> bool {
    CIMAC_PARTICIPANT_ID.is_match(s)
}

/// The CIMAC participant id a sample's CIMAC id belongs to.
#[must_use]
pub fn participant_of(cimac_id: &str) -> &str {
    cimac_id.get(..PARTICIPANT_PREFIX_LEN).unwrap_or(cimac_id)
}

/// A clinical trial and everything collected for it.
#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct TrialDocument {
    /// The trial's protocol identifier, unique across CIDC.
    pub protocol_identifier: String,
    #[serde(default)]
    pub allowed_cohort_names: Vec<String>,
    #[serde(default)]
    pub allowed_collection_event_names: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub shipments: Vec<Shipment>,
    /// Assay batches keyed by upload type.
    #[serde(default)]
    pub assays: Map<String, Value>,
    /// Analysis batches keyed by upload type.
    #[serde(default)]
    pub analysis: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct Participant {
    pub cimac_participant_id: String,
    /// The participant's identifier within the trial.
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub cohort_name: Option<String>,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub cimac_id: String,
    #[serde(default)]
    pub collection_event_name: Option<String>,
    #[serde(default)]
    pub shipment_manifest_id: Option<String>,
    #[serde(default)]
    pub aliquots: Vec<Aliquot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct Aliquot {
    pub slide_number: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct Shipment {
    pub manifest_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// JSON Schema of a trial document.
#[must_use]
pub fn schema() -> RootSchema {
    schema_for!(TrialDocument)
}

impl TrialDocument {
    /// # Errors
    pub fn from_value(document: &Value) -> Result<Self> {
        Self::deserialize(document).map_err(|e| Error::Malformed {
            message: e.to_string(),
        })
    }

    /// Every rule the document breaks, described with the path of the
    /// offending field.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.protocol_identifier.trim().is_empty() {
            problems.push("protocol_identifier: must not be empty".to_string());
        }

        let allowed_cohorts: HashSet<&str> =
            self.allowed_cohort_names.iter().map(String::as_str).collect();
        let allowed_events: HashSet<&str> = self
            .allowed_collection_event_names
            .iter()
            .map(String::as_str)
            .collect();

        let mut manifest_ids = HashSet::new();
        for (i, shipment) in self.shipments.iter().enumerate() {
            if !manifest_ids.insert(shipment.manifest_id.as_str()) {
                problems.push(format!(
                    "shipments[{i}].manifest_id: duplicate manifest id {}",
                    shipment.manifest_id
                ));
            }
        }

        let mut participant_ids = HashSet::new();
        let mut cimac_ids: HashMap<&str, String> = HashMap::new();

        for (i, participant) in self.participants.iter().enumerate() {
            let path = format!("participants[{i}]");
            let cimac_participant_id = participant.cimac_participant_id.as_str();

            if !is_cimac_participant_id(cimac_participant_id) {
                problems.push(format!(
                    "{path}.cimac_participant_id: {cimac_participant_id} is not a valid CIMAC participant id"
                ));
            }
            if !participant_ids.insert(cimac_participant_id) {
                problems.push(format!(
                    "{path}.cimac_participant_id: duplicate participant {cimac_participant_id}"
                ));
            }
            if participant
                .participant_id
                .as_deref()
                .is_none_or(|id| id.trim().is_empty())
            {
                problems.push(format!("{path}.participant_id: required"));
            }
            if let Some(cohort) = &participant.cohort_name {
                if !allowed_cohorts.contains(cohort.as_str()) {
                    problems.push(format!(
                        "{path}.cohort_name: {cohort} is not one of the trial's allowed cohort names"
                    ));
                }
            }

            for (j, sample) in participant.samples.iter().enumerate() {
                let path = format!("{path}.samples[{j}]");
                let cimac_id = sample.cimac_id.as_str();

                if !is_cimac_id(cimac_id) {
                    problems.push(format!("{path}.cimac_id: {cimac_id} is not a valid CIMAC id"));
                } else if participant_of(cimac_id) != cimac_participant_id {
                    problems.push(format!(
                        "{path}.cimac_id: {cimac_id} does not belong to participant {cimac_participant_id}"
                    ));
                }

                if let Some(first) = cimac_ids.insert(cimac_id, path.clone()) {
                    problems.push(format!(
                        "{path}.cimac_id: duplicate CIMAC id {cimac_id}, first seen at {first}"
                    ));
                }

                match &sample.collection_event_name {
                    None => problems.push(format!("{path}.collection_event_name: required")),
                    Some(event) if !allowed_events.contains(event.as_str()) => {
                        problems.push(format!(
                            "{path}.collection_event_name: {event} is not one of the trial's allowed collection events"
                        ));
                    }
                    Some(_) => {}
                }

                if let Some(manifest_id) = &sample.shipment_manifest_id {
                    if !manifest_ids.contains(manifest_id.as_str()) {
                        problems.push(format!(
                            "{path}.shipment_manifest_id: unknown shipment {manifest_id}"
                        ));
                    }
                }

                let mut slides = HashSet::new();
                for (k, aliquot) in sample.aliquots.iter().enumerate() {
                    if !slides.insert(aliquot.slide_number.as_str()) {
                        problems.push(format!(
                            "{path}.aliquots[{k}].slide_number: duplicate slide number {}",
                            aliquot.slide_number
                        ));
                    }
                }
            }
        }

        problems
    }
}

/// Parse and validate `document`, returning its typed view.
///
/// # Errors
/// [`Error::Malformed`] when the document does not have the shape of a
/// trial, [`Error::Invalid`] listing every broken rule otherwise.
pub fn validate(document: &Value) -> Result<TrialDocument> {
    let parsed = TrialDocument::from_value(document)?;

    let problems = parsed.problems();
    if !problems.is_empty() {
        return Err(Error::Invalid { problems });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn document() -> Value {
        json!({
            "protocol_identifier": "10021",
            "allowed_cohort_names": ["Arm_A"],
            "allowed_collection_event_names": ["Baseline"],
            "shipments": [{"manifest_id": "M1", "courier": "FedEx"}],
            "participants": [{
                "cimac_participant_id": "CTTTPP1",
                "participant_id": "p-1",
                "cohort_name": "Arm_A",
                "samples": [{
                    "cimac_id": "CTTTPP101.00",
                    "collection_event_name": "Baseline",
                    "shipment_manifest_id": "M1",
                    "box_number": 1,
                    "aliquots": [{"slide_number": "01"}]
                }]
            }],
            "nct_id": "NCT00000001"
        })
    }

    #[rstest]
    #[case("CTTTPP101.00", true)]
    #[case("C1234567A.01", false)]
    #[case("CTTTPP10100", false)]
    #[case("cTTTPP101.00", false)]
    fn cimac_ids(#[case] id: &str, #[case] valid: bool) {
        assert_eq!(is_cimac_id(id), valid);
    }

    #[test]
    fn valid_document_keeps_unmodeled_fields() {
        let parsed = validate(&document()).unwrap();

        assert_eq!(parsed.extra["nct_id"], "NCT00000001");
        assert_eq!(parsed.participants[0].samples[0].extra["box_number"], 1);
        assert_eq!(participant_of("CTTTPP101.00"), "CTTTPP1");
    }

    #[test]
    fn every_problem_is_reported() {
        let mut document = document();
        document["participants"][0]["cohort_name"] = json!("Arm_Z");
        document["participants"][0]["samples"][0]["cimac_id"] = json!("CXXXPP101.00");
        document["participants"][0]["samples"][0]["shipment_manifest_id"] = json!("M2");
        document["participants"][0]["samples"][0]
            .as_object_mut()
            .unwrap()
            .remove("collection_event_name");

        let Err(Error::Invalid { problems }) = validate(&document) else {
            panic!("document should be invalid");
        };

        assert_eq!(
            problems,
            [
                "participants[0].cohort_name: Arm_Z is not one of the trial's allowed cohort names",
                "participants[0].samples[0].cimac_id: CXXXPP101.00 does not belong to participant CTTTPP1",
                "participants[0].samples[0].collection_event_name: required",
                "participants[0].samples[0].shipment_manifest_id: unknown shipment M2"
            ]
        );
    }

    #[test]
    fn duplicates_are_reported() {
        let mut document = document();
        let sample = document["participants"][0]["samples"][0].clone();
        document["participants"][0]["samples"]
            .as_array_mut()
            .unwrap()
            .push(sample);
        let shipment = document["shipments"][0].clone();
        document["shipments"].as_array_mut().unwrap().push(shipment);

        let Err(Error::Invalid { problems }) = validate(&document) else {
            panic!("document should be invalid");
        };

        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("duplicate manifest id M1"));
        assert!(problems[1].contains("duplicate CIMAC id CTTTPP101.00"));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        assert!(matches!(
            validate(&json!({"participants": "none"})),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn schema_describes_participants() {
        let schema = serde_json::to_value(schema()).unwrap();

        assert_eq!(schema["title"], "TrialDocument");
        assert!(schema["definitions"]["Participant"].is_object());
    }
}

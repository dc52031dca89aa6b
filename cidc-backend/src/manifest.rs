//! Ingestion of CSMS manifests, the shipments of samples reported by the
//! sample-management system of record.
//!
//! A manifest is merged into the trial document as a metadata patch and
//! recorded as a `merge-completed` upload job carrying that patch, after
//! which the relational mirror is rebuilt.

use std::collections::HashSet;

use cidc_core::model::upload_job::{NewUploadJob, UploadJob, UploadJobStatus};
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};
use serde_json::{Map, Value, json};

use crate::{
    db::{
        self,
        model::{relational, trial, upload_job},
    },
    document::{self, TrialDocument},
    sync,
};

pub mod change;

pub use change::{Change, EntityType, apply_manifest_changes, detect_manifest_changes};

pub const QC_COMPLETE: &str = "qc_complete";
pub const NOT_REPORTED: &str = "Not Reported";

/// Shipment fields a manifest carries into the document.
pub const SHIPMENT_FIELDS: [&str; 13] = [
    "manifest_id",
    "assay_priority",
    "assay_type",
    "courier",
    "tracking_number",
    "account_number",
    "shipping_condition",
    "date_shipped",
    "date_received",
    "quality_of_shipment",
    "ship_from",
    "ship_to",
    "receiving_party",
];

/// Participant fields a manifest sample carries into the document.
pub const PARTICIPANT_FIELDS: [&str; 4] = ["cohort_name", "gender", "race", "ethnicity"];

/// Sample fields a manifest sample carries into the document, besides its
/// CIMAC id and collection event.
pub const SAMPLE_FIELDS: &[&str] = &[
    "shipping_entry_number",
    "box_number",
    "surgical_pathology_report_id",
    "clinical_report_id",
    "parent_sample_id",
    "processed_sample_id",
    "site_description",
    "topography_code",
    "topography_description",
    "histology_behavior",
    "histology_behavior_description",
    "sample_location",
    "type_of_sample",
    "type_of_tumor_sample",
    "sample_collection_procedure",
    "core_number",
    "fixation_stabilization_type",
    "type_of_primary_container",
    "sample_volume",
    "sample_volume_units",
    "processed_sample_type",
    "processed_sample_volume",
    "processed_sample_volume_units",
    "processed_sample_concentration",
    "processed_sample_concentration_units",
    "processed_sample_quantity",
    "processed_sample_derivative",
    "sample_derivative_volume",
    "sample_derivative_volume_units",
    "sample_derivative_concentration",
    "sample_derivative_concentration_units",
    "tumor_tissue_total_area_percentage",
    "viable_tumor_area_percentage",
    "viable_stroma_area_percentage",
    "necrosis_area_percentage",
    "fibrosis_area_percentage",
    "din",
    "pbmc_viability",
    "pbmc_recovery",
    "pbmc_resting_period_used",
    "material_used",
    "material_used_units",
    "material_remaining",
    "material_remaining_units",
    "material_storage_condition",
    "quality_of_sample",
    "sample_replacement",
    "residual_sample_use",
    "comments",
    "diagnosis_verification",
    "intended_assay",
];

/// Processed sample types that name an upload type as is.
const DIRECT_UPLOAD_TYPES: [&str; 8] = [
    "pbmc",
    "plasma",
    "tissue_slide",
    "normal_blood_dna",
    "normal_tissue_dna",
    "tumor_tissue_dna",
    "tumor_tissue_rna",
    "h_and_e",
];

/// CSMS processed sample types and the names the document uses for them.
const PROCESSED_SAMPLE_TYPES: [(&str, &str); 6] = [
    ("tissue_slide", "Fixed Slide"),
    ("tumor_tissue_dna", "Tissue Scroll"),
    ("plasma", "Plasma"),
    ("normal_tissue_dna", "Tissue Scroll"),
    ("h_and_e", "H&E-Stained Fixed Tissue Slide Specimen"),
    ("pbmc", "PBMC"),
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Invalid { message: String },
    #[error("manifest {manifest_id} already exists for trial {trial_id}")]
    AlreadyExists {
        trial_id: String,
        manifest_id: String,
    },
    #[error("manifest {manifest_id} has not been ingested")]
    NewManifest { manifest_id: String },
    #[error("change in critical field: {message}")]
    CriticalChange { message: String },
    #[error(transparent)]
    Sync(#[from] sync::Error),
}

impl Error {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<db::error::Error> for Error {
    fn from(err: db::error::Error) -> Self {
        Self::Sync(err.into())
    }
}

impl From<document::Error> for Error {
    fn from(err: document::Error) -> Self {
        Self::Sync(err.into())
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Self::Sync(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Ends a transaction early, either to discard a dry run's work or because
/// it failed.
enum Abort<T> {
    DryRun(T),
    Failed(Error),
}

impl<T> From<Error> for Abort<T> {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

impl<T> From<diesel::result::Error> for Abort<T> {
    fn from(err: diesel::result::Error) -> Self {
        Self::Failed(err.into())
    }
}

impl<T> Abort<T> {
    fn settle(result: std::result::Result<T, Self>) -> Result<T> {
        match result {
            Ok(value) | Err(Self::DryRun(value)) => Ok(value),
            Err(Self::Failed(err)) => Err(err),
        }
    }
}

/// The identifying parts of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestInfo {
    pub trial_id: String,
    pub manifest_id: String,
    pub samples: Vec<Map<String, Value>>,
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The single value every sample gives `key`, if any gives one.
///
/// # Errors
/// When samples disagree.
pub fn consistent(samples: &[Map<String, Value>], key: &str) -> Result<Option<Value>> {
    let mut values: Vec<&Value> = Vec::new();
    for sample in samples {
        let value = sample.get(key).unwrap_or(&Value::Null);
        if !values.contains(&value) {
            values.push(value);
        }
    }

    match values.as_slice() {
        [] | [Value::Null] => Ok(None),
        [value] => Ok(Some((*value).clone())),
        _ => Err(Error::invalid(format!("Inconsistent value provided for {key}"))),
    }
}

/// Whether CSMS marked the manifest as excluded from CIDC.
#[must_use]
pub fn is_excluded(manifest: &Map<String, Value>) -> bool {
    manifest
        .get("excluded")
        .is_some_and(|v| v.as_bool().unwrap_or(!v.is_null()))
}

/// Check the parts of `manifest` every operation relies on.
///
/// # Errors
/// When the manifest has no id, is not `qc_complete`, has no samples, or its
/// samples disagree on their trial.
pub fn extract_info(manifest: &Map<String, Value>) -> Result<ManifestInfo> {
    let manifest_id = non_empty_text(manifest.get("manifest_id"))
        .ok_or_else(|| Error::invalid("No manifest_id in manifest"))?;

    match manifest.get("status") {
        None | Some(Value::Null) => {}
        Some(Value::String(status)) if status == QC_COMPLETE => {}
        Some(_) => {
            return Err(Error::invalid(
                "Cannot add a manifest that is not qc_complete",
            ));
        }
    }

    let samples = manifest
        .get("samples")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if samples.is_empty() {
        return Err(Error::invalid(format!(
            "Manifest {manifest_id} contains no samples"
        )));
    }
    let samples = samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            s.as_object().cloned().ok_or_else(|| {
                Error::invalid(format!("samples[{i}] on manifest {manifest_id} is not an object"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let no_trial = || {
        Error::invalid(format!(
            "No consistent protocol_identifier defined for samples on manifest {manifest_id}"
        ))
    };
    let trial_id = consistent(&samples, "protocol_identifier")
        .map_err(|_| no_trial())?
        .and_then(|v| non_empty_text(Some(&v)))
        .ok_or_else(no_trial)?;

    Ok(ManifestInfo {
        trial_id,
        manifest_id,
        samples,
    })
}

fn upload_type_of(sample: &Map<String, Value>) -> Option<String> {
    let text = |key: &str| sample.get(key).and_then(Value::as_str);

    let processed_type = text("processed_sample_type").unwrap_or_default().to_lowercase();
    let processed_type = if processed_type == "h&e-stained fixed tissue slide specimen" {
        "h_and_e".to_string()
    } else {
        processed_type
    };
    if DIRECT_UPLOAD_TYPES.contains(&processed_type.as_str()) {
        return Some(processed_type);
    }

    let manifest_type = text("sample_manifest_type")?;
    let first_word = manifest_type
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();

    match (manifest_type, text("processed_sample_derivative")) {
        ("biofluid_cellular", _) => Some("pbmc".to_string()),
        ("tissue_slides", _) => Some("tissue_slide".to_string()),
        (_, Some("Germline DNA")) => Some(format!("normal_{first_word}_dna")),
        (_, Some("Tumor DNA")) => Some(format!("tumor_{first_word}_dna")),
        (_, Some(derivative @ ("DNA" | "RNA"))) => {
            let tumor_or_normal = if text("type_of_sample")
                .unwrap_or_default()
                .to_lowercase()
                .contains("tumor")
            {
                "tumor"
            } else {
                "normal"
            };
            let source = if manifest_type.starts_with("biofluid") {
                "blood"
            } else {
                "tissue"
            };
            Some(format!(
                "{tumor_or_normal}_{source}_{}",
                derivative.to_lowercase()
            ))
        }
        _ => None,
    }
}

/// The one upload type the samples of a manifest were shipped for.
///
/// # Errors
/// When the samples imply no upload type or more than one.
pub fn upload_type_for<'a>(
    samples: impl IntoIterator<Item = &'a Map<String, Value>>,
) -> Result<String> {
    let upload_types: HashSet<String> = samples.into_iter().filter_map(upload_type_of).collect();

    let mut upload_types: Vec<String> = upload_types.into_iter().collect();
    match upload_types.len() {
        1 => Ok(upload_types.remove(0)),
        _ => {
            upload_types.sort();
            Err(Error::invalid(format!(
                "Inconsistent value determined for upload_type: {upload_types:?}"
            )))
        }
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Convert CSMS samples into document samples, keyed by CIMAC id.
/// `existing_cimac_ids` are the samples the trial already has.
///
/// # Errors
/// On the first sample that lacks a collection event, CIMAC id or
/// participant id, has a malformed or already used CIMAC id, or a
/// non-numeric derivative concentration.
pub fn convert_samples(
    trial_id: &str,
    manifest_id: &str,
    samples: Vec<Map<String, Value>>,
    existing_cimac_ids: &HashSet<&str>,
) -> Result<Vec<(String, Map<String, Value>)>> {
    let mut seen = HashSet::new();
    let mut converted = Vec::with_capacity(samples.len());

    for (n, mut sample) in samples.into_iter().enumerate() {
        let cimac_id = non_empty_text(sample.get("cimac_id")).ok_or_else(|| {
            Error::invalid(format!(
                "No cimac_id defined for samples[{n}] on manifest_id={manifest_id} for trial {trial_id}"
            ))
        })?;

        let event_name = sample
            .get("standardized_collection_event_name")
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::invalid(format!(
                    "No standardized_collection_event_name defined for sample {cimac_id} on manifest {manifest_id} for trial {trial_id}"
                ))
            })?;
        sample.insert("collection_event_name".to_string(), event_name);

        let renamed = sample
            .get("processed_sample_type")
            .and_then(Value::as_str)
            .and_then(|t| PROCESSED_SAMPLE_TYPES.iter().find(|(csms, _)| *csms == t))
            .map(|(_, cidc)| *cidc);
        if let Some(renamed) = renamed {
            sample.insert("processed_sample_type".to_string(), json!(renamed));
        }

        if let Some(fixation) = sample.remove("fixation_or_stabilization_type") {
            sample.insert("fixation_stabilization_type".to_string(), fixation);
        }

        if let Some(concentration) = sample
            .get("sample_derivative_concentration")
            .filter(|v| !v.is_null())
        {
            let parsed = coerce_float(concentration).ok_or_else(|| {
                Error::invalid(format!(
                    "sample_derivative_concentration of sample {cimac_id} is not a number: {concentration}"
                ))
            })?;
            sample.insert("sample_derivative_concentration".to_string(), json!(parsed));
        }

        if sample.get("type_of_sample").and_then(Value::as_str) == Some("Blood")
            && !sample.contains_key("type_of_primary_container")
        {
            sample.insert("type_of_primary_container".to_string(), json!(NOT_REPORTED));
        }
        if !sample.contains_key("parent_sample_id") {
            sample.insert("parent_sample_id".to_string(), json!(NOT_REPORTED));
        }

        if !document::is_cimac_id(&cimac_id) {
            return Err(Error::invalid(format!(
                "Malformatted cimac_id={cimac_id} on manifest_id={manifest_id} for trial {trial_id}"
            )));
        }
        if existing_cimac_ids.contains(cimac_id.as_str()) || !seen.insert(cimac_id.clone()) {
            return Err(Error::invalid(format!(
                "Sample with cimac_id={cimac_id} already exists for trial {trial_id}"
            )));
        }

        let participant_id = non_empty_text(sample.get("participant_id"))
            .or_else(|| non_empty_text(sample.get("trial_participant_id")))
            .ok_or_else(|| {
                Error::invalid(format!(
                    "Sample {cimac_id} has no local participant_id"
                ))
            })?;
        sample.insert("participant_id".to_string(), json!(participant_id));
        sample.insert("trial_participant_id".to_string(), json!(participant_id));

        converted.push((cimac_id, sample));
    }

    Ok(converted)
}

/// The non-null values of `fields` in `source`.
fn pick<'a>(source: &Map<String, Value>, fields: impl IntoIterator<Item = &'a str>) -> Map<String, Value> {
    fields
        .into_iter()
        .filter_map(|key| {
            source
                .get(key)
                .filter(|v| !v.is_null())
                .map(|v| (key.to_string(), v.clone()))
        })
        .collect()
}

/// The document shipment a manifest describes. Assay priority and type come
/// from the samples when all of them agree.
///
/// # Errors
/// When samples disagree on assay priority or type.
pub fn shipment_of(manifest: &Map<String, Value>, samples: &[Map<String, Value>]) -> Result<Map<String, Value>> {
    let mut shipment = pick(manifest, SHIPMENT_FIELDS);
    for key in ["assay_priority", "assay_type"] {
        if let Some(value) = consistent(samples, key)? {
            shipment.insert(key.to_string(), value);
        }
    }

    Ok(shipment)
}

/// The document sample a converted CSMS sample describes.
fn document_sample(cimac_id: &str, manifest_id: &str, sample: &Map<String, Value>) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert("cimac_id".to_string(), json!(cimac_id));
    if let Some(event) = sample.get("collection_event_name") {
        entry.insert("collection_event_name".to_string(), event.clone());
    }
    entry.insert("shipment_manifest_id".to_string(), json!(manifest_id));
    entry.extend(pick(sample, SAMPLE_FIELDS.iter().copied()));

    entry
}

/// The metadata patch that adds a manifest's shipment, participants and
/// samples to a trial document.
///
/// # Errors
/// When a sample fails conversion, or samples disagree on assay priority or
/// type.
pub fn build_patch(
    info: &ManifestInfo,
    manifest: &Map<String, Value>,
    existing_cimac_ids: &HashSet<&str>,
) -> Result<Value> {
    let shipment = shipment_of(manifest, &info.samples)?;
    let converted = convert_samples(
        &info.trial_id,
        &info.manifest_id,
        info.samples.clone(),
        existing_cimac_ids,
    )?;

    let mut by_participant: Vec<(String, Vec<(String, Map<String, Value>)>)> = Vec::new();
    for (cimac_id, sample) in converted {
        let cimac_participant_id = document::participant_of(&cimac_id).to_string();
        match by_participant
            .iter_mut()
            .find(|(id, _)| *id == cimac_participant_id)
        {
            Some((_, samples)) => samples.push((cimac_id, sample)),
            None => by_participant.push((cimac_participant_id, vec![(cimac_id, sample)])),
        }
    }

    let participants: Vec<Value> = by_participant
        .into_iter()
        .map(|(cimac_participant_id, samples)| {
            let first = &samples[0].1;
            let mut participant = pick(first, PARTICIPANT_FIELDS);
            participant.insert("cimac_participant_id".to_string(), json!(cimac_participant_id));
            if let Some(participant_id) = first.get("participant_id") {
                participant.insert("participant_id".to_string(), participant_id.clone());
            }
            participant.insert(
                "samples".to_string(),
                samples
                    .iter()
                    .map(|(cimac_id, s)| Value::Object(document_sample(cimac_id, &info.manifest_id, s)))
                    .collect(),
            );

            Value::Object(participant)
        })
        .collect();

    Ok(json!({
        "protocol_identifier": info.trial_id,
        "shipments": [shipment],
        "participants": participants,
    }))
}

fn cimac_ids(document: &TrialDocument) -> HashSet<&str> {
    document
        .participants
        .iter()
        .flat_map(|p| &p.samples)
        .map(|s| s.cimac_id.as_str())
        .collect()
}

async fn ingest(
    manifest: &Map<String, Value>,
    uploader_email: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let info = extract_info(manifest)?;

    let stored = trial::fetch_for_update(&info.trial_id, db_conn).await?;
    let current = TrialDocument::from_value(&stored.metadata_json)?;

    let already_in_trial = current
        .shipments
        .iter()
        .any(|s| s.manifest_id == info.manifest_id);
    let recorded_under = relational::shipment_trial(&info.manifest_id, db_conn).await?;
    if already_in_trial || recorded_under.is_some() {
        return Err(Error::AlreadyExists {
            trial_id: recorded_under.unwrap_or_else(|| info.trial_id.clone()),
            manifest_id: info.manifest_id,
        });
    }

    let patch = build_patch(&info, manifest, &cimac_ids(&current))?;
    let upload_type = upload_type_for(&info.samples)?;
    tracing::debug!(trial_id = %info.trial_id, manifest_id = %info.manifest_id, %patch, "manifest patch");

    let merged = document::merge_patch(&stored.metadata_json, &patch)?;
    document::validate(&merged)?;
    trial::update_document(&info.trial_id, &merged, db_conn).await?;

    let new_job = NewUploadJob {
        trial_id: info.trial_id.clone(),
        upload_type,
        metadata_patch: patch,
        gcs_file_map: None,
        multifile: false,
    };
    let job = upload_job::create(
        &new_job,
        uploader_email,
        UploadJobStatus::MergeCompleted,
        db_conn,
    )
    .await?;

    sync::sync_trial(&info.trial_id, &merged, db_conn).await?;

    Ok(job)
}

/// Add a new manifest to its trial: the document gains its shipment,
/// participants and samples, a `merge-completed` upload job records the
/// patch and the relational mirror is rebuilt. Nothing is kept when
/// `dry_run` is set.
///
/// Returns the manifest's upload job.
///
/// # Errors
/// When the manifest is malformed or already ingested, its trial does not
/// exist, or the merged document is invalid.
pub async fn insert_manifest(
    manifest: &Map<String, Value>,
    uploader_email: &str,
    dry_run: bool,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let result = db_conn
        .transaction::<_, Abort<UploadJob>, _>(|conn| {
            async move {
                let job = ingest(manifest, uploader_email, conn).await?;

                if dry_run {
                    return Err(Abort::DryRun(job));
                }
                Ok(job)
            }
            .scope_boxed()
        })
        .await;

    let job = Abort::settle(result)?;
    tracing::info!(
        trial_id = %job.trial_id,
        upload_type = %job.upload_type,
        dry_run,
        "inserted manifest"
    );

    Ok(job)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::test_util::{csms_manifest, trial_document};

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn info_of_valid_manifest() {
        let manifest = object(csms_manifest("10021", "10021-manifest-2"));

        let info = extract_info(&manifest).unwrap();

        assert_eq!(info.trial_id, "10021");
        assert_eq!(info.manifest_id, "10021-manifest-2");
        assert_eq!(info.samples.len(), 2);
    }

    #[rstest]
    #[case("manifest_id", Value::Null, "No manifest_id")]
    #[case("status", json!("qc_in_progress"), "not qc_complete")]
    #[case("samples", json!([]), "contains no samples")]
    fn info_rejects(#[case] key: &str, #[case] value: Value, #[case] message: &str) {
        let mut manifest = object(csms_manifest("10021", "10021-manifest-2"));
        manifest.insert(key.to_string(), value);

        let err = extract_info(&manifest).unwrap_err();

        assert!(err.to_string().contains(message), "{err}");
    }

    #[test]
    fn missing_status_counts_as_qc_complete() {
        let mut manifest = object(csms_manifest("10021", "10021-manifest-2"));
        manifest.remove("status");

        assert!(extract_info(&manifest).is_ok());
    }

    #[test]
    fn samples_must_agree_on_trial() {
        let mut manifest = csms_manifest("10021", "10021-manifest-2");
        manifest["samples"][1]["protocol_identifier"] = json!("10022");

        let err = extract_info(&object(manifest)).unwrap_err();

        assert!(err.to_string().contains("No consistent protocol_identifier"));
    }

    #[rstest]
    #[case(json!({"processed_sample_type": "PBMC"}), "pbmc")]
    #[case(json!({"processed_sample_type": "H&E-Stained Fixed Tissue Slide Specimen"}), "h_and_e")]
    #[case(json!({"processed_sample_type": "tumor_tissue_rna"}), "tumor_tissue_rna")]
    #[case(json!({"sample_manifest_type": "biofluid_cellular"}), "pbmc")]
    #[case(json!({"sample_manifest_type": "tissue_slides"}), "tissue_slide")]
    #[case(
        json!({"sample_manifest_type": "Tissue Scroll", "processed_sample_derivative": "Germline DNA"}),
        "normal_tissue_dna"
    )]
    #[case(
        json!({"sample_manifest_type": "Tissue Scroll", "processed_sample_derivative": "Tumor DNA"}),
        "tumor_tissue_dna"
    )]
    #[case(
        json!({"sample_manifest_type": "biofluid_plasma", "processed_sample_derivative": "DNA", "type_of_sample": "Blood"}),
        "normal_blood_dna"
    )]
    #[case(
        json!({"sample_manifest_type": "tissue_core", "processed_sample_derivative": "RNA", "type_of_sample": "Tumor Tissue"}),
        "tumor_tissue_rna"
    )]
    fn upload_type_inference(#[case] sample: Value, #[case] expected: &str) {
        assert_eq!(upload_type_for([&object(sample)]).unwrap(), expected);
    }

    #[test]
    fn mixed_upload_types_are_rejected() {
        let samples = [
            object(json!({"processed_sample_type": "pbmc"})),
            object(json!({"processed_sample_type": "plasma"})),
        ];

        assert!(upload_type_for(&samples).is_err());
        assert!(upload_type_for(std::iter::empty()).is_err());
    }

    #[test]
    fn samples_are_converted() {
        let info = extract_info(&object(csms_manifest("10021", "10021-manifest-2"))).unwrap();

        let converted =
            convert_samples(&info.trial_id, &info.manifest_id, info.samples, &HashSet::new()).unwrap();

        let (cimac_id, sample) = &converted[0];
        assert_eq!(cimac_id, "CTTTPP102.00");
        assert_eq!(sample["collection_event_name"], json!("On_Treatment"));
        assert_eq!(sample["processed_sample_type"], json!("PBMC"));
        assert_eq!(sample["fixation_stabilization_type"], json!("Frozen"));
        assert!(!sample.contains_key("fixation_or_stabilization_type"));
        assert_eq!(sample["sample_derivative_concentration"], json!(3.5));
        assert_eq!(sample["type_of_primary_container"], json!(NOT_REPORTED));
        assert_eq!(sample["parent_sample_id"], json!(NOT_REPORTED));
        assert_eq!(sample["trial_participant_id"], json!("trial-participant-1"));

        let (_, second) = &converted[1];
        assert_eq!(second["participant_id"], json!("trial-participant-3"));
    }

    #[rstest]
    #[case("cimac_id", json!("not-a-cimac-id"), "Malformatted cimac_id")]
    #[case("cimac_id", json!("CTTTPP101.00"), "already exists")]
    #[case("standardized_collection_event_name", Value::Null, "No standardized_collection_event_name")]
    #[case("sample_derivative_concentration", json!("lots"), "is not a number")]
    fn sample_conversion_rejects(#[case] key: &str, #[case] value: Value, #[case] message: &str) {
        let mut manifest = csms_manifest("10021", "10021-manifest-2");
        manifest["samples"][0][key] = value;
        let info = extract_info(&object(manifest)).unwrap();

        let err = convert_samples(
            &info.trial_id,
            &info.manifest_id,
            info.samples,
            &HashSet::from(["CTTTPP101.00"]),
        )
        .unwrap_err();

        assert!(err.to_string().contains(message), "{err}");
    }

    #[test]
    fn duplicate_sample_in_manifest_is_rejected() {
        let mut manifest = csms_manifest("10021", "10021-manifest-2");
        manifest["samples"][1]["cimac_id"] = json!("CTTTPP102.00");
        let info = extract_info(&object(manifest)).unwrap();

        assert!(
            convert_samples(&info.trial_id, &info.manifest_id, info.samples, &HashSet::new())
                .is_err()
        );
    }

    #[test]
    fn sample_without_participant_id_is_rejected() {
        let mut manifest = csms_manifest("10021", "10021-manifest-2");
        manifest["samples"][0]
            .as_object_mut()
            .unwrap()
            .remove("participant_id");
        let info = extract_info(&object(manifest)).unwrap();

        assert!(
            convert_samples(&info.trial_id, &info.manifest_id, info.samples, &HashSet::new())
                .is_err()
        );
    }

    #[test]
    fn patch_merges_into_existing_trial() {
        let manifest = object(csms_manifest("10021", "10021-manifest-2"));
        let info = extract_info(&manifest).unwrap();

        let patch = build_patch(&info, &manifest, &HashSet::from(["CTTTPP101.00"])).unwrap();

        assert_eq!(patch["protocol_identifier"], json!("10021"));
        assert_eq!(
            patch["shipments"],
            json!([{
                "manifest_id": "10021-manifest-2",
                "assay_priority": "1",
                "assay_type": "Olink",
                "courier": "UPS",
                "date_shipped": "2024-04-01 00:00:00"
            }])
        );
        assert_eq!(patch["participants"].as_array().unwrap().len(), 2);
        assert_eq!(
            patch["participants"][0]["samples"][0]["shipment_manifest_id"],
            json!("10021-manifest-2")
        );

        let merged = document::merge_patch(&trial_document("10021"), &patch).unwrap();
        let parsed = document::validate(&merged).unwrap();

        assert_eq!(parsed.shipments.len(), 2);
        assert_eq!(parsed.participants.len(), 3);
        assert_eq!(parsed.participants[0].samples.len(), 2);
    }

    #[test]
    fn excluded_flag() {
        let mut manifest = object(csms_manifest("10021", "10021-manifest-2"));
        assert!(!is_excluded(&manifest));

        manifest.insert("excluded".to_string(), json!(true));
        assert!(is_excluded(&manifest));
    }
}

#[cfg(test)]
mod db_tests {
    use cidc_core::model::{trial::NewTrialMetadata, user::User};
    use diesel_async::scoped_futures::ScopedFutureExt;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::{
        FetchById, Write,
        seed_data::seed_admin,
        test_util::{DbConnection, csms_manifest, db_conn, trial_document},
    };

    async fn trial_with_admin(trial_id: &str, conn: &mut AsyncPgConnection) -> Result<User> {
        let admin = seed_admin("manifest-admin@example.com", conn).await?;
        let stored = NewTrialMetadata {
            trial_id: trial_id.to_string(),
            metadata_json: trial_document(trial_id),
        }
        .write(conn)
        .await?;
        sync::sync_stored_trial(&stored, conn).await?;

        Ok(admin)
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn manifest_is_ingested_once(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let admin = trial_with_admin("test-manifest", conn).await?;
                    let manifest = csms_manifest("test-manifest", "test-manifest-2");
                    let manifest = manifest.as_object().unwrap();

                    let job = insert_manifest(manifest, &admin.email, false, conn).await?;
                    assert_eq!(job.status, UploadJobStatus::MergeCompleted);
                    assert_eq!(job.upload_type, "pbmc");

                    let stored =
                        cidc_core::model::trial::TrialMetadata::fetch_by_id(&"test-manifest".to_string(), conn)
                            .await?;
                    assert_eq!(stored.metadata_json["shipments"].as_array().unwrap().len(), 2);

                    let again = insert_manifest(manifest, &admin.email, false, conn).await;
                    assert!(matches!(again, Err(Error::AlreadyExists { .. })));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn dry_run_keeps_nothing(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let admin = trial_with_admin("test-manifest-dry", conn).await?;
                    let manifest = csms_manifest("test-manifest-dry", "test-manifest-dry-2");

                    insert_manifest(manifest.as_object().unwrap(), &admin.email, true, conn).await?;

                    let stored = cidc_core::model::trial::TrialMetadata::fetch_by_id(
                        &"test-manifest-dry".to_string(),
                        conn,
                    )
                    .await?;
                    assert_eq!(stored.metadata_json, trial_document("test-manifest-dry"));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

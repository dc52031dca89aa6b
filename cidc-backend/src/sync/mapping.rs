//! Derives the relational rows and file artifacts of a trial from its
//! document. Nothing here touches the database.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use cidc_core::model::{
    downloadable_file::NewDownloadableFile,
    upload_job::{UploadJob, UploadJobStatus},
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{Error, Result};
use crate::{
    db::model::relational::{
        AliquotRow, AssayRecordRow, ClinicalTrialRow, CohortRow, CollectionEventRow,
        ParticipantRow, RelationalTrial, SampleRow, ShipmentRow, UploadRow,
    },
    document::{Aliquot, Participant, Sample, Shipment, TrialDocument},
};

/// Data format of files whose document entry does not name one.
pub const DATA_FORMAT_NOT_SET: &str = "[NOT SET]";

/// Everything a trial document mirrors into the database.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    pub relational: RelationalTrial,
    pub files: Vec<NewDownloadableFile>,
}

/// Remove `key` from `fields` as text. Numbers and booleans are written out,
/// nested values are kept as JSON text.
fn take_text(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Remove `key` from `fields` if it holds a number or numeric string.
/// Anything else is left in place.
fn take_f64(fields: &mut Map<String, Value>, key: &str) -> Option<f64> {
    let parsed = match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };

    if parsed.is_some() {
        fields.remove(key);
    }

    parsed
}

/// Remove `key` from `fields` if it holds a date, reading the leading
/// `YYYY-MM-DD` of timestamps. Anything else is left in place.
fn take_date(fields: &mut Map<String, Value>, key: &str) -> Option<NaiveDate> {
    let parsed = fields
        .get(key)?
        .as_str()
        .and_then(|s| s.get(..10))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

    if parsed.is_some() {
        fields.remove(key);
    }

    parsed
}

fn take_json(fields: &mut Map<String, Value>, key: &str, default: Value) -> Value {
    match fields.remove(key) {
        None | Some(Value::Null) => default,
        Some(v) => v,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn clinical_trial(document: &TrialDocument) -> ClinicalTrialRow {
    let mut fields = document.extra.clone();

    ClinicalTrialRow {
        protocol_identifier: document.protocol_identifier.clone(),
        nct_id: take_text(&mut fields, "nct_id"),
        nci_id: take_text(&mut fields, "nci_id"),
        trial_name: take_text(&mut fields, "trial_name"),
        trial_description: take_text(&mut fields, "trial_description"),
        trial_organization: take_text(&mut fields, "trial_organization"),
        grant_or_affiliated_network: take_text(&mut fields, "grant_or_affiliated_network"),
        trial_status: take_text(&mut fields, "trial_status"),
        biobank: take_text(&mut fields, "biobank"),
        justification: take_text(&mut fields, "justification"),
        biomarker_plan: take_text(&mut fields, "biomarker_plan"),
        data_sharing_plan: take_text(&mut fields, "data_sharing_plan"),
        lead_cimac_pis: take_json(&mut fields, "lead_cimac_pis", json!([])),
        lead_cimac_contacts: take_json(&mut fields, "lead_cimac_contacts", json!([])),
        lead_trial_staff: take_json(&mut fields, "lead_trial_staff", json!([])),
        extra_metadata: Value::Object(fields),
    }
}

fn shipment(trial_id: &str, shipment: &Shipment) -> ShipmentRow {
    let mut fields = shipment.extra.clone();

    ShipmentRow {
        trial_id: trial_id.to_string(),
        manifest_id: shipment.manifest_id.clone(),
        assay_priority: take_text(&mut fields, "assay_priority"),
        assay_type: take_text(&mut fields, "assay_type"),
        courier: take_text(&mut fields, "courier"),
        tracking_number: take_text(&mut fields, "tracking_number"),
        account_number: take_text(&mut fields, "account_number"),
        shipping_condition: take_text(&mut fields, "shipping_condition"),
        date_shipped: take_date(&mut fields, "date_shipped"),
        date_received: take_date(&mut fields, "date_received"),
        quality_of_shipment: take_text(&mut fields, "quality_of_shipment"),
        ship_from: take_text(&mut fields, "ship_from"),
        ship_to: take_text(&mut fields, "ship_to"),
        receiving_party: take_text(&mut fields, "receiving_party"),
        extra_metadata: Value::Object(fields),
    }
}

fn participant(trial_id: &str, participant: &Participant) -> ParticipantRow {
    let mut fields = participant.extra.clone();

    ParticipantRow {
        trial_id: trial_id.to_string(),
        cimac_participant_id: participant.cimac_participant_id.clone(),
        trial_participant_id: participant.participant_id.clone().unwrap_or_default(),
        cohort_name: participant.cohort_name.clone(),
        gender: take_text(&mut fields, "gender"),
        race: take_text(&mut fields, "race"),
        ethnicity: take_text(&mut fields, "ethnicity"),
        extra_metadata: Value::Object(fields),
    }
}

fn sample(
    trial_id: &str,
    cimac_participant_id: &str,
    sample: &Sample,
    shipment_manifest_id: Option<String>,
) -> SampleRow {
    let mut fields = sample.extra.clone();
    let mut text = |key: &str| take_text(&mut fields, key);

    let box_number = text("box_number");
    let surgical_pathology_report_id = text("surgical_pathology_report_id");
    let clinical_report_id = text("clinical_report_id");
    let parent_sample_id = text("parent_sample_id");
    let processed_sample_id = text("processed_sample_id");
    let site_description = text("site_description");
    let topography_code = text("topography_code");
    let topography_description = text("topography_description");
    let histology_behavior = text("histology_behavior");
    let histology_behavior_description = text("histology_behavior_description");
    let sample_location = text("sample_location");
    let type_of_sample = text("type_of_sample");
    let type_of_primary_container = text("type_of_primary_container");
    let processed_sample_type = text("processed_sample_type");
    let processed_sample_quantity = text("processed_sample_quantity");
    let processed_sample_volume = text("processed_sample_volume");
    let processed_sample_volume_units = text("processed_sample_volume_units");
    let processed_sample_concentration = text("processed_sample_concentration");
    let processed_sample_derivative = text("processed_sample_derivative");
    let fixation_stabilization_type = text("fixation_stabilization_type");
    let intended_assay = text("intended_assay");

    let sample_derivative_concentration = take_f64(&mut fields, "sample_derivative_concentration");

    SampleRow {
        trial_id: trial_id.to_string(),
        cimac_id: sample.cimac_id.clone(),
        cimac_participant_id: cimac_participant_id.to_string(),
        collection_event_name: sample.collection_event_name.clone().unwrap_or_default(),
        shipment_manifest_id,
        box_number,
        surgical_pathology_report_id,
        clinical_report_id,
        parent_sample_id,
        processed_sample_id,
        site_description,
        topography_code,
        topography_description,
        histology_behavior,
        histology_behavior_description,
        sample_location,
        type_of_sample,
        type_of_primary_container,
        processed_sample_type,
        processed_sample_quantity,
        processed_sample_volume,
        processed_sample_volume_units,
        processed_sample_concentration,
        processed_sample_derivative,
        fixation_stabilization_type,
        sample_derivative_concentration,
        intended_assay,
        extra_metadata: Value::Object(fields),
    }
}

fn aliquot(trial_id: &str, cimac_id: &str, aliquot: &Aliquot) -> AliquotRow {
    let mut fields = aliquot.extra.clone();

    AliquotRow {
        trial_id: trial_id.to_string(),
        cimac_id: cimac_id.to_string(),
        slide_number: aliquot.slide_number.clone(),
        quantity: take_text(&mut fields, "quantity"),
        aliquot_replacement: take_text(&mut fields, "aliquot_replacement"),
        aliquot_status: take_text(&mut fields, "aliquot_status"),
        material_extracted: take_text(&mut fields, "material_extracted"),
        extracted_concentration: take_f64(&mut fields, "extracted_concentration"),
        aliquot_amount: take_text(&mut fields, "aliquot_amount"),
        lymphocyte_influx: take_text(&mut fields, "lymphocyte_influx"),
        extra_metadata: Value::Object(fields),
    }
}

/// The manifest id of a manifest upload's metadata patch, and the CIMAC ids
/// of the samples it shipped.
///
/// # Errors
/// When the patch names more than one shipment.
pub fn manifest_samples(job: &UploadJob) -> Result<Option<(String, Vec<String>)>> {
    let shipments = job
        .metadata_patch
        .get("shipments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let manifest_id = match shipments {
        [] => return Ok(None),
        [shipment] => shipment.get("manifest_id").and_then(text_of),
        _ => {
            return Err(Error::Mapping {
                message: format!(
                    "manifest upload {} names {} shipments",
                    job.id,
                    shipments.len()
                ),
            });
        }
    };
    let Some(manifest_id) = manifest_id else {
        return Ok(None);
    };

    let cimac_ids = job
        .metadata_patch
        .get("participants")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("samples").and_then(Value::as_array))
        .flatten()
        .filter_map(|s| s.get("cimac_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    Ok(Some((manifest_id, cimac_ids)))
}

/// Where each sample came from according to the trial's manifest uploads.
/// Later uploads win.
///
/// # Errors
/// When a manifest upload names more than one shipment.
pub fn sample_manifest_map(manifest_jobs: &[UploadJob]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    for job in manifest_jobs {
        if let Some((manifest_id, cimac_ids)) = manifest_samples(job)? {
            for cimac_id in cimac_ids {
                map.insert(cimac_id, manifest_id.clone());
            }
        }
    }

    Ok(map)
}

/// The batches of one upload type: a list, an object holding `batches`, or
/// a single batch object.
fn batches_of(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(batches) => batches.iter().collect(),
        Value::Object(object) => match object.get("batches").and_then(Value::as_array) {
            Some(batches) => batches.iter().collect(),
            None => vec![value],
        },
        _ => Vec::new(),
    }
}

fn batch_key(upload_type: &str, index: usize, batch: &Value) -> String {
    ["assay_run_id", "batch_id"]
        .into_iter()
        .find_map(|k| batch.get(k).and_then(text_of))
        .unwrap_or_else(|| format!("{upload_type}[{index}]"))
}

/// A file entry found somewhere inside a batch.
struct FoundFile<'a> {
    facet_group: String,
    entry: &'a Map<String, Value>,
    cimac_id: Option<&'a str>,
}

/// Collect every object with an `object_url` below `value`. `path` holds the
/// keys leading to `value`, without array indices.
fn find_files<'a>(
    value: &'a Value,
    path: &mut Vec<&'a str>,
    cimac_id: Option<&'a str>,
    found: &mut Vec<FoundFile<'a>>,
) {
    match value {
        Value::Object(object) => {
            if object.get("object_url").is_some_and(Value::is_string) {
                found.push(FoundFile {
                    facet_group: path.join("."),
                    entry: object,
                    cimac_id,
                });
                return;
            }

            let cimac_id = object.get("cimac_id").and_then(Value::as_str).or(cimac_id);
            for (key, child) in object {
                path.push(key);
                find_files(child, path, cimac_id, found);
                path.pop();
            }
        }
        Value::Array(items) => {
            for item in items {
                find_files(item, path, cimac_id, found);
            }
        }
        _ => {}
    }
}

fn file_artifact(
    trial_id: &str,
    section: &str,
    upload_type: &str,
    upload_id: Uuid,
    found: &FoundFile,
    now: DateTime<Utc>,
) -> NewDownloadableFile {
    let FoundFile {
        facet_group,
        entry,
        cimac_id,
    } = found;

    let object_url = entry
        .get("object_url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let text = |key: &str| entry.get(key).and_then(text_of);

    let file_name = text("file_name").or_else(|| object_url.rsplit('/').next().map(str::to_string));
    let file_size_bytes = entry
        .get("file_size_bytes")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or_default();
    let uploaded_timestamp = entry
        .get("uploaded_timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or(now, |t| t.with_timezone(&Utc));

    let mut additional_metadata = Map::new();
    if let Some(cimac_id) = cimac_id {
        let record_path = facet_group
            .split_once('.')
            .map_or(facet_group.as_str(), |(first, _)| first);
        additional_metadata.insert(
            format!("{section}.{upload_type}.{record_path}.cimac_id"),
            Value::String((*cimac_id).to_string()),
        );
    }

    NewDownloadableFile {
        trial_id: trial_id.to_string(),
        upload_type: upload_type.to_string(),
        object_url,
        file_name,
        data_format: text("data_format").unwrap_or_else(|| DATA_FORMAT_NOT_SET.to_string()),
        facet_group: facet_group.clone(),
        file_size_bytes,
        uploaded_timestamp,
        md5_hash: text("md5_hash"),
        crc32c_hash: text("crc32c_hash"),
        additional_metadata: Value::Object(additional_metadata),
        visible: true,
        analysis_friendly: false,
        upload_id: Some(upload_id),
        cimac_id: None,
    }
    .with_derived_fields()
}

/// Derive the relational mirror of `document`.
///
/// `manifest_jobs` are the trial's completed manifest uploads. They supply
/// the shipment of samples whose document entry does not name one, and each
/// becomes an upload row. `now` stands in for missing upload timestamps.
///
/// # Errors
/// When a manifest upload names more than one shipment, or an assay record
/// refers to a sample the document does not contain.
pub fn mirror(
    document: &TrialDocument,
    manifest_jobs: &[UploadJob],
    now: DateTime<Utc>,
) -> Result<Mirror> {
    let trial_id = document.protocol_identifier.as_str();
    let sample_manifests = sample_manifest_map(manifest_jobs)?;

    let mut relational = RelationalTrial {
        trial: clinical_trial(document),
        collection_events: document
            .allowed_collection_event_names
            .iter()
            .map(|event_name| CollectionEventRow {
                trial_id: trial_id.to_string(),
                event_name: event_name.clone(),
            })
            .collect(),
        cohorts: document
            .allowed_cohort_names
            .iter()
            .map(|cohort_name| CohortRow {
                trial_id: trial_id.to_string(),
                cohort_name: cohort_name.clone(),
            })
            .collect(),
        shipments: document
            .shipments
            .iter()
            .map(|s| shipment(trial_id, s))
            .collect(),
        ..Default::default()
    };

    let known_manifests: HashSet<&str> = document
        .shipments
        .iter()
        .map(|s| s.manifest_id.as_str())
        .collect();

    for p in &document.participants {
        relational.participants.push(participant(trial_id, p));

        for s in &p.samples {
            let shipment_manifest_id = s
                .shipment_manifest_id
                .clone()
                .or_else(|| sample_manifests.get(&s.cimac_id).cloned())
                .filter(|m| known_manifests.contains(m.as_str()));

            relational.samples.push(sample(
                trial_id,
                &p.cimac_participant_id,
                s,
                shipment_manifest_id,
            ));
            relational
                .aliquots
                .extend(s.aliquots.iter().map(|a| aliquot(trial_id, &s.cimac_id, a)));
        }
    }

    for job in manifest_jobs {
        let Some((manifest_id, _)) = manifest_samples(job)? else {
            continue;
        };
        if !known_manifests.contains(manifest_id.as_str()) {
            continue;
        }

        relational.uploads.push(UploadRow {
            id: job.id,
            trial_id: trial_id.to_string(),
            upload_type: job.upload_type.clone(),
            batch_key: manifest_id.clone(),
            shipment_manifest_id: Some(manifest_id),
            status: job.status.to_string(),
            multifile: job.multifile,
            assay_creator: None,
            uploader_email: Some(job.uploader_email.clone()),
            gcs_xlsx_uri: job.gcs_xlsx_uri.clone(),
            extra_metadata: json!({}),
        });
    }

    let known_samples: HashSet<&str> = document
        .participants
        .iter()
        .flat_map(|p| &p.samples)
        .map(|s| s.cimac_id.as_str())
        .collect();

    let mut files = Vec::new();

    for (section, batches_by_type) in [("assays", &document.assays), ("analysis", &document.analysis)] {
        for (upload_type, value) in batches_by_type {
            for (i, batch) in batches_of(value).into_iter().enumerate() {
                let upload_id = Uuid::now_v7();
                let mut extra = batch.as_object().cloned().unwrap_or_default();
                let records = extra.remove("records");
                let assay_creator = take_text(&mut extra, "assay_creator");

                relational.uploads.push(UploadRow {
                    id: upload_id,
                    trial_id: trial_id.to_string(),
                    upload_type: upload_type.clone(),
                    batch_key: batch_key(upload_type, i, batch),
                    shipment_manifest_id: None,
                    status: UploadJobStatus::MergeCompleted.to_string(),
                    multifile: false,
                    assay_creator,
                    uploader_email: None,
                    gcs_xlsx_uri: None,
                    extra_metadata: Value::Object(extra),
                });

                let mut seen_in_batch = HashSet::new();
                for (j, record) in records
                    .as_ref()
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .enumerate()
                {
                    let Some(cimac_id) = record.get("cimac_id").and_then(Value::as_str) else {
                        continue;
                    };
                    if !known_samples.contains(cimac_id) {
                        return Err(Error::Mapping {
                            message: format!(
                                "{section}.{upload_type}[{i}].records[{j}]: unknown sample {cimac_id}"
                            ),
                        });
                    }
                    if !seen_in_batch.insert(cimac_id) {
                        continue;
                    }

                    let mut record_extra = record.as_object().cloned().unwrap_or_default();
                    record_extra.remove("cimac_id");

                    relational.records.push(AssayRecordRow {
                        upload_id,
                        cimac_id: cimac_id.to_string(),
                        trial_id: trial_id.to_string(),
                        extra_metadata: Value::Object(record_extra),
                    });
                }

                let mut found = Vec::new();
                find_files(batch, &mut Vec::new(), None, &mut found);
                files.extend(
                    found
                        .iter()
                        .map(|f| file_artifact(trial_id, section, upload_type, upload_id, f, now)),
                );
            }
        }
    }

    Ok(Mirror { relational, files })
}

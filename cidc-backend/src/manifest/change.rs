//! Detects how a CSMS manifest that was already ingested has changed since,
//! and applies those changes to the trial document.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use cidc_core::model::upload_job::{NewUploadJob, UploadJob, UploadJobStatus};
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::{
    Error, Result, SAMPLE_FIELDS, SHIPMENT_FIELDS, convert_samples,
    extract_info, is_excluded, shipment_of, upload_type_for,
};
use crate::{
    db::model::{relational, trial, upload_job},
    document::{self, Participant, Sample, TrialDocument},
    sync::{self, mapping},
};

/// Keys that never count as a change.
pub const IGNORED_KEYS: [&str; 19] = [
    "barcode",
    "biobank_id",
    "entry_number",
    "event",
    "excluded",
    "json_data",
    "modified_time",
    "modified_timestamp",
    "protocol_identifier",
    "qc_comments",
    "reason",
    "sample_approved",
    "sample_manifest_type",
    "samples",
    "status",
    "status_log",
    "study_encoding",
    "submitter",
    "trial_id",
];

/// Keys that never count as a change to a manifest's upload job.
const UPLOAD_IGNORED_KEYS: [&str; 3] = ["id", "token", "uploader_email"];

/// Dates and times are compared in this format.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sample-level keys that belong to the sample's participant.
const PARTICIPANT_KEYS: [&str; 3] = ["cohort_name", "participant_id", "trial_participant_id"];

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Shipment,
    Sample,
    Upload,
}

/// The fields of one entity that differ between CIDC and CSMS, as
/// `(cidc, csms)` pairs. Absent values are null.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Change {
    pub entity_type: EntityType,
    pub trial_id: String,
    pub manifest_id: String,
    pub cimac_id: Option<String>,
    pub changes: BTreeMap<String, (Value, Value)>,
}

impl Change {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn normalized(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let parsed = DateTime::parse_from_rfc3339(s)
                .map(|t| t.naive_utc())
                .ok()
                .or_else(|| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                });

            parsed.map_or_else(
                || value.clone(),
                |t| Value::String(t.format(DATETIME_FORMAT).to_string()),
            )
        }
        Value::Number(n) => n.as_f64().map_or_else(|| value.clone(), |f| json!(f)),
        _ => value.clone(),
    }
}

/// Every non-ignored key whose value differs between `cidc` and `csms`.
#[must_use]
pub fn calc_difference(
    cidc: &Map<String, Value>,
    csms: &Map<String, Value>,
    ignore: &[&str],
) -> BTreeMap<String, (Value, Value)> {
    let keys: HashSet<&String> = cidc.keys().chain(csms.keys()).collect();

    keys.into_iter()
        .filter(|key| !ignore.contains(&key.as_str()))
        .filter_map(|key| {
            let old = cidc.get(key).cloned().unwrap_or(Value::Null);
            let new = csms.get(key).cloned().unwrap_or(Value::Null);

            (normalized(&old) != normalized(&new)).then(|| (key.clone(), (old, new)))
        })
        .collect()
}

fn pick(source: &Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|key| {
            source
                .get(*key)
                .filter(|v| !v.is_null())
                .map(|v| ((*key).to_string(), v.clone()))
        })
        .collect()
}

/// The fields sample comparisons look at.
fn compared_sample_fields() -> Vec<&'static str> {
    ["cimac_id", "collection_event_name"]
        .into_iter()
        .chain(SAMPLE_FIELDS.iter().copied())
        .collect()
}

fn object_of(value: impl Serialize) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(object)) => object,
        _ => Map::new(),
    }
}

/// A stored sample as CSMS would describe it.
fn cidc_sample_view(participant: &Participant, sample: &Sample) -> Map<String, Value> {
    let mut view = pick(&object_of(sample), &compared_sample_fields());
    if let Some(cohort) = &participant.cohort_name {
        view.insert("cohort_name".to_string(), json!(cohort));
    }
    if let Some(participant_id) = &participant.participant_id {
        view.insert("participant_id".to_string(), json!(participant_id));
    }

    view
}

fn csms_sample_view(sample: &Map<String, Value>) -> Map<String, Value> {
    let mut view = pick(sample, &compared_sample_fields());
    view.extend(pick(sample, &["cohort_name", "participant_id"]));

    view
}

/// The upload fields compared for a manifest's upload job.
fn upload_view(upload_type: &str, status: UploadJobStatus, multifile: bool, manifest_id: &str) -> Map<String, Value> {
    object_of(json!({
        "upload_type": upload_type,
        "status": status.to_string(),
        "multifile": multifile,
        "shipment_manifest_id": manifest_id,
    }))
}

/// The upload job recording `manifest_id`, if there is one.
fn manifest_job<'a>(manifest_jobs: &'a [UploadJob], manifest_id: &str) -> Result<Option<&'a UploadJob>> {
    for job in manifest_jobs {
        if let Some((id, _)) = mapping::manifest_samples(job)? {
            if id == manifest_id {
                return Ok(Some(job));
            }
        }
    }

    Ok(None)
}

/// Compare `manifest` with what `document` holds for it.
///
/// `manifest_jobs` are the trial's completed manifest uploads; they tell
/// which stored samples came with the manifest when the document does not.
///
/// # Errors
/// [`Error::NewManifest`] when the document lacks the shipment, and
/// [`Error::CriticalChange`] when the manifest and the document disagree on
/// which samples were shipped.
pub fn diff_manifest(
    document: &TrialDocument,
    manifest_jobs: &[UploadJob],
    manifest: &Map<String, Value>,
) -> Result<Vec<Change>> {
    if is_excluded(manifest) {
        return Ok(Vec::new());
    }

    let info = extract_info(manifest)?;
    let trial_id = info.trial_id.as_str();
    let manifest_id = info.manifest_id.as_str();

    let Some(cidc_shipment) = document
        .shipments
        .iter()
        .find(|s| s.manifest_id == manifest_id)
    else {
        return Err(Error::NewManifest {
            manifest_id: manifest_id.to_string(),
        });
    };

    let sample_manifests = mapping::sample_manifest_map(manifest_jobs)?;
    let shipped_with = |sample: &Sample| {
        sample
            .shipment_manifest_id
            .clone()
            .or_else(|| sample_manifests.get(&sample.cimac_id).cloned())
    };

    let mut cidc_samples: HashMap<&str, Map<String, Value>> = HashMap::new();
    let mut elsewhere: HashMap<&str, Option<String>> = HashMap::new();
    for participant in &document.participants {
        for sample in &participant.samples {
            let shipment = shipped_with(sample);
            if shipment.as_deref() == Some(manifest_id) {
                cidc_samples.insert(&sample.cimac_id, cidc_sample_view(participant, sample));
            } else {
                elsewhere.insert(&sample.cimac_id, shipment);
            }
        }
    }

    let csms_samples = convert_samples(trial_id, manifest_id, info.samples.clone(), &HashSet::new())?;
    let csms_ids: HashSet<&str> = csms_samples.iter().map(|(id, _)| id.as_str()).collect();

    let mut missing: Vec<&&str> = cidc_samples
        .keys()
        .filter(|id| !csms_ids.contains(**id))
        .collect();
    missing.sort();
    if let Some(cimac_id) = missing.first() {
        return Err(Error::CriticalChange {
            message: format!(
                "Missing sample: ({trial_id}, {manifest_id}, {cimac_id}) on CSMS ({trial_id}, {manifest_id})"
            ),
        });
    }

    let mut changes = Vec::new();

    let shipment_changes = calc_difference(
        &pick(&object_of(cidc_shipment), &SHIPMENT_FIELDS),
        &shipment_of(manifest, &info.samples)?,
        &IGNORED_KEYS,
    );
    if !shipment_changes.is_empty() {
        changes.push(Change {
            entity_type: EntityType::Shipment,
            trial_id: trial_id.to_string(),
            manifest_id: manifest_id.to_string(),
            cimac_id: None,
            changes: shipment_changes,
        });
    }

    for (cimac_id, csms_sample) in &csms_samples {
        let Some(cidc_sample) = cidc_samples.get(cimac_id.as_str()) else {
            let found = match elsewhere.get(cimac_id.as_str()) {
                Some(shipment) => format!(
                    "({trial_id}, {}, {cimac_id})",
                    shipment.as_deref().unwrap_or("<no shipment>")
                ),
                None => "<no sample found>".to_string(),
            };
            return Err(Error::CriticalChange {
                message: format!(
                    "{found} to CSMS ({trial_id}, {manifest_id}, {cimac_id})"
                ),
            });
        };

        let sample_changes = calc_difference(cidc_sample, &csms_sample_view(csms_sample), &IGNORED_KEYS);
        if !sample_changes.is_empty() {
            changes.push(Change {
                entity_type: EntityType::Sample,
                trial_id: trial_id.to_string(),
                manifest_id: manifest_id.to_string(),
                cimac_id: Some(cimac_id.clone()),
                changes: sample_changes,
            });
        }
    }

    let cidc_upload = manifest_job(manifest_jobs, manifest_id)?
        .map(|job| upload_view(&job.upload_type, job.status, job.multifile, manifest_id))
        .unwrap_or_default();
    let csms_upload = upload_view(
        &upload_type_for(&info.samples)?,
        UploadJobStatus::MergeCompleted,
        false,
        manifest_id,
    );
    let upload_changes = calc_difference(&cidc_upload, &csms_upload, &UPLOAD_IGNORED_KEYS);
    if !upload_changes.is_empty() {
        changes.push(Change {
            entity_type: EntityType::Upload,
            trial_id: trial_id.to_string(),
            manifest_id: manifest_id.to_string(),
            cimac_id: None,
            changes: upload_changes,
        });
    }

    Ok(changes)
}

/// Compare an ingested manifest with its trial's current state.
///
/// # Errors
/// [`Error::NewManifest`] for a manifest no trial has, and
/// [`Error::CriticalChange`] when the manifest moved to another trial or its
/// samples no longer match the stored ones.
pub async fn detect_manifest_changes(
    manifest: &Map<String, Value>,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<Change>> {
    if is_excluded(manifest) {
        return Ok(Vec::new());
    }

    let info = extract_info(manifest)?;
    match relational::shipment_trial(&info.manifest_id, db_conn).await? {
        None => {
            return Err(Error::NewManifest {
                manifest_id: info.manifest_id,
            });
        }
        Some(stored_trial) if stored_trial != info.trial_id => {
            return Err(Error::CriticalChange {
                message: format!(
                    "({stored_trial}, {}) to CSMS ({}, {})",
                    info.manifest_id, info.trial_id, info.manifest_id
                ),
            });
        }
        Some(_) => {}
    }

    for (i, sample) in info.samples.iter().enumerate() {
        let Some(cimac_id) = sample.get("cimac_id").and_then(Value::as_str) else {
            continue;
        };
        if let Some((other_trial, shipment)) = relational::sample_location(cimac_id, db_conn).await? {
            if other_trial != info.trial_id {
                return Err(Error::CriticalChange {
                    message: format!(
                        "({other_trial}, {}, {cimac_id}) to CSMS samples[{i}] ({}, {})",
                        shipment.unwrap_or_default(),
                        info.trial_id,
                        info.manifest_id
                    ),
                });
            }
        }
    }

    let stored = trial::fetch_for_update(&info.trial_id, db_conn).await?;
    let document = TrialDocument::from_value(&stored.metadata_json)?;
    let manifest_jobs = upload_job::manifest_jobs_for_trial(&info.trial_id, db_conn).await?;

    diff_manifest(&document, &manifest_jobs, manifest)
}

fn set_or_remove(object: &mut Map<String, Value>, key: &str, value: &Value) {
    if value.is_null() {
        object.remove(key);
    } else {
        object.insert(key.to_string(), value.clone());
    }
}

fn array_mut<'a>(object: &'a mut Value, key: &str) -> impl Iterator<Item = &'a mut Value> {
    object
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
}

fn not_found(change: &Change) -> Error {
    Error::Invalid {
        message: format!(
            "{} {} of manifest {} is not in trial {}",
            change.entity_type,
            change.cimac_id.as_deref().unwrap_or_default(),
            change.manifest_id,
            change.trial_id
        ),
    }
}

/// Write a shipment or sample change into a trial document. Upload changes
/// leave the document alone.
///
/// # Errors
/// When the document lacks the changed shipment or sample.
pub fn apply_to_document(document: &mut Value, change: &Change) -> Result<()> {
    match change.entity_type {
        EntityType::Shipment => {
            let shipment = array_mut(document, "shipments")
                .filter_map(Value::as_object_mut)
                .find(|s| {
                    s.get("manifest_id").and_then(Value::as_str) == Some(change.manifest_id.as_str())
                })
                .ok_or_else(|| not_found(change))?;

            for (key, (_, new)) in &change.changes {
                set_or_remove(shipment, key, new);
            }
        }
        EntityType::Sample => {
            let cimac_id = change.cimac_id.as_deref().unwrap_or_default();
            let participant = array_mut(document, "participants")
                .find(|p| {
                    p.get("samples")
                        .and_then(Value::as_array)
                        .is_some_and(|samples| {
                            samples
                                .iter()
                                .any(|s| s.get("cimac_id").and_then(Value::as_str) == Some(cimac_id))
                        })
                })
                .ok_or_else(|| not_found(change))?;

            for (key, (_, new)) in &change.changes {
                if !PARTICIPANT_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let key = if key == "trial_participant_id" {
                    "participant_id"
                } else {
                    key.as_str()
                };
                if let Some(participant) = participant.as_object_mut() {
                    set_or_remove(participant, key, new);
                }
            }

            let sample = array_mut(participant, "samples")
                .filter_map(Value::as_object_mut)
                .find(|s| s.get("cimac_id").and_then(Value::as_str) == Some(cimac_id))
                .ok_or_else(|| not_found(change))?;
            for (key, (_, new)) in &change.changes {
                if !PARTICIPANT_KEYS.contains(&key.as_str()) {
                    set_or_remove(sample, key, new);
                }
            }
        }
        EntityType::Upload => {}
    }

    Ok(())
}

/// The patch a manifest upload job would have carried, rebuilt from the
/// document's samples of that shipment.
fn manifest_patch_from(document: &TrialDocument, manifest_id: &str) -> Value {
    let participants: Vec<Value> = document
        .participants
        .iter()
        .filter_map(|p| {
            let samples: Vec<Value> = p
                .samples
                .iter()
                .filter(|s| s.shipment_manifest_id.as_deref() == Some(manifest_id))
                .map(|s| json!({"cimac_id": s.cimac_id}))
                .collect();

            (!samples.is_empty()).then(|| {
                json!({"cimac_participant_id": p.cimac_participant_id, "samples": samples})
            })
        })
        .collect();

    json!({
        "protocol_identifier": document.protocol_identifier,
        "shipments": [{"manifest_id": manifest_id}],
        "participants": participants,
    })
}

async fn apply_upload_change(
    change: &Change,
    document: &TrialDocument,
    uploader_email: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<()> {
    let Some((_, Value::String(upload_type))) = change.changes.get("upload_type") else {
        return Ok(());
    };

    let manifest_jobs = upload_job::manifest_jobs_for_trial(&change.trial_id, db_conn).await?;
    match manifest_job(&manifest_jobs, &change.manifest_id)? {
        Some(job) => {
            upload_job::set_upload_type(job, upload_type, db_conn).await?;
        }
        None => {
            let new_job = NewUploadJob {
                trial_id: change.trial_id.clone(),
                upload_type: upload_type.clone(),
                metadata_patch: manifest_patch_from(document, &change.manifest_id),
                gcs_file_map: None,
                multifile: false,
            };
            upload_job::create(&new_job, uploader_email, UploadJobStatus::MergeCompleted, db_conn)
                .await?;
        }
    }

    Ok(())
}

async fn apply_to_trial(
    trial_id: &str,
    changes: &[&Change],
    uploader_email: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<()> {
    let stored = trial::fetch_for_update(trial_id, db_conn).await?;

    let mut updated = stored.metadata_json.clone();
    for change in changes {
        apply_to_document(&mut updated, change)?;
    }
    let parsed = document::validate(&updated)?;

    for change in changes.iter().filter(|c| c.entity_type == EntityType::Upload) {
        apply_upload_change(change, &parsed, uploader_email, db_conn).await?;
    }

    trial::update_document(trial_id, &updated, db_conn).await?;
    sync::sync_trial(trial_id, &updated, db_conn).await?;

    tracing::info!(trial_id, n_changes = changes.len(), "applied manifest changes");

    Ok(())
}

/// Apply detected changes to the documents of their trials and rebuild
/// their relational mirrors, all in one transaction. `uploader_email`
/// records a manifest upload job that has to be recreated.
///
/// # Errors
/// When a change refers to something its trial does not have, or a changed
/// document is invalid.
pub async fn apply_manifest_changes(
    changes: &[Change],
    uploader_email: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<()> {
    let mut by_trial: BTreeMap<&str, Vec<&Change>> = BTreeMap::new();
    for change in changes.iter().filter(|c| !c.is_empty()) {
        by_trial.entry(&change.trial_id).or_default().push(change);
    }
    if by_trial.is_empty() {
        return Ok(());
    }

    db_conn
        .transaction::<_, Error, _>(|conn| {
            async move {
                for (trial_id, changes) in &by_trial {
                    apply_to_trial(trial_id, changes, uploader_email, conn).await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
}

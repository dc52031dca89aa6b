//! Rows of the relational mirror of a trial document. They are only ever
//! written as a whole trial at a time by [`RelationalTrial::write`].

use chrono::NaiveDate;
use cidc_schema::{
    aliquots, assay_records, clinical_trials, cohorts, collection_events, participants, samples,
    shipments, uploads,
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::error::Result;

/// Keeps a batch insert of the widest table well under Postgres' limit of
/// 65535 bind parameters.
const INSERT_CHUNK_SIZE: usize = 1000;

#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = clinical_trials, check_for_backend(diesel::pg::Pg))]
pub struct ClinicalTrialRow {
    pub protocol_identifier: String,
    pub nct_id: Option<String>,
    pub nci_id: Option<String>,
    pub trial_name: Option<String>,
    pub trial_description: Option<String>,
    pub trial_organization: Option<String>,
    pub grant_or_affiliated_network: Option<String>,
    pub trial_status: Option<String>,
    pub biobank: Option<String>,
    pub justification: Option<String>,
    pub biomarker_plan: Option<String>,
    pub data_sharing_plan: Option<String>,
    pub lead_cimac_pis: Value,
    pub lead_cimac_contacts: Value,
    pub lead_trial_staff: Value,
    pub extra_metadata: Value,
}

#[derive(Insertable, Serialize, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = cohorts, check_for_backend(diesel::pg::Pg))]
pub struct CohortRow {
    pub trial_id: String,
    pub cohort_name: String,
}

#[derive(Insertable, Serialize, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = collection_events, check_for_backend(diesel::pg::Pg))]
pub struct CollectionEventRow {
    pub trial_id: String,
    pub event_name: String,
}

#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = shipments, check_for_backend(diesel::pg::Pg))]
pub struct ShipmentRow {
    pub trial_id: String,
    pub manifest_id: String,
    pub assay_priority: Option<String>,
    pub assay_type: Option<String>,
    pub courier: Option<String>,
    pub tracking_number: Option<String>,
    pub account_number: Option<String>,
    pub shipping_condition: Option<String>,
    pub date_shipped: Option<NaiveDate>,
    pub date_received: Option<NaiveDate>,
    pub quality_of_shipment: Option<String>,
    pub ship_from: Option<String>,
    pub ship_to: Option<String>,
    pub receiving_party: Option<String>,
    pub extra_metadata: Value,
}

#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = participants, check_for_backend(diesel::pg::Pg))]
pub struct ParticipantRow {
    pub trial_id: String,
    pub cimac_participant_id: String,
    pub trial_participant_id: String,
    pub cohort_name: Option<String>,
    pub gender: Option<String>,
    pub race: Option<String>,
    pub ethnicity: Option<String>,
    pub extra_metadata: Value,
}

#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = samples, check_for_backend(diesel::pg::Pg))]
pub struct SampleRow {
    pub trial_id: String,
    pub cimac_id: String,
    pub cimac_participant_id: String,
    pub collection_event_name: String,
    pub shipment_manifest_id: Option<String>,
    pub box_number: Option<String>,
    pub surgical_pathology_report_id: Option<String>,
    pub clinical_report_id: Option<String>,
    pub parent_sample_id: Option<String>,
    pub processed_sample_id: Option<String>,
    pub site_description: Option<String>,
    pub topography_code: Option<String>,
    pub topography_description: Option<String>,
    pub histology_behavior: Option<String>,
    pub histology_behavior_description: Option<String>,
    pub sample_location: Option<String>,
    pub type_of_sample: Option<String>,
    pub type_of_primary_container: Option<String>,
    pub processed_sample_type: Option<String>,
    pub processed_sample_quantity: Option<String>,
    pub processed_sample_volume: Option<String>,
    pub processed_sample_volume_units: Option<String>,
    pub processed_sample_concentration: Option<String>,
    pub processed_sample_derivative: Option<String>,
    pub fixation_stabilization_type: Option<String>,
    pub sample_derivative_concentration: Option<f64>,
    pub intended_assay: Option<String>,
    pub extra_metadata: Value,
}

#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = aliquots, check_for_backend(diesel::pg::Pg))]
pub struct AliquotRow {
    pub trial_id: String,
    pub cimac_id: String,
    pub slide_number: String,
    pub quantity: Option<String>,
    pub aliquot_replacement: Option<String>,
    pub aliquot_status: Option<String>,
    pub material_extracted: Option<String>,
    pub extracted_concentration: Option<f64>,
    pub aliquot_amount: Option<String>,
    pub lymphocyte_influx: Option<String>,
    pub extra_metadata: Value,
}

/// An assay batch, or the record of a manifest upload.
#[derive(Insertable, Serialize, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = uploads, check_for_backend(diesel::pg::Pg))]
pub struct UploadRow {
    pub id: Uuid,
    pub trial_id: String,
    pub upload_type: String,
    pub batch_key: String,
    pub shipment_manifest_id: Option<String>,
    pub status: String,
    pub multifile: bool,
    pub assay_creator: Option<String>,
    pub uploader_email: Option<String>,
    pub gcs_xlsx_uri: Option<String>,
    pub extra_metadata: Value,
}

#[derive(Insertable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = assay_records, check_for_backend(diesel::pg::Pg))]
pub struct AssayRecordRow {
    pub upload_id: Uuid,
    pub cimac_id: String,
    pub trial_id: String,
    pub extra_metadata: Value,
}

/// Every relational row derived from one trial document.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct RelationalTrial {
    pub trial: ClinicalTrialRow,
    pub collection_events: Vec<CollectionEventRow>,
    pub cohorts: Vec<CohortRow>,
    pub shipments: Vec<ShipmentRow>,
    pub participants: Vec<ParticipantRow>,
    pub samples: Vec<SampleRow>,
    pub aliquots: Vec<AliquotRow>,
    pub uploads: Vec<UploadRow>,
    pub records: Vec<AssayRecordRow>,
}

macro_rules! insert_chunked {
    ($table:ident, $rows:expr, $db_conn:expr) => {
        for chunk in $rows.chunks(INSERT_CHUNK_SIZE) {
            diesel::insert_into($table::table)
                .values(chunk)
                .execute($db_conn)
                .await?;
        }
    };
}

impl RelationalTrial {
    /// Replace the trial's mirror with these rows. Deleting the clinical
    /// trial row cascades to every dependent table, and files linked to the
    /// trial's old batches are unlinked.
    ///
    /// # Errors
    pub async fn write(&self, db_conn: &mut AsyncPgConnection) -> Result<()> {
        let trial_id = &self.trial.protocol_identifier;

        diesel::delete(clinical_trials::table.find(trial_id))
            .execute(db_conn)
            .await?;

        diesel::insert_into(clinical_trials::table)
            .values(&self.trial)
            .execute(db_conn)
            .await?;

        insert_chunked!(collection_events, self.collection_events, db_conn);
        insert_chunked!(cohorts, self.cohorts, db_conn);
        insert_chunked!(shipments, self.shipments, db_conn);
        insert_chunked!(participants, self.participants, db_conn);
        insert_chunked!(samples, self.samples, db_conn);
        insert_chunked!(aliquots, self.aliquots, db_conn);
        insert_chunked!(uploads, self.uploads, db_conn);
        insert_chunked!(assay_records, self.records, db_conn);

        Ok(())
    }
}

/// The trial a shipment was recorded under, if any trial has it.
///
/// # Errors
pub async fn shipment_trial(
    manifest_id: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<Option<String>> {
    Ok(shipments::table
        .filter(shipments::manifest_id.eq(manifest_id))
        .select(shipments::trial_id)
        .first(db_conn)
        .await
        .optional()?)
}

/// The trial and shipment a sample was recorded under, if any trial has it.
///
/// # Errors
pub async fn sample_location(
    cimac_id: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<Option<(String, Option<String>)>> {
    Ok(samples::table
        .filter(samples::cimac_id.eq(cimac_id))
        .select((samples::trial_id, samples::shipment_manifest_id))
        .first(db_conn)
        .await
        .optional()?)
}

#[cfg(test)]
mod tests {
    use cidc_core::model::trial::NewTrialMetadata;
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::db::{
        self, Write,
        test_util::{DbConnection, db_conn, trial_document},
    };

    fn minimal(trial_id: &str, cohort: &str) -> RelationalTrial {
        RelationalTrial {
            trial: ClinicalTrialRow {
                protocol_identifier: trial_id.to_string(),
                lead_cimac_pis: json!([]),
                lead_cimac_contacts: json!([]),
                lead_trial_staff: json!([]),
                extra_metadata: json!({}),
                ..Default::default()
            },
            cohorts: vec![CohortRow {
                trial_id: trial_id.to_string(),
                cohort_name: cohort.to_string(),
            }],
            ..Default::default()
        }
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn rewriting_replaces_previous_rows(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    NewTrialMetadata {
                        trial_id: "test-mirror".to_string(),
                        metadata_json: trial_document("test-mirror"),
                    }
                    .write(conn)
                    .await?;

                    minimal("test-mirror", "Arm_A").write(conn).await?;
                    minimal("test-mirror", "Arm_B").write(conn).await?;

                    let cohort_names: Vec<String> = cohorts::table
                        .filter(cohorts::trial_id.eq("test-mirror"))
                        .select(cohorts::cohort_name)
                        .load(conn)
                        .await?;
                    assert_eq!(cohort_names, ["Arm_B"]);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

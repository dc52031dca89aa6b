use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
};
use rstest::fixture;
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use crate::server::{run_migrations, util::DevContainer};

struct TestState {
    _container: DevContainer,
    db_pool: Pool<AsyncPgConnection>,
}
impl TestState {
    async fn new() -> Self {
        let name = "cidc-backend_unit_test";
        let container = DevContainer::new(name, false).await.unwrap();

        let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            container.db_url().await.unwrap(),
        );
        let db_pool = Pool::builder(db_config).build().unwrap();

        let db_conn = db_pool.get().await.unwrap();
        run_migrations(db_conn).await.unwrap();

        Self {
            _container: container,
            db_pool,
        }
    }
}

static TEST_STATE: OnceCell<TestState> = OnceCell::const_new();
pub type DbConnection = Object<AsyncPgConnection>;

#[fixture]
pub async fn db_conn() -> DbConnection {
    let test_state = TEST_STATE.get_or_init(TestState::new).await;

    test_state.db_pool.get().await.unwrap()
}

/// A small but complete trial document: two participants with samples and
/// aliquots, one shipment and a WES batch with a file per record.
pub fn trial_document(trial_id: &str) -> Value {
    json!({
        "protocol_identifier": trial_id,
        "nct_id": "NCT00000001",
        "trial_name": "test trial",
        "allowed_cohort_names": ["Arm_A", "Arm_B"],
        "allowed_collection_event_names": ["Baseline", "On_Treatment"],
        "shipments": [{
            "manifest_id": format!("{trial_id}-manifest-1"),
            "assay_type": "WES",
            "courier": "FedEx",
            "date_shipped": "2024-03-01 00:00:00",
            "quality_of_shipment": "Specimen shipment received in good condition"
        }],
        "participants": [
            {
                "cimac_participant_id": "CTTTPP1",
                "participant_id": "trial-participant-1",
                "cohort_name": "Arm_A",
                "gender": "Female",
                "samples": [{
                    "cimac_id": "CTTTPP101.00",
                    "parent_sample_id": "parent-1",
                    "collection_event_name": "Baseline",
                    "shipment_manifest_id": format!("{trial_id}-manifest-1"),
                    "processed_sample_type": "Tumor DNA",
                    "sample_derivative_concentration": 12.5,
                    "aliquots": [{"slide_number": "01", "quantity": "2"}]
                }]
            },
            {
                "cimac_participant_id": "CTTTPP2",
                "participant_id": "trial-participant-2",
                "cohort_name": "Arm_B",
                "samples": [{
                    "cimac_id": "CTTTPP201.00",
                    "parent_sample_id": "parent-2",
                    "collection_event_name": "On_Treatment",
                    "box_number": 1
                }]
            }
        ],
        "assays": {
            "wes_fastq": [{
                "assay_run_id": "wes-run-1",
                "assay_creator": "DFCI",
                "records": [
                    {
                        "cimac_id": "CTTTPP101.00",
                        "files": {
                            "r1": {
                                "object_url": format!("{trial_id}/wes_fastq/CTTTPP101.00/r1.fastq.gz"),
                                "upload_placeholder": "a1",
                                "file_size_bytes": 100,
                                "md5_hash": "abc",
                                "data_format": "FASTQ.GZ",
                                "uploaded_timestamp": "2024-03-02T00:00:00Z"
                            }
                        }
                    },
                    {
                        "cimac_id": "CTTTPP201.00",
                        "files": {
                            "r1": {
                                "object_url": format!("{trial_id}/wes_fastq/CTTTPP201.00/r1.fastq.gz"),
                                "upload_placeholder": "b1",
                                "file_size_bytes": 200,
                                "data_format": "FASTQ.GZ"
                            }
                        }
                    }
                ]
            }]
        }
    })
}

/// A CSMS manifest adding a sample to the first participant of
/// [`trial_document`] and a sample of a new participant.
pub fn csms_manifest(trial_id: &str, manifest_id: &str) -> Value {
    let sample = |cimac_id: &str, participant_id: &str, cohort: &str, event: &str| {
        json!({
            "cimac_id": cimac_id,
            "protocol_identifier": trial_id,
            "manifest_id": manifest_id,
            "participant_id": participant_id,
            "cohort_name": cohort,
            "standardized_collection_event_name": event,
            "processed_sample_type": "pbmc",
            "sample_manifest_type": "biofluid_cellular",
            "type_of_sample": "Blood",
            "assay_priority": "1",
            "assay_type": "Olink",
            "box_number": "1"
        })
    };

    let mut first = sample("CTTTPP102.00", "trial-participant-1", "Arm_A", "On_Treatment");
    first["fixation_or_stabilization_type"] = json!("Frozen");
    first["sample_derivative_concentration"] = json!("3.5");

    json!({
        "manifest_id": manifest_id,
        "protocol_identifier": trial_id,
        "status": "qc_complete",
        "courier": "UPS",
        "date_shipped": "2024-04-01 00:00:00",
        "samples": [
            first,
            sample("CTTTPP301.00", "trial-participant-3", "Arm_B", "Baseline")
        ]
    })
}

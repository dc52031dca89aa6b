use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cidc_macros::{db_enum, db_json, insertion, ordinal_columns_enum, selection, update};
use cidc_schema::upload_jobs;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::Endpoint;

const ENDPOINT: &str = "/upload_jobs";

#[db_enum("kebab-case")]
pub enum UploadJobStatus {
    Started,
    UploadCompleted,
    UploadFailed,
    MergeCompleted,
    MergeFailed,
}

impl UploadJobStatus {
    #[must_use]
    pub fn is_upload_status(self) -> bool {
        matches!(self, Self::UploadCompleted | Self::UploadFailed)
    }

    #[must_use]
    pub fn is_merge_status(self) -> bool {
        matches!(self, Self::MergeCompleted | Self::MergeFailed)
    }

    /// Whether a job may move from `self` to `target`. Manifest uploads skip
    /// the upload phase and may go straight from `started` to a merge status.
    #[must_use]
    pub fn can_transition_to(self, target: Self, is_manifest: bool) -> bool {
        if target == Self::Started || self.is_merge_status() {
            return false;
        }

        if self.is_upload_status() {
            return target.is_merge_status();
        }

        // `self` is `Started` from here on
        target.is_upload_status() || (is_manifest && target.is_merge_status())
    }
}

/// Maps the GCS URI of each uploaded file to the upload placeholder it fills
/// in the job's metadata patch.
#[db_json]
pub struct GcsFileMap(pub BTreeMap<String, String>);

#[insertion(upload_jobs)]
pub struct NewUploadJob {
    #[garde(length(min = 1))]
    pub trial_id: String,
    #[garde(length(min = 1))]
    pub upload_type: String,
    pub metadata_patch: Value,
    pub gcs_file_map: Option<GcsFileMap>,
    #[serde(default)]
    pub multifile: bool,
}
impl Endpoint for NewUploadJob {
    fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

#[selection(upload_jobs)]
#[derive(Deserialize, PartialEq)]
pub struct UploadJob {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag")]
    pub etag: String,
    pub status: UploadJobStatus,
    pub status_details: Option<String>,
    pub token: Uuid,
    pub multifile: bool,
    pub gcs_file_map: Option<GcsFileMap>,
    pub gcs_xlsx_uri: Option<String>,
    pub metadata_patch: Value,
    pub upload_type: String,
    pub uploader_email: String,
    pub trial_id: String,
}
impl Endpoint for UploadJob {
    fn endpoint() -> String {
        format!("{ENDPOINT}/{{upload_job_id}}")
    }
}

impl UploadJob {
    #[must_use]
    pub fn merge_endpoint() -> String {
        format!("/admin{ENDPOINT}/{{upload_job_id}}/merge")
    }
}

#[update(upload_jobs)]
pub struct UploadJobUpdate {
    pub status: Option<UploadJobStatus>,
    pub gcs_file_map: Option<GcsFileMap>,
    #[serde(skip)]
    pub status_details: Option<String>,
    #[serde(skip)]
    pub metadata_patch: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct UploadToken {
    pub token: Uuid,
}

#[ordinal_columns_enum]
pub enum UploadJobOrdinalColumn {
    CreatedAt,
    UpdatedAt,
    TrialId,
    UploadType,
    Status,
}

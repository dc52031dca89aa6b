use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use cidc_macros::{insertion, ordinal_columns_enum, query_request, selection};
use cidc_schema::downloadable_files;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Delimited, Endpoint};

const ENDPOINT: &str = "/downloadable_files";

static FILE_EXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.([^./]*(\.gz)?)$").unwrap());

/// Separates an upload type from a facet group in a `facets` query value.
pub const FACET_DELIMITER: char = ':';

/// Also a changeset, so that registering an existing `object_url` replaces
/// the stored artifact.
#[insertion(downloadable_files)]
#[derive(diesel::AsChangeset)]
#[diesel(treat_none_as_null = true)]
pub struct NewDownloadableFile {
    #[garde(length(min = 1))]
    pub trial_id: String,
    #[garde(length(min = 1))]
    pub upload_type: String,
    #[garde(length(min = 1))]
    pub object_url: String,
    pub file_name: Option<String>,
    #[garde(length(min = 1))]
    pub data_format: String,
    #[garde(length(min = 1))]
    pub facet_group: String,
    #[garde(range(min = 0))]
    pub file_size_bytes: i64,
    pub uploaded_timestamp: DateTime<Utc>,
    pub md5_hash: Option<String>,
    pub crc32c_hash: Option<String>,
    #[serde(default = "empty_object")]
    pub additional_metadata: Value,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
    #[serde(default)]
    pub analysis_friendly: bool,
    #[serde(default)]
    pub upload_id: Option<Uuid>,
    #[serde(default)]
    pub cimac_id: Option<String>,
}
impl Endpoint for NewDownloadableFile {
    fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn visible_by_default() -> bool {
    true
}

impl NewDownloadableFile {
    /// Fill in `cimac_id` from `additional_metadata` unless it was given
    /// explicitly, and normalize a null metadata object to `{}`.
    #[must_use]
    pub fn with_derived_fields(mut self) -> Self {
        if self.additional_metadata.is_null() {
            self.additional_metadata = empty_object();
        }

        if self.cimac_id.is_none() {
            self.cimac_id = cimac_id_from_metadata(&self.additional_metadata);
        }

        self
    }
}

/// The value of the first `additional_metadata` key that ends in `cimac_id`,
/// e.g. `assays.wes.records.cimac_id`.
#[must_use]
pub fn cimac_id_from_metadata(additional_metadata: &Value) -> Option<String> {
    let Value::Object(metadata) = additional_metadata else {
        return None;
    };

    metadata
        .iter()
        .find(|(k, _)| k.ends_with("cimac_id"))
        .and_then(|(_, v)| v.as_str())
        .map(str::to_string)
}

#[must_use]
pub fn file_ext(object_url: &str) -> Option<&str> {
    FILE_EXT
        .captures(object_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[selection(downloadable_files)]
#[derive(Deserialize, PartialEq)]
pub struct DownloadableFile {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag")]
    pub etag: String,
    pub trial_id: String,
    pub upload_type: String,
    pub object_url: String,
    pub file_name: Option<String>,
    pub data_format: String,
    pub facet_group: String,
    pub file_size_bytes: i64,
    pub uploaded_timestamp: DateTime<Utc>,
    pub md5_hash: Option<String>,
    pub crc32c_hash: Option<String>,
    pub additional_metadata: Value,
    pub visible: bool,
    pub analysis_friendly: bool,
    pub upload_id: Option<Uuid>,
    pub cimac_id: Option<String>,
}
impl Endpoint for DownloadableFile {
    fn endpoint() -> String {
        format!("{ENDPOINT}/{{file_id}}")
    }
}

impl DownloadableFile {
    #[must_use]
    pub fn related_files_endpoint() -> String {
        format!("{ENDPOINT}/{{file_id}}/related_files")
    }

    #[must_use]
    pub fn filelist_endpoint() -> String {
        format!("{ENDPOINT}/filelist")
    }

    #[must_use]
    pub fn download_url_endpoint() -> String {
        format!("{ENDPOINT}/download_url")
    }

    #[must_use]
    pub fn filter_facets_endpoint() -> String {
        format!("{ENDPOINT}/filter_facets")
    }

    /// One line of a `filelist.tsv`: the full GCS URI followed by a flat
    /// local file name.
    #[must_use]
    pub fn filelist_line(&self, bucket: &str) -> String {
        let flat = self.object_url.replace('/', "_");
        format!("gs://{bucket}/{}\t{flat}\n", self.object_url)
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct DownloadableFileResponse {
    #[serde(flatten)]
    pub file: DownloadableFile,
    pub file_ext: Option<String>,
}

impl From<DownloadableFile> for DownloadableFileResponse {
    fn from(file: DownloadableFile) -> Self {
        let file_ext = file_ext(&file.object_url).map(str::to_string);

        Self { file, file_ext }
    }
}

#[query_request]
pub struct FileQuery {
    pub trial_ids: Delimited,
    pub facets: Delimited,
}

/// A parsed `facets` value: `upload_type` alone, or narrowed to one facet
/// group with `upload_type:facet_group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facet<'a> {
    pub upload_type: &'a str,
    pub facet_group: Option<&'a str>,
}

impl FileQuery {
    #[must_use]
    pub fn parsed_facets(&self) -> Vec<Facet<'_>> {
        self.facets
            .as_slice()
            .iter()
            .map(|f| match f.split_once(FACET_DELIMITER) {
                Some((upload_type, facet_group)) => Facet {
                    upload_type,
                    facet_group: Some(facet_group),
                },
                None => Facet {
                    upload_type: f,
                    facet_group: None,
                },
            })
            .collect()
    }
}

#[ordinal_columns_enum]
pub enum FileOrdinalColumn {
    TrialId,
    UploadType,
    FacetGroup,
    FileSizeBytes,
    UploadedTimestamp,
    ObjectUrl,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FilelistRequest {
    pub file_ids: Vec<Uuid>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct DownloadUrlQuery {
    pub id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FacetCount {
    pub label: String,
    pub count: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterFacets {
    pub trial_ids: Vec<FacetCount>,
    pub facets: std::collections::BTreeMap<String, Vec<FacetCount>>,
}

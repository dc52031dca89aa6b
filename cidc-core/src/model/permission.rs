use chrono::{DateTime, Utc};
use cidc_macros::{insertion, ordinal_columns_enum, query_request, selection};
use cidc_schema::permissions;
use uuid::Uuid;

use super::Endpoint;

const ENDPOINT: &str = "/permissions";

#[insertion(permissions)]
pub struct NewPermission {
    pub granted_to_user: Uuid,
    #[garde(length(min = 1))]
    pub trial_id: Option<String>,
    #[garde(length(min = 1))]
    pub upload_type: Option<String>,
    #[serde(skip)]
    pub granted_by_user: Option<Uuid>,
}
impl Endpoint for NewPermission {
    fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

impl NewPermission {
    /// `None` scopes mean "every trial" and "every upload type".
    #[must_use]
    pub fn scope(&self) -> (Option<&str>, Option<&str>) {
        (self.trial_id.as_deref(), self.upload_type.as_deref())
    }
}

#[selection(permissions)]
#[derive(serde::Deserialize, PartialEq)]
pub struct Permission {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag")]
    pub etag: String,
    pub granted_to_user: Uuid,
    pub granted_by_user: Option<Uuid>,
    pub trial_id: Option<String>,
    pub upload_type: Option<String>,
}
impl Endpoint for Permission {
    fn endpoint() -> String {
        format!("{ENDPOINT}/{{permission_id}}")
    }
}

impl Permission {
    /// Whether this permission covers `trial_id` and `upload_type`, either
    /// exactly or through a cross-trial or cross-type grant.
    #[must_use]
    pub fn covers(&self, trial_id: &str, upload_type: &str) -> bool {
        match (self.trial_id.as_deref(), self.upload_type.as_deref()) {
            (Some(t), Some(u)) => t == trial_id && u == upload_type,
            (None, Some(u)) => u == upload_type,
            (Some(t), None) => t == trial_id,
            (None, None) => false,
        }
    }
}

#[query_request]
pub struct PermissionQuery {
    pub user_id: Option<Uuid>,
}

#[ordinal_columns_enum]
pub enum PermissionOrdinalColumn {
    CreatedAt,
    TrialId,
    UploadType,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn permission(trial_id: Option<&str>, upload_type: Option<&str>) -> Permission {
        Permission {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: String::new(),
            granted_to_user: Uuid::now_v7(),
            granted_by_user: None,
            trial_id: trial_id.map(str::to_string),
            upload_type: upload_type.map(str::to_string),
        }
    }

    #[rstest]
    #[case(Some("10021"), Some("wes"), "10021", "wes", true)]
    #[case(Some("10021"), Some("wes"), "10021", "olink", false)]
    #[case(None, Some("wes"), "E4412", "wes", true)]
    #[case(Some("10021"), None, "10021", "olink", true)]
    #[case(Some("10021"), None, "E4412", "olink", false)]
    fn permission_coverage(
        #[case] trial_id: Option<&str>,
        #[case] upload_type: Option<&str>,
        #[case] requested_trial: &str,
        #[case] requested_type: &str,
        #[case] covered: bool,
    ) {
        assert_eq!(
            permission(trial_id, upload_type).covers(requested_trial, requested_type),
            covered
        );
    }
}

use chrono::{DateTime, Utc};
use cidc_macros::{db_enum, insertion, ordinal_columns_enum, selection, update};
use cidc_schema::users;
use serde::Serialize;
use uuid::Uuid;

use super::Endpoint;

const ENDPOINT: &str = "/users";

#[db_enum("kebab-case")]
pub enum CidcRole {
    CidcAdmin,
    CidcBiofxUser,
    CimacBiofxUser,
    CimacUser,
    Developer,
    Devops,
    NciBiobankUser,
    NetworkViewer,
}

#[db_enum("UPPERCASE")]
pub enum Organization {
    Cidc,
    Dfci,
    Icahn,
    Stanford,
    Anderson,
}

/// A registration submitted by the person the bearer token belongs to.
/// Role, approval and disabled state are never self-assigned.
#[insertion(users)]
pub struct NewSelf {
    #[garde(email)]
    pub email: String,
    #[garde(email)]
    pub contact_email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<Organization>,
}
impl NewSelf {
    #[must_use]
    pub fn self_endpoint() -> String {
        format!("{ENDPOINT}/self")
    }
}

#[insertion(users)]
pub struct NewUser {
    #[garde(email)]
    pub email: String,
    #[garde(email)]
    pub contact_email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<Organization>,
    pub role: Option<CidcRole>,
    pub approval_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
}
impl Endpoint for NewUser {
    fn endpoint() -> String {
        ENDPOINT.to_string()
    }
}

#[selection(users)]
#[derive(serde::Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_accessed")]
    pub accessed_at: DateTime<Utc>,
    pub email: String,
    pub contact_email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<Organization>,
    pub approval_date: Option<DateTime<Utc>>,
    pub role: Option<CidcRole>,
    pub disabled: bool,
}
impl Endpoint for User {
    fn endpoint() -> String {
        format!("{ENDPOINT}/{{user_id}}")
    }
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Some(CidcRole::CidcAdmin)
    }

    #[must_use]
    pub fn is_nci_user(&self) -> bool {
        self.role == Some(CidcRole::NciBiobankUser)
    }

    #[must_use]
    pub fn is_network_viewer(&self) -> bool {
        self.role == Some(CidcRole::NetworkViewer)
    }

    /// Whether this user sees every trial and file regardless of permissions.
    #[must_use]
    pub fn sees_everything(&self) -> bool {
        self.is_admin() || self.is_nci_user()
    }

    /// An empty `allowed` slice admits any role.
    #[must_use]
    pub fn has_any_role(&self, allowed: &[CidcRole]) -> bool {
        if allowed.is_empty() {
            return true;
        }

        self.role.is_some_and(|role| allowed.contains(&role))
    }

    #[must_use]
    pub fn data_access_report_endpoint() -> String {
        format!("{ENDPOINT}/data_access_report")
    }
}

#[update(users)]
pub struct UserUpdate {
    pub contact_email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<Organization>,
    pub role: Option<CidcRole>,
    pub disabled: Option<bool>,
    #[serde(skip)]
    pub approval_date: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub accessed_at: Option<DateTime<Utc>>,
}

#[ordinal_columns_enum]
pub enum UserOrdinalColumn {
    Email,
    CreatedAt,
    AccessedAt,
    LastName,
    Role,
}

/// One line of the user data access report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DataAccessRow {
    pub trial_id: String,
    pub email: String,
    pub organization: String,
    pub role: String,
    pub upload_types: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::str::FromStr;

    use super::*;

    #[rstest]
    #[case(CidcRole::CidcAdmin, "cidc-admin")]
    #[case(CidcRole::NciBiobankUser, "nci-biobank-user")]
    #[case(CidcRole::NetworkViewer, "network-viewer")]
    #[case(CidcRole::Devops, "devops")]
    fn role_names(#[case] role: CidcRole, #[case] name: &str) {
        let as_str: &'static str = role.into();
        assert_eq!(as_str, name);
        assert_eq!(CidcRole::from_str(name).unwrap(), role);
        assert_eq!(serde_json::to_value(role).unwrap(), serde_json::json!(name));
    }

    #[test]
    fn organization_names() {
        assert_eq!(
            serde_json::to_value(Organization::Stanford).unwrap(),
            serde_json::json!("STANFORD")
        );
        assert_eq!(Organization::from_str("DFCI").unwrap(), Organization::Dfci);
    }
}

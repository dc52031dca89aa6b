use std::sync::LazyLock;

use diesel::result::DatabaseErrorInformation;
use diesel_async::pooled_connection::deadpool;
use regex::Regex;
use serde::Serialize;

static DETAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Key \((.+)\)=\((.+)\).+").unwrap());

#[derive(thiserror::Error, Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("{entity} with {} = {} already exists", field.clone().unwrap_or_default(), value.clone().unwrap_or_default())]
    DuplicateRecord {
        entity: String,
        field: Option<String>,
        value: Option<String>,
    },
    #[error("unable to create reference between {entity} and {referenced_entity} with value {} not found", value.clone().unwrap_or_default())]
    ReferenceNotFound {
        entity: String,
        referenced_entity: String,
        value: Option<String>,
    },
    #[error("record not found")]
    RecordNotFound,
    #[error("{message}")]
    Other { message: String },
}

impl Error {
    pub(crate) fn from_other_error(err: impl std::error::Error) -> Self {
        Self::Other {
            message: format!("{err:?}"),
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::Error::{DatabaseError, NotFound};
        match err {
            DatabaseError(kind, info) => Self::from((kind, info)),
            NotFound => Self::RecordNotFound,
            _ => Self::from_other_error(err),
        }
    }
}

impl From<deadpool::PoolError> for Error {
    fn from(err: deadpool::PoolError) -> Self {
        Self::from_other_error(err)
    }
}

impl From<diesel::ConnectionError> for Error {
    fn from(err: diesel::ConnectionError) -> Self {
        Self::from_other_error(err)
    }
}

impl
    From<(
        diesel::result::DatabaseErrorKind,
        Box<dyn DatabaseErrorInformation + Send + Sync>,
    )> for Error
{
    fn from(
        (kind, info): (
            diesel::result::DatabaseErrorKind,
            Box<dyn DatabaseErrorInformation + Send + Sync>,
        ),
    ) -> Self {
        use diesel::result::DatabaseErrorKind::{ForeignKeyViolation, UniqueViolation};
        let entity = info.table_name().unwrap_or_default();

        let details = info.details().unwrap_or_default();
        let (field, value) = parse_key_detail(details);

        match kind {
            UniqueViolation => Self::DuplicateRecord {
                entity: entity.to_string(),
                field,
                value,
            },
            ForeignKeyViolation => Self::ReferenceNotFound {
                entity: entity.to_string(),
                referenced_entity: referenced_table(details).to_string(),
                value,
            },
            _ => Self::from_other_error(diesel::result::Error::DatabaseError(kind, info)),
        }
    }
}

/// Split a Postgres detail like `Key (email)=(a@b.c) already exists.` into
/// the field and value.
fn parse_key_detail(details: &str) -> (Option<String>, Option<String>) {
    let Some(captures) = DETAIL_REGEX.captures(details) else {
        return (None, None);
    };

    let get = |i| captures.get(i).map(|m| m.as_str().to_string());

    (get(1), get(2))
}

/// The last word of a foreign key violation detail, e.g. `"users"` in
/// `Key (x)=(y) is not present in table "users".`
fn referenced_table(details: &str) -> &str {
    details
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .trim_end_matches('.')
        .trim_matches('"')
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        "Key (email)=(a@example.com) already exists.",
        Some("email"),
        Some("a@example.com")
    )]
    #[case(
        "Key (trial_id, cimac_id)=(10021, CTTTPP111.00) already exists.",
        Some("trial_id, cimac_id"),
        Some("10021, CTTTPP111.00")
    )]
    #[case("something else entirely", None, None)]
    fn key_detail(#[case] details: &str, #[case] field: Option<&str>, #[case] value: Option<&str>) {
        let (f, v) = parse_key_detail(details);

        assert_eq!(f.as_deref(), field);
        assert_eq!(v.as_deref(), value);
    }

    #[test]
    fn referenced_table_name() {
        assert_eq!(
            referenced_table(r#"Key (trial_id)=(nope) is not present in table "trial_metadata"."#),
            "trial_metadata"
        );
    }
}

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::QueryRejection;
use diesel_async::pooled_connection::deadpool;
use serde::Serialize;

use crate::{access, db, document, manifest, server::auth, storage, sync};

#[derive(thiserror::Error, Serialize, Debug)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("{message}")]
    BadRequest { message: String },
    #[error("invalid data: {message}")]
    Validation { message: String },
    #[error("operation not permitted: {message}")]
    Permission { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Conflict { message: String },
    #[error("this request requires an If-Match header")]
    PreconditionRequired,
    #[error("{message}")]
    PreconditionFailed { message: String },
    #[error("failed to update storage access: {message}")]
    Iam { message: String },
    #[error("{message}")]
    Internal { message: String },
    #[error("malformed request")]
    MalformedRequest {
        #[serde(skip)]
        status: StatusCode,
        message: String,
    },
    #[error(transparent)]
    #[serde(untagged)]
    Database(db::error::Error),
    #[error(transparent)]
    #[serde(untagged)]
    Auth(auth::Error),
    #[error(transparent)]
    #[serde(untagged)]
    Document(document::Error),
}

impl Error {
    pub(crate) fn status_code(&self) -> StatusCode {
        use Error::{
            Auth, BadRequest, Conflict, Database, Document, Iam, Internal, MalformedRequest,
            NotFound, Permission, PreconditionFailed, PreconditionRequired, Validation,
        };

        match self {
            BadRequest { .. } => StatusCode::BAD_REQUEST,
            Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Permission { .. } => StatusCode::FORBIDDEN,
            NotFound { .. } => StatusCode::NOT_FOUND,
            Conflict { .. } => StatusCode::CONFLICT,
            PreconditionRequired => StatusCode::PRECONDITION_REQUIRED,
            PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            Iam { .. } | Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            MalformedRequest { status, .. } => *status,
            Database(inner) => {
                use db::error::Error::{DuplicateRecord, Other, RecordNotFound, ReferenceNotFound};

                match inner {
                    DuplicateRecord { .. } => StatusCode::CONFLICT,
                    RecordNotFound => StatusCode::NOT_FOUND,
                    ReferenceNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    Other { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                }
            }
            Auth(inner) => match inner {
                auth::Error::Jwks { .. } | auth::Error::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            },
            Document(inner) => match inner {
                document::Error::Invalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                document::Error::Malformed { .. } | document::Error::MergeConflict { .. } => {
                    StatusCode::BAD_REQUEST
                }
            },
        }
    }

    /// Whether the client may see what went wrong despite a 500.
    fn shows_details(&self) -> bool {
        matches!(self, Self::Iam { .. })
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub(crate) fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<db::error::Error> for Error {
    fn from(err: db::error::Error) -> Self {
        Self::Database(err)
    }
}

impl From<auth::Error> for Error {
    fn from(err: auth::Error) -> Self {
        match err {
            auth::Error::Db(inner) => Self::Database(inner),
            other => Self::Auth(other),
        }
    }
}

impl From<document::Error> for Error {
    fn from(err: document::Error) -> Self {
        Self::Document(err)
    }
}

impl From<sync::Error> for Error {
    fn from(err: sync::Error) -> Self {
        match err {
            sync::Error::Db(inner) => Self::Database(inner),
            sync::Error::Document(inner) => Self::Document(inner),
            sync::Error::Mapping { message } => Self::Validation { message },
            err @ sync::Error::RolledBack(_) => Self::internal(err),
        }
    }
}

impl From<manifest::Error> for Error {
    fn from(err: manifest::Error) -> Self {
        use manifest::Error::{AlreadyExists, CriticalChange, Invalid, NewManifest, Sync};

        match err {
            Invalid { message } => Self::Validation { message },
            err @ AlreadyExists { .. } => Self::Conflict {
                message: err.to_string(),
            },
            err @ NewManifest { .. } => Self::NotFound {
                message: err.to_string(),
            },
            err @ CriticalChange { .. } => Self::BadRequest {
                message: err.to_string(),
            },
            Sync(inner) => Self::from(inner),
        }
    }
}

impl From<storage::Error> for Error {
    fn from(err: storage::Error) -> Self {
        Self::Iam {
            message: err.to_string(),
        }
    }
}

impl From<access::Error> for Error {
    fn from(err: access::Error) -> Self {
        match err {
            access::Error::Db(inner) => Self::Database(inner),
            access::Error::Storage(inner) => Self::from(inner),
            access::Error::Invalid { message } => Self::BadRequest { message },
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Self::Database(err.into())
    }
}

impl From<deadpool::PoolError> for Error {
    fn from(err: deadpool::PoolError) -> Self {
        Self::Database(db::error::Error::from(err))
    }
}

impl From<garde::Report> for Error {
    fn from(err: garde::Report) -> Self {
        Self::Validation {
            message: format!("{err:#}"),
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(err: JsonRejection) -> Self {
        Self::MalformedRequest {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<QueryRejection> for Error {
    fn from(err: QueryRejection) -> Self {
        Self::MalformedRequest {
            status: StatusCode::BAD_REQUEST,
            message: format!("{err:#}"),
        }
    }
}

impl From<PathRejection> for Error {
    fn from(err: PathRejection) -> Self {
        Self::MalformedRequest {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    status: u16,
    error: Option<&'a Error>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, details = ?self);
        } else {
            tracing::warn!(error = %self, status = status.as_u16());
        }

        let error = (!status.is_server_error() || self.shows_details()).then_some(&self);

        (
            status,
            axum::Json(ErrorResponse {
                status: status.as_u16(),
                error,
            }),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;

    async fn body(err: Error) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[rstest]
    #[case(Error::PreconditionRequired, StatusCode::PRECONDITION_REQUIRED)]
    #[case(
        Error::Database(db::error::Error::DuplicateRecord {
            entity: "users".to_string(),
            field: Some("email".to_string()),
            value: Some("a@example.com".to_string()),
        }),
        StatusCode::CONFLICT
    )]
    #[case(Error::Database(db::error::Error::RecordNotFound), StatusCode::NOT_FOUND)]
    #[case(Error::from(auth::Error::Disabled), StatusCode::UNAUTHORIZED)]
    #[case(
        Error::from(manifest::Error::NewManifest { manifest_id: "m1".to_string() }),
        StatusCode::NOT_FOUND
    )]
    #[case(
        Error::from(document::Error::Invalid { problems: vec!["bad".to_string()] }),
        StatusCode::UNPROCESSABLE_ENTITY
    )]
    fn statuses(#[case] err: Error, #[case] status: StatusCode) {
        assert_eq!(err.status_code(), status);
    }

    #[tokio::test]
    async fn wrapped_errors_keep_their_own_type_tag() {
        let (status, body) = body(auth::Error::MissingBearerToken.into()).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body,
            json!({"status": 401, "error": {"type": "missing_bearer_token"}})
        );
    }

    #[tokio::test]
    async fn internal_errors_are_hidden() {
        let (status, body) = body(Error::internal("connection reset")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"status": 500, "error": null}));
    }

    #[tokio::test]
    async fn iam_errors_are_shown() {
        let (_, body) = body(Error::Iam {
            message: "403 from storage".to_string(),
        })
        .await;

        assert_eq!(
            body,
            json!({"status": 500, "error": {"type": "iam", "message": "403 from storage"}})
        );
    }
}

use axum::{
    extract::{FromRequest, FromRequestParts, Path, rejection::JsonRejection},
    http::{header::IF_MATCH, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::Pagination;
use garde::Validate;
use serde::Serialize;

use super::error::{Error, Result};

pub(super) type ApiPath<T> = WithRejection<Path<T>, Error>;
pub(super) type ApiQuery<T> = WithRejection<Query<T>, Error>;

pub(super) struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Validate,
    <T as Validate>::Context: std::default::Default,
{
    type Rejection = Error;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let axum::Json(data) = axum::Json::<T>::from_request(req, state).await?;
        data.validate()?;

        Ok(Self(data))
    }
}

impl<T: Serialize> IntoResponse for ValidJson<T> {
    fn into_response(self) -> Response {
        let Self(inner) = self;

        axum::Json(inner).into_response()
    }
}

/// The etag a client expects the resource it modifies to have.
pub(super) struct IfMatch(pub(super) String);

impl<S: Send + Sync> FromRequestParts<S> for IfMatch {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let etag = parts
            .headers
            .get(IF_MATCH)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.trim().trim_start_matches("W/").trim_matches('"'))
            .filter(|h| !h.is_empty())
            .ok_or(Error::PreconditionRequired)?;

        Ok(Self(etag.to_string()))
    }
}

impl IfMatch {
    /// # Errors
    pub fn check(&self, current_etag: &str) -> Result<()> {
        if self.0 == current_etag {
            return Ok(());
        }

        Err(Error::PreconditionFailed {
            message: "the resource has changed since it was fetched, fetch it again".to_string(),
        })
    }
}

/// # Errors
pub(super) fn check_pagination<C>(pagination: &Pagination<C>) -> Result<()> {
    pagination.check().map_err(Error::bad_request)
}

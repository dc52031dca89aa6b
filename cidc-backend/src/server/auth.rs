use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    http::{Method, header::USER_AGENT, request::Parts},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use cidc_core::model::user::{CidcRole, NewSelf, User};
use serde::Serialize;

use super::{AppState, api::error::Error as ApiError};
use crate::db::{self, model::user};

pub mod jwks;

pub use jwks::Verifier;

const CLI_USER_AGENT_PREFIX: &str = "cidc-cli/";

#[derive(thiserror::Error, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("no bearer token in Authorization header")]
    MissingBearerToken,
    #[error("invalid token: {message}")]
    InvalidToken { message: String },
    #[error("cidc-cli {version} is older than the minimum supported version {min_version}")]
    OutdatedCli { version: String, min_version: String },
    #[error("{email} is not registered")]
    Unregistered { email: String },
    #[error("user is disabled")]
    Disabled,
    #[error("user registration is awaiting approval")]
    Unapproved,
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("failed to fetch signing keys: {message}")]
    Jwks { message: String },
    #[error(transparent)]
    Db(#[from] db::error::Error),
}

impl Error {
    fn invalid_token(err: impl std::fmt::Display) -> Self {
        Self::InvalidToken {
            message: err.to_string(),
        }
    }

    fn jwks(err: impl std::fmt::Display) -> Self {
        Self::Jwks {
            message: err.to_string(),
        }
    }
}

/// Dotted numeric version components, e.g. `[0, 9, 12]` for `0.9.12`.
fn version_parts(version: &str) -> Option<Vec<u64>> {
    version.trim().split('.').map(|p| p.parse().ok()).collect()
}

/// Reject requests from a `cidc-cli` older than `min_version`. Other
/// clients, and versions that do not parse, pass.
fn check_cli_version(user_agent: Option<&str>, min_version: Option<&str>) -> Result<(), Error> {
    let (Some(user_agent), Some(min_version)) = (user_agent, min_version) else {
        return Ok(());
    };
    let Some(version) = user_agent.strip_prefix(CLI_USER_AGENT_PREFIX) else {
        return Ok(());
    };

    match (version_parts(version), version_parts(min_version)) {
        (Some(v), Some(min)) if v < min => Err(Error::OutdatedCli {
            version: version.to_string(),
            min_version: min_version.to_string(),
        }),
        _ => Ok(()),
    }
}

/// The verified email of the caller. Registration is not checked.
pub struct Email(pub String);

impl FromRequestParts<AppState> for Email {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user_agent = parts.headers.get(USER_AGENT).and_then(|h| h.to_str().ok());
        check_cli_version(user_agent, state.config().min_cli_version())?;

        let verifier = match state {
            AppState::Dev { admin_email, .. } => return Ok(Self(admin_email.clone())),
            AppState::Prod { verifier, .. } => verifier,
        };

        let Ok(TypedHeader(Authorization(bearer))) =
            parts.extract::<TypedHeader<Authorization<Bearer>>>().await
        else {
            return Err(Error::MissingBearerToken.into());
        };

        Ok(Self(verifier.email(bearer.token()).await?))
    }
}

/// Only the caller's own user record may be read before approval or after
/// being disabled.
fn is_self_lookup(parts: &Parts) -> bool {
    parts.method == Method::GET && parts.uri.path() == NewSelf::self_endpoint()
}

/// A registered caller who may use the API.
pub struct Authenticated(pub User);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Email(email) = Email::from_request_parts(parts, state).await?;

        let mut db_conn = state.db_conn().await?;
        let Some(mut user) = user::fetch_by_email(&email, &mut db_conn).await? else {
            tracing::warn!(%email, path = parts.uri.path(), "UNAUTHORIZED");
            return Err(Error::Unregistered { email }.into());
        };

        if !is_self_lookup(parts) {
            let refusal = if user.disabled {
                Some(Error::Disabled)
            } else if user.approval_date.is_none() {
                Some(Error::Unapproved)
            } else {
                None
            };

            if let Some(err) = refusal {
                tracing::warn!(%email, path = parts.uri.path(), reason = %err, "UNAUTHORIZED");
                return Err(err.into());
            }
        }

        user::update_accessed(&mut user, &mut db_conn).await?;

        tracing::info!(
            %email,
            method = %parts.method,
            path = parts.uri.path(),
            "AUTHORIZED"
        );

        Ok(Self(user))
    }
}

impl Authenticated {
    /// The user, if their role is one of `allowed`. An empty `allowed`
    /// admits every role.
    ///
    /// # Errors
    pub fn require(self, allowed: &[CidcRole]) -> Result<User, Error> {
        let Self(user) = self;

        if user.has_any_role(allowed) {
            return Ok(user);
        }

        tracing::warn!(email = %user.email, role = ?user.role, "UNAUTHORIZED");

        Err(Error::Unauthorized {
            message: format!(
                "{} does not have a role permitted to make this request",
                user.email
            ),
        })
    }
}

use axum::{Router, routing::get};
use cidc_core::model::user::CidcRole;

use super::AppState;

mod admin;
pub(crate) mod error;
mod files;
mod handler;
mod info;
mod permissions;
mod trials;
mod upload_jobs;
mod users;

const ADMIN: &[CidcRole] = &[CidcRole::CidcAdmin];
const ADMIN_OR_NCI: &[CidcRole] = &[CidcRole::CidcAdmin, CidcRole::NciBiobankUser];
const UPLOADERS: &[CidcRole] = &[
    CidcRole::CidcAdmin,
    CidcRole::CimacBiofxUser,
    CidcRole::NciBiobankUser,
    CidcRole::CidcBiofxUser,
];
/// Any approved, enabled user.
const ANY_ROLE: &[CidcRole] = &[];

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async {}))
        .merge(users::router())
        .merge(permissions::router())
        .merge(trials::router())
        .merge(upload_jobs::router())
        .merge(files::router())
        .merge(info::router())
        .merge(admin::router())
}

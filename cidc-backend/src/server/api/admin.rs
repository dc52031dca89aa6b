use axum::{Json, Router, extract::State, routing::post};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::upload_job::UploadJob;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    ADMIN,
    error::{Error, Result},
    handler::ApiQuery,
};
use crate::{
    manifest::{self, Change},
    server::{AppState, auth::Authenticated},
    sync,
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/manifests", post(insert_manifest))
        .route("/admin/manifests/changes", post(manifest_changes))
        .route("/admin/load_from_blobs", post(load_from_blobs))
}

#[derive(Deserialize, Default, Debug, Clone, Copy)]
#[serde(default)]
struct DryRun {
    dry_run: bool,
}

type ManifestBody = WithRejection<Json<Map<String, Value>>, Error>;

async fn insert_manifest(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(DryRun { dry_run }), _): ApiQuery<DryRun>,
    WithRejection(Json(manifest), _): ManifestBody,
) -> Result<Json<UploadJob>> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let job = manifest::insert_manifest(&manifest, &admin.email, dry_run, &mut db_conn).await?;

    Ok(Json(job))
}

async fn manifest_changes(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(DryRun { dry_run }), _): ApiQuery<DryRun>,
    WithRejection(Json(manifest), _): ManifestBody,
) -> Result<Json<Vec<Change>>> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let changes = manifest::detect_manifest_changes(&manifest, &mut db_conn).await?;

    if !dry_run {
        manifest::apply_manifest_changes(&changes, &admin.email, &mut db_conn).await?;
    }
    tracing::info!(admin = %admin.email, n_changes = changes.len(), dry_run, "processed manifest changes");

    Ok(Json(changes))
}

async fn load_from_blobs(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(DryRun { dry_run }), _): ApiQuery<DryRun>,
) -> Result<Json<Vec<String>>> {
    let admin = auth.require(ADMIN)?;
    tracing::info!(admin = %admin.email, dry_run, "rebuilding relational mirror from documents");

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(sync::syncall_from_blobs(dry_run, &mut db_conn).await?))
}

//! Public, unauthenticated reference data.

use axum::{Json, Router, extract::State, routing::get};
use cidc_core::model::{
    trial::DataOverview,
    upload_type::{EXTRA_DATA_TYPES, SUPPORTED_ANALYSES, SUPPORTED_ASSAYS, SUPPORTED_MANIFESTS},
};
use schemars::schema::RootSchema;

use super::error::Result;
use crate::{db::model::trial, document, server::AppState};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/info/assays", get(|| async { Json(SUPPORTED_ASSAYS) }))
        .route("/info/analyses", get(|| async { Json(SUPPORTED_ANALYSES) }))
        .route("/info/manifests", get(|| async { Json(SUPPORTED_MANIFESTS) }))
        .route("/info/extra_data_types", get(|| async { Json(EXTRA_DATA_TYPES) }))
        .route("/info/data_overview", get(data_overview))
        .route("/info/schema", get(schema))
}

async fn data_overview(State(app_state): State<AppState>) -> Result<Json<DataOverview>> {
    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(trial::data_overview(&mut db_conn).await?))
}

async fn schema() -> Json<RootSchema> {
    Json(document::schema())
}

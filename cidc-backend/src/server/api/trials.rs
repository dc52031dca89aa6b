use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::{
    Endpoint, ListResponse, Pagination,
    trial::{
        NewTrialMetadata, PROTECTED_FIELDS, TrialListItem, TrialMetadata, TrialMetadataPatch,
        TrialOrdinalColumn, TrialQuery, TrialSummary,
    },
    user::User,
};
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};
use serde_json::{Map, Value};

use super::{
    ADMIN_OR_NCI, ANY_ROLE,
    error::{Error, Result},
    handler::{ApiPath, ApiQuery, IfMatch, ValidJson, check_pagination},
};
use crate::{
    db::{
        self, FetchById, FetchByQuery, Write,
        model::{permission, trial},
    },
    document,
    server::{AppState, auth::Authenticated},
    sync,
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(&NewTrialMetadata::endpoint(), get(list).post(create))
        .route(&TrialMetadata::summaries_endpoint(), get(summaries))
        .route(&TrialMetadata::endpoint(), get(by_id).patch(update))
}

/// The trials `user` may list, `None` meaning all of them.
async fn visible_trial_ids(
    user: &User,
    db_conn: &mut AsyncPgConnection,
) -> db::error::Result<Option<Vec<String>>> {
    if user.sees_everything() {
        return Ok(None);
    }

    permission::visible_trial_ids(user.id, db_conn).await
}

async fn list(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(query), _): ApiQuery<TrialQuery>,
    WithRejection(Query(pagination), _): ApiQuery<Pagination<TrialOrdinalColumn>>,
) -> Result<Json<ListResponse<TrialListItem>>> {
    let user = auth.require(ANY_ROLE)?;
    check_pagination(&pagination)?;

    let mut db_conn = app_state.db_conn().await?;

    let filter = trial::TrialFilter {
        trial_ids: query.trial_ids.0,
        visible_to: visible_trial_ids(&user, &mut db_conn).await?,
    };
    let page = TrialMetadata::fetch_by_query(&filter, &pagination, &mut db_conn).await?;

    let counts = if query.include_counts {
        let trial_ids: Vec<String> = page.items.iter().map(|t| t.trial_id.clone()).collect();
        Some(trial::participant_sample_counts(&trial_ids, &mut db_conn).await?)
    } else {
        None
    };

    let items = page
        .items
        .into_iter()
        .map(|trial| {
            let trial_counts = counts
                .as_ref()
                .map(|c| c.get(&trial.trial_id).copied().unwrap_or_default());

            TrialListItem {
                num_participants: trial_counts.map(|(participants, _)| participants),
                num_samples: trial_counts.map(|(_, samples)| samples),
                trial: trial.pruned(),
            }
        })
        .collect();

    Ok(Json(ListResponse::new(items, page.meta.total)))
}

async fn create(
    auth: Authenticated,
    State(app_state): State<AppState>,
    ValidJson(new): ValidJson<NewTrialMetadata>,
) -> Result<Json<TrialMetadata>> {
    let user = auth.require(ADMIN_OR_NCI)?;
    tracing::info!(email = %user.email, trial_id = %new.trial_id, "creating trial");

    document::validate(&new.metadata_json)?;

    let mut db_conn = app_state.db_conn().await?;
    let created = db_conn
        .transaction::<_, Error, _>(|conn| {
            async move {
                let created = new.write(conn).await?;
                sync::sync_stored_trial(&created, conn).await?;

                Ok(created)
            }
            .scope_boxed()
        })
        .await?;

    Ok(Json(created))
}

async fn by_id(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(trial_id), _): ApiPath<String>,
) -> Result<Json<TrialMetadata>> {
    auth.require(ADMIN_OR_NCI)?;

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(TrialMetadata::fetch_by_id(&trial_id, &mut db_conn).await?))
}

/// The fields of `patch` that may be written: protected fields must be
/// unchanged and are dropped.
fn writable_fields(patch: TrialMetadataPatch, current: &Value) -> Result<Map<String, Value>> {
    let changed = patch.changed_protected_fields(current);
    if !changed.is_empty() {
        return Err(Error::bad_request(format!(
            "trial-level updates may not change {}",
            changed.join(", ")
        )));
    }

    Ok(patch
        .metadata_json
        .into_iter()
        .filter(|(key, _)| !PROTECTED_FIELDS.contains(&key.as_str()))
        .collect())
}

/// Apply `patch` to the trial under a row lock, so that the etag checked is
/// the one being replaced.
async fn update_locked(
    trial_id: &str,
    if_match: &IfMatch,
    patch: TrialMetadataPatch,
    db_conn: &mut AsyncPgConnection,
) -> Result<TrialMetadata> {
    let current = trial::fetch_for_update(trial_id, db_conn).await?;
    if_match.check(&current.etag)?;

    let fields = writable_fields(patch, &current.metadata_json)?;
    tracing::info!(
        %trial_id,
        fields = ?fields.keys().collect::<Vec<_>>(),
        "updating trial"
    );

    Ok(sync::update_trial_fields(trial_id, &fields, db_conn).await?)
}

async fn update(
    auth: Authenticated,
    State(app_state): State<AppState>,
    if_match: IfMatch,
    WithRejection(Path(trial_id), _): ApiPath<String>,
    WithRejection(Json(patch), _): WithRejection<Json<TrialMetadataPatch>, Error>,
) -> Result<Json<TrialMetadata>> {
    let user = auth.require(ADMIN_OR_NCI)?;
    tracing::info!(email = %user.email, %trial_id, "received trial update");

    let mut db_conn = app_state.db_conn().await?;
    let updated = db_conn
        .transaction::<_, Error, _>(|conn| {
            async move { update_locked(&trial_id, &if_match, patch, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(updated))
}

async fn summaries(
    auth: Authenticated,
    State(app_state): State<AppState>,
) -> Result<Json<Vec<TrialSummary>>> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let filter = trial::TrialFilter {
        trial_ids: Vec::new(),
        visible_to: visible_trial_ids(&user, &mut db_conn).await?,
    };

    Ok(Json(trial::summaries(&filter, &mut db_conn).await?))
}

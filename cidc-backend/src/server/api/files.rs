use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::{
    Endpoint, ListResponse, Pagination,
    downloadable_file::{
        DownloadUrlQuery, DownloadableFile, DownloadableFileResponse, FacetCount, FileOrdinalColumn,
        FileQuery, FilelistRequest, FilterFacets, NewDownloadableFile,
    },
    user::User,
};
use diesel_async::AsyncPgConnection;
use uuid::Uuid;

use super::{
    ADMIN, ANY_ROLE,
    error::{Error, Result},
    handler::{ApiPath, ApiQuery, ValidJson, check_pagination},
};
use crate::{
    db::{
        self, FetchById, FetchByQuery,
        model::{downloadable_file, downloadable_file::FileFilter, permission},
    },
    server::{AppState, auth, auth::Authenticated},
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(&NewDownloadableFile::endpoint(), get(list).post(register))
        .route(&DownloadableFile::filelist_endpoint(), post(filelist))
        .route(&DownloadableFile::download_url_endpoint(), get(download_url))
        .route(&DownloadableFile::filter_facets_endpoint(), get(filter_facets))
        .route(&DownloadableFile::related_files_endpoint(), get(related_files))
        .route(&DownloadableFile::endpoint(), get(by_id))
}

async fn file_filter(
    query: &FileQuery,
    user: &User,
    db_conn: &mut AsyncPgConnection,
) -> db::error::Result<FileFilter> {
    let permissions = if user.sees_everything() {
        Vec::new()
    } else {
        permission::find_for_user(user.id, db_conn).await?
    };

    Ok(FileFilter::new(query, user, &permissions))
}

fn check_permitted(filter: &FileFilter, file: &DownloadableFile, user: &User) -> Result<()> {
    if filter.permits(file) {
        return Ok(());
    }

    Err(auth::Error::Unauthorized {
        message: format!("{} may not access file {}", user.email, file.id),
    }
    .into())
}

async fn list(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(query), _): ApiQuery<FileQuery>,
    WithRejection(Query(pagination), _): ApiQuery<Pagination<FileOrdinalColumn>>,
) -> Result<Json<ListResponse<DownloadableFileResponse>>> {
    let user = auth.require(ANY_ROLE)?;
    check_pagination(&pagination)?;

    let mut db_conn = app_state.db_conn().await?;
    let filter = file_filter(&query, &user, &mut db_conn).await?;
    let page = DownloadableFile::fetch_by_query(&filter, &pagination, &mut db_conn).await?;

    let items = page.items.into_iter().map(Into::into).collect();

    Ok(Json(ListResponse::new(items, page.meta.total)))
}

async fn by_id(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(file_id), _): ApiPath<Uuid>,
) -> Result<Json<DownloadableFileResponse>> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let file = DownloadableFile::fetch_by_id(&file_id, &mut db_conn).await?;
    let filter = file_filter(&FileQuery::default(), &user, &mut db_conn).await?;
    check_permitted(&filter, &file, &user)?;

    Ok(Json(file.into()))
}

async fn related_files(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(file_id), _): ApiPath<Uuid>,
) -> Result<Json<Vec<DownloadableFileResponse>>> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let file = DownloadableFile::fetch_by_id(&file_id, &mut db_conn).await?;
    let filter = file_filter(&FileQuery::default(), &user, &mut db_conn).await?;
    check_permitted(&filter, &file, &user)?;

    let related = downloadable_file::related_files(&file, &filter, &mut db_conn).await?;

    Ok(Json(related.into_iter().map(Into::into).collect()))
}

async fn filelist(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Json(request), _): WithRejection<Json<FilelistRequest>, Error>,
) -> Result<impl IntoResponse> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let filter = file_filter(&FileQuery::default(), &user, &mut db_conn).await?;
    let files = downloadable_file::fetch_many(&request.file_ids, &filter, &mut db_conn).await?;

    if files.is_empty() {
        return Err(Error::NotFound {
            message: "none of the requested files exist or are accessible".to_string(),
        });
    }

    let bucket = app_state.storage().bucket();
    let tsv: String = files.iter().map(|f| f.filelist_line(bucket)).collect();

    Ok((
        [
            (CONTENT_TYPE, "text/tab-separated-values"),
            (CONTENT_DISPOSITION, "attachment; filename=\"filelist.tsv\""),
        ],
        tsv,
    ))
}

async fn download_url(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(DownloadUrlQuery { id }), _): ApiQuery<DownloadUrlQuery>,
) -> Result<Json<String>> {
    let user = auth.require(ANY_ROLE)?;

    if user.is_network_viewer() {
        return Err(auth::Error::Unauthorized {
            message: "network viewers may not download files".to_string(),
        }
        .into());
    }

    let mut db_conn = app_state.db_conn().await?;
    let file = DownloadableFile::fetch_by_id(&id, &mut db_conn).await?;
    let filter = file_filter(&FileQuery::default(), &user, &mut db_conn).await?;

    // a file the caller may not see is indistinguishable from a missing one
    if !filter.permits(&file) {
        return Err(db::error::Error::RecordNotFound.into());
    }

    let url = app_state
        .storage()
        .signed_download_url(&file.object_url)
        .await?;
    tracing::info!(email = %user.email, object_url = %file.object_url, "issued download URL");

    Ok(Json(url))
}

/// Split `filter` into the two filters facet counts are drawn from: trial
/// counts honor only the selected facets, and facet counts honor only the
/// selected trials. Each selection narrows the other side's counts but
/// never its own options.
fn facet_filters(filter: FileFilter) -> (FileFilter, FileFilter) {
    let by_facets = FileFilter {
        trial_ids: Vec::new(),
        ..filter.clone()
    };
    let by_trials = FileFilter {
        facets: Vec::new(),
        ..filter
    };

    (by_facets, by_trials)
}

/// Count `trial_rows` per trial and `facet_rows` per upload type and facet
/// group. Rows are `(trial_id, upload_type, facet_group)`.
fn count_facets(
    trial_rows: &[(String, String, String)],
    facet_rows: &[(String, String, String)],
) -> FilterFacets {
    let mut trials: BTreeMap<&str, i64> = BTreeMap::new();
    let mut groups: BTreeMap<&str, BTreeMap<&str, i64>> = BTreeMap::new();

    for (trial_id, _, _) in trial_rows {
        *trials.entry(trial_id).or_default() += 1;
    }
    for (_, upload_type, facet_group) in facet_rows {
        *groups
            .entry(upload_type)
            .or_default()
            .entry(facet_group)
            .or_default() += 1;
    }

    let counts = |m: BTreeMap<&str, i64>| -> Vec<FacetCount> {
        m.into_iter()
            .map(|(label, count)| FacetCount {
                label: label.to_string(),
                count,
            })
            .collect()
    };

    FilterFacets {
        trial_ids: counts(trials),
        facets: groups
            .into_iter()
            .map(|(upload_type, g)| (upload_type.to_string(), counts(g)))
            .collect(),
    }
}

async fn filter_facets(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(query), _): ApiQuery<FileQuery>,
) -> Result<Json<FilterFacets>> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let filter = file_filter(&query, &user, &mut db_conn).await?;
    let (by_facets, by_trials) = facet_filters(filter);

    let trial_rows = downloadable_file::facet_rows(&by_facets, &mut db_conn).await?;
    let facet_rows = downloadable_file::facet_rows(&by_trials, &mut db_conn).await?;

    Ok(Json(count_facets(&trial_rows, &facet_rows)))
}

async fn register(
    auth: Authenticated,
    State(app_state): State<AppState>,
    ValidJson(new): ValidJson<NewDownloadableFile>,
) -> Result<Json<DownloadableFileResponse>> {
    let admin = auth.require(ADMIN)?;

    let new = new.with_derived_fields();
    let mut db_conn = app_state.db_conn().await?;
    let file = downloadable_file::upsert(&new, &mut db_conn).await?;

    tracing::info!(admin = %admin.email, object_url = %file.object_url, "registered file");

    Ok(Json(file.into()))
}

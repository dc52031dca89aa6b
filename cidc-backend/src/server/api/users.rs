use axum::{
    Json, Router,
    extract::{Path, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::{
    Delimited, Endpoint, ListResponse, Pagination,
    user::{DataAccessRow, NewSelf, NewUser, User, UserOrdinalColumn, UserUpdate},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{
    ADMIN,
    error::{Error, Result},
    handler::{ApiPath, ApiQuery, IfMatch, ValidJson, check_pagination},
};
use crate::{
    access,
    db::{
        FetchById, FetchByQuery, Write,
        model::{trial, user},
    },
    server::{
        AppState,
        auth::{Authenticated, Email},
    },
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(&NewSelf::self_endpoint(), get(get_self).post(register_self))
        .route(&NewUser::endpoint(), get(list).post(create))
        .route(&User::data_access_report_endpoint(), get(data_access_report))
        .route(&User::endpoint(), get(by_id).patch(update))
}

async fn get_self(Authenticated(user): Authenticated) -> Json<User> {
    Json(user)
}

async fn register_self(
    Email(email): Email,
    State(app_state): State<AppState>,
    ValidJson(new_self): ValidJson<NewSelf>,
) -> Result<Json<User>> {
    tracing::info!(%email, "registering new user");

    if new_self.email != email {
        return Err(Error::bad_request(format!(
            "registration email {} does not match authenticated email {email}",
            new_self.email
        )));
    }

    let mut db_conn = app_state.db_conn().await?;
    let created = new_self.write(&mut db_conn).await?;

    Ok(Json(created))
}

async fn create(
    auth: Authenticated,
    State(app_state): State<AppState>,
    ValidJson(new_user): ValidJson<NewUser>,
) -> Result<Json<User>> {
    let admin = auth.require(ADMIN)?;
    tracing::info!(admin = %admin.email, email = %new_user.email, "creating user");

    let mut db_conn = app_state.db_conn().await?;
    let created = new_user.write(&mut db_conn).await?;

    Ok(Json(created))
}

async fn list(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(pagination), _): ApiQuery<Pagination<UserOrdinalColumn>>,
) -> Result<Json<ListResponse<User>>> {
    auth.require(ADMIN)?;
    check_pagination(&pagination)?;

    let mut db_conn = app_state.db_conn().await?;
    let users = User::fetch_by_query(&user::AllUsers, &pagination, &mut db_conn).await?;

    Ok(Json(users))
}

async fn by_id(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(user_id), _): ApiPath<Uuid>,
) -> Result<Json<User>> {
    auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(User::fetch_by_id(&user_id, &mut db_conn).await?))
}

async fn update(
    auth: Authenticated,
    State(app_state): State<AppState>,
    if_match: IfMatch,
    WithRejection(Path(user_id), _): ApiPath<Uuid>,
    ValidJson(update): ValidJson<UserUpdate>,
) -> Result<Json<User>> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let current = User::fetch_by_id(&user_id, &mut db_conn).await?;
    if_match.check(&current.etag)?;

    tracing::info!(admin = %admin.email, email = %current.email, ?update, "updating user");

    let updated = access::update_user(&current, update, app_state.storage(), &mut db_conn).await?;

    Ok(Json(updated))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ReportQuery {
    trial_ids: Delimited,
}

fn report_csv(rows: &[DataAccessRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(Error::internal)?;
    }

    writer.into_inner().map_err(Error::internal)
}

async fn data_access_report(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(query), _): ApiQuery<ReportQuery>,
) -> Result<impl IntoResponse> {
    auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;

    let trial_ids = if query.trial_ids.is_empty() {
        trial::all_trial_ids(&mut db_conn).await?
    } else {
        query.trial_ids.0
    };

    let rows = user::data_access_report(&trial_ids, &mut db_conn).await?;
    let csv = report_csv(&rows)?;

    Ok((
        [
            (CONTENT_TYPE, "text/csv"),
            (
                CONTENT_DISPOSITION,
                "attachment; filename=\"cidc_data_access_report.csv\"",
            ),
        ],
        csv,
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn report_has_header_and_rows() {
        let rows = [DataAccessRow {
            trial_id: "10021".to_string(),
            email: "a@example.com".to_string(),
            organization: "DFCI".to_string(),
            role: "cimac-user".to_string(),
            upload_types: "olink,wes_bam".to_string(),
        }];

        let csv = String::from_utf8(report_csv(&rows).unwrap()).unwrap();

        assert_eq!(
            csv,
            "trial_id,email,organization,role,upload_types\n10021,a@example.com,DFCI,cimac-user,\"olink,wes_bam\"\n"
        );
    }
}

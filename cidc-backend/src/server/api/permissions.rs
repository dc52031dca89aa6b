use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::{
    Endpoint, ListResponse, Pagination,
    permission::{NewPermission, Permission, PermissionOrdinalColumn, PermissionQuery},
    user::User,
};
use uuid::Uuid;

use super::{
    ADMIN, ANY_ROLE,
    error::Result,
    handler::{ApiPath, ApiQuery, IfMatch, ValidJson, check_pagination},
};
use crate::{
    access, db,
    db::{FetchById, FetchByQuery},
    server::{AppState, auth, auth::Authenticated},
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(&NewPermission::endpoint(), get(list).post(grant))
        .route(&Permission::endpoint(), get(by_id).delete(revoke))
}

/// Non-admins may only list their own permissions.
fn scoped_query(mut query: PermissionQuery, user: &User) -> std::result::Result<PermissionQuery, auth::Error> {
    if user.is_admin() {
        return Ok(query);
    }

    match query.user_id {
        Some(requested) if requested != user.id => Err(auth::Error::Unauthorized {
            message: format!("{} may not view other users' permissions", user.email),
        }),
        _ => {
            query.user_id = Some(user.id);
            Ok(query)
        }
    }
}

async fn list(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(query), _): ApiQuery<PermissionQuery>,
    WithRejection(Query(pagination), _): ApiQuery<Pagination<PermissionOrdinalColumn>>,
) -> Result<Json<ListResponse<Permission>>> {
    let user = auth.require(ANY_ROLE)?;
    check_pagination(&pagination)?;
    let query = scoped_query(query, &user)?;

    let mut db_conn = app_state.db_conn().await?;
    let permissions = Permission::fetch_by_query(&query, &pagination, &mut db_conn).await?;

    Ok(Json(permissions))
}

async fn by_id(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(permission_id), _): ApiPath<Uuid>,
) -> Result<Json<Permission>> {
    let user = auth.require(ANY_ROLE)?;

    let mut db_conn = app_state.db_conn().await?;
    let permission = Permission::fetch_by_id(&permission_id, &mut db_conn).await?;

    if !user.is_admin() && permission.granted_to_user != user.id {
        return Err(db::error::Error::RecordNotFound.into());
    }

    Ok(Json(permission))
}

async fn grant(
    auth: Authenticated,
    State(app_state): State<AppState>,
    ValidJson(new): ValidJson<NewPermission>,
) -> Result<Json<Permission>> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let granted = access::grant_permission(new, &admin, app_state.storage(), &mut db_conn).await?;

    Ok(Json(granted))
}

async fn revoke(
    auth: Authenticated,
    State(app_state): State<AppState>,
    if_match: IfMatch,
    WithRejection(Path(permission_id), _): ApiPath<Uuid>,
) -> Result<StatusCode> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let permission = Permission::fetch_by_id(&permission_id, &mut db_conn).await?;
    if_match.check(&permission.etag)?;

    access::revoke_permission(&permission, &admin, app_state.storage(), &mut db_conn).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use cidc_core::model::user::CidcRole;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn user(role: CidcRole) -> User {
        User {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: String::new(),
            accessed_at: Utc::now(),
            email: "someone@example.com".to_string(),
            contact_email: None,
            first_name: None,
            last_name: None,
            organization: None,
            approval_date: Some(Utc::now()),
            role: Some(role),
            disabled: false,
        }
    }

    #[test]
    fn non_admins_are_scoped_to_themselves() {
        let caller = user(CidcRole::CimacUser);

        let query = scoped_query(PermissionQuery::default(), &caller).unwrap();
        assert_eq!(query.user_id, Some(caller.id));

        let own = PermissionQuery {
            user_id: Some(caller.id),
        };
        assert_eq!(scoped_query(own, &caller).unwrap().user_id, Some(caller.id));
    }

    #[rstest]
    #[case(CidcRole::CimacUser, false)]
    #[case(CidcRole::CidcAdmin, true)]
    fn other_users_permissions(#[case] role: CidcRole, #[case] allowed: bool) {
        let other = Uuid::now_v7();
        let query = PermissionQuery {
            user_id: Some(other),
        };

        let scoped = scoped_query(query, &user(role));

        assert_eq!(scoped.is_ok(), allowed);
        if let Ok(query) = scoped {
            assert_eq!(query.user_id, Some(other));
        }
    }
}

use cidc_core::model::{
    ListResponse, Pagination,
    permission::{NewPermission, Permission, PermissionOrdinalColumn, PermissionQuery},
};
use cidc_schema::permissions;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::{
    db::{
        AsDieselFilter, FetchById, FetchByQuery, Write,
        error::Result,
        util::{BoxedDieselExpression, DieselExpressionBuilder, make_etag},
    },
    fetch_page,
};

impl Write for NewPermission {
    type Returns = Permission;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> Result<Self::Returns> {
        let etag = make_etag(&self);

        let inserted = diesel::insert_into(permissions::table)
            .values((&self, permissions::etag.eq(etag)))
            .returning(Permission::as_returning())
            .get_result(db_conn)
            .await?;

        Ok(inserted)
    }
}

impl FetchById for Permission {
    type Id = Uuid;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> Result<Self> {
        Ok(permissions::table
            .find(id)
            .select(Permission::as_select())
            .first(db_conn)
            .await?)
    }
}

impl AsDieselFilter<permissions::table> for PermissionQuery {
    fn as_diesel_filter<'a>(&'a self) -> Option<BoxedDieselExpression<'a, permissions::table>>
    where
        permissions::table: 'a,
    {
        let mut query = DieselExpressionBuilder::default();

        if let Some(user_id) = self.user_id {
            query = query.and_condition(permissions::granted_to_user.eq(user_id));
        }

        query.build()
    }
}

impl FetchByQuery for Permission {
    type QueryParams = PermissionQuery;
    type OrdinalColumn = PermissionOrdinalColumn;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> Result<ListResponse<Self>> {
        use PermissionOrdinalColumn::{CreatedAt, TrialId, UploadType};

        fetch_page!(
            permissions,
            Permission,
            query,
            pagination,
            permissions::created_at.asc(),
            [
                (CreatedAt, permissions::created_at),
                (TrialId, permissions::trial_id),
                (UploadType, permissions::upload_type)
            ],
            db_conn
        )
    }
}

/// # Errors
pub async fn find_for_user(
    user_id: Uuid,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<Permission>> {
    Ok(permissions::table
        .filter(permissions::granted_to_user.eq(user_id))
        .select(Permission::as_select())
        .order_by(permissions::created_at)
        .load(db_conn)
        .await?)
}

/// The permission that gives `user_id` access to `upload_type` files in
/// `trial_id`: an exact grant, a cross-trial grant for the type, or a
/// cross-type grant for the trial.
///
/// # Errors
pub async fn find_for_user_trial_type(
    user_id: Uuid,
    trial_id: &str,
    upload_type: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<Option<Permission>> {
    let exact = permissions::trial_id
        .eq(trial_id)
        .and(permissions::upload_type.eq(upload_type));
    let cross_trial = permissions::trial_id
        .is_null()
        .and(permissions::upload_type.eq(upload_type));
    let cross_type = permissions::trial_id
        .eq(trial_id)
        .and(permissions::upload_type.is_null());

    Ok(permissions::table
        .filter(permissions::granted_to_user.eq(user_id))
        .filter(exact.or(cross_trial).or(cross_type))
        .select(Permission::as_select())
        .first(db_conn)
        .await
        .optional()?)
}

/// Delete the grantee's permissions that `new` makes redundant, returning
/// them so storage access can be revoked or the deletion undone.
///
/// # Errors
pub async fn delete_redundant(
    new: &NewPermission,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<Permission>> {
    let owned_by_grantee = permissions::granted_to_user.eq(new.granted_to_user);

    let deleted = match new.scope() {
        (None, Some(upload_type)) => {
            diesel::delete(
                permissions::table
                    .filter(owned_by_grantee)
                    .filter(permissions::upload_type.eq(upload_type))
                    .filter(permissions::trial_id.is_not_null()),
            )
            .returning(Permission::as_returning())
            .get_results(db_conn)
            .await?
        }
        (Some(trial_id), None) => {
            diesel::delete(
                permissions::table
                    .filter(owned_by_grantee)
                    .filter(permissions::trial_id.eq(trial_id))
                    .filter(permissions::upload_type.is_not_null()),
            )
            .returning(Permission::as_returning())
            .get_results(db_conn)
            .await?
        }
        _ => Vec::new(),
    };

    Ok(deleted)
}

/// Restore permissions removed by [`delete_redundant`], keeping their ids.
///
/// # Errors
pub async fn reinsert(perms: &[Permission], db_conn: &mut AsyncPgConnection) -> Result<()> {
    for perm in perms {
        diesel::insert_into(permissions::table)
            .values((
                permissions::id.eq(perm.id),
                permissions::etag.eq(&perm.etag),
                permissions::granted_to_user.eq(perm.granted_to_user),
                permissions::granted_by_user.eq(perm.granted_by_user),
                permissions::trial_id.eq(&perm.trial_id),
                permissions::upload_type.eq(&perm.upload_type),
            ))
            .execute(db_conn)
            .await?;
    }

    Ok(())
}

/// # Errors
pub async fn delete(id: Uuid, db_conn: &mut AsyncPgConnection) -> Result<Permission> {
    Ok(diesel::delete(permissions::table.find(id))
        .returning(Permission::as_returning())
        .get_result(db_conn)
        .await?)
}

/// The trials `user_id` holds permissions on. `None` means the user holds a
/// cross-trial permission and may see every trial.
///
/// # Errors
pub async fn visible_trial_ids(
    user_id: Uuid,
    db_conn: &mut AsyncPgConnection,
) -> Result<Option<Vec<String>>> {
    let trial_ids: Vec<Option<String>> = permissions::table
        .filter(permissions::granted_to_user.eq(user_id))
        .select(permissions::trial_id)
        .load(db_conn)
        .await?;

    if trial_ids.iter().any(Option::is_none) {
        return Ok(None);
    }

    Ok(Some(trial_ids.into_iter().flatten().collect()))
}

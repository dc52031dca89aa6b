use chrono::{Duration, Utc};
use cidc_core::model::{
    ListResponse, Pagination,
    user::{CidcRole, DataAccessRow, NewSelf, NewUser, User, UserOrdinalColumn, UserUpdate},
};
use cidc_schema::{permissions, users};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use itertools::Itertools;
use uuid::Uuid;

use crate::{
    config::INACTIVE_USER_DAYS,
    db::{
        AsDieselFilter, FetchById, FetchByQuery, Write,
        error::Result,
        util::{BoxedDieselExpression, make_etag},
    },
    fetch_page,
};

impl Write for NewUser {
    type Returns = User;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> Result<Self::Returns> {
        let etag = make_etag(&self);

        let inserted = diesel::insert_into(users::table)
            .values((&self, users::etag.eq(etag)))
            .returning(User::as_returning())
            .get_result(db_conn)
            .await?;

        Ok(inserted)
    }
}

impl Write for NewSelf {
    type Returns = User;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> Result<Self::Returns> {
        let etag = make_etag(&self);

        let inserted = diesel::insert_into(users::table)
            .values((&self, users::etag.eq(etag)))
            .returning(User::as_returning())
            .get_result(db_conn)
            .await?;

        Ok(inserted)
    }
}

impl FetchById for User {
    type Id = Uuid;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> Result<Self> {
        Ok(users::table
            .find(id)
            .select(User::as_select())
            .first(db_conn)
            .await?)
    }
}

/// Users are listed unfiltered; only the page and order vary.
pub struct AllUsers;

impl AsDieselFilter<users::table> for AllUsers {
    fn as_diesel_filter<'a>(&'a self) -> Option<BoxedDieselExpression<'a, users::table>>
    where
        users::table: 'a,
    {
        None
    }
}

impl FetchByQuery for User {
    type QueryParams = AllUsers;
    type OrdinalColumn = UserOrdinalColumn;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> Result<ListResponse<Self>> {
        use UserOrdinalColumn::{AccessedAt, CreatedAt, Email, LastName, Role};

        fetch_page!(
            users,
            User,
            query,
            pagination,
            users::email.asc(),
            [
                (Email, users::email),
                (CreatedAt, users::created_at),
                (AccessedAt, users::accessed_at),
                (LastName, users::last_name),
                (Role, users::role)
            ],
            db_conn
        )
    }
}

/// # Errors
pub async fn fetch_by_email(email: &str, db_conn: &mut AsyncPgConnection) -> Result<Option<User>> {
    Ok(users::table
        .filter(users::email.eq(email))
        .select(User::as_select())
        .first(db_conn)
        .await
        .optional()?)
}

/// Apply `update` to `current`, maintaining the fields that follow from a
/// change of role or disabled state.
///
/// # Errors
pub async fn update(
    current: &User,
    mut update: UserUpdate,
    db_conn: &mut AsyncPgConnection,
) -> Result<User> {
    if current.role.is_none() && update.role.is_some() {
        update.approval_date = Some(Utc::now());
    }

    if current.disabled && update.disabled == Some(false) {
        update.accessed_at = Some(Utc::now());
    }

    let etag = make_etag(&(current, &update));

    Ok(diesel::update(users::table.find(current.id))
        .set((&update, users::etag.eq(etag)))
        .returning(User::as_returning())
        .get_result(db_conn)
        .await?)
}

/// Record that `user` made a request, at most once per day.
///
/// # Errors
pub async fn update_accessed(user: &mut User, db_conn: &mut AsyncPgConnection) -> Result<()> {
    let now = Utc::now();
    if now - user.accessed_at < Duration::days(1) {
        return Ok(());
    }

    diesel::update(users::table.find(user.id))
        .set(users::accessed_at.eq(now))
        .execute(db_conn)
        .await?;
    user.accessed_at = now;

    Ok(())
}

/// Enabled users whose last access is older than [`INACTIVE_USER_DAYS`].
///
/// # Errors
pub async fn fetch_inactive(db_conn: &mut AsyncPgConnection) -> Result<Vec<User>> {
    let cutoff = Utc::now() - Duration::days(INACTIVE_USER_DAYS);

    Ok(users::table
        .filter(users::accessed_at.lt(cutoff))
        .filter(users::disabled.eq(false))
        .select(User::as_select())
        .load(db_conn)
        .await?)
}

/// Disable the users in `ids`, returning those that were enabled until now.
///
/// # Errors
pub async fn disable_all(ids: &[Uuid], db_conn: &mut AsyncPgConnection) -> Result<Vec<User>> {
    Ok(diesel::update(
        users::table
            .filter(users::id.eq_any(ids))
            .filter(users::disabled.eq(false)),
    )
    .set(users::disabled.eq(true))
    .returning(User::as_returning())
    .get_results(db_conn)
    .await?)
}

/// Enabled users whose access comes from permissions rather than their role.
///
/// # Errors
pub async fn fetch_permission_holders(db_conn: &mut AsyncPgConnection) -> Result<Vec<User>> {
    let sees_everything: Vec<&'static str> = [CidcRole::CidcAdmin, CidcRole::NciBiobankUser]
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(users::table
        .filter(users::disabled.eq(false))
        .filter(
            users::role
                .is_null()
                .or(users::role.ne_all(sees_everything)),
        )
        .filter(users::id.eq_any(permissions::table.select(permissions::granted_to_user)))
        .select(User::as_select())
        .load(db_conn)
        .await?)
}

/// One row per (trial, user) listing the upload types the user can access.
/// Admins and NCI users are listed under every trial with `*`.
///
/// # Errors
pub async fn data_access_report(
    trial_ids: &[String],
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<DataAccessRow>> {
    let all_users: Vec<User> = users::table
        .filter(users::disabled.eq(false))
        .select(User::as_select())
        .order_by(users::email)
        .load(db_conn)
        .await?;

    let grants: Vec<(Uuid, Option<String>, Option<String>)> = permissions::table
        .select((
            permissions::granted_to_user,
            permissions::trial_id,
            permissions::upload_type,
        ))
        .load(db_conn)
        .await?;
    let grants = grants.into_iter().into_group_map_by(|(user_id, ..)| *user_id);

    let mut rows = Vec::new();
    for trial_id in trial_ids {
        for user in &all_users {
            let upload_types = if user.sees_everything() {
                "*".to_string()
            } else {
                let Some(user_grants) = grants.get(&user.id) else {
                    continue;
                };

                let types: Vec<&str> = user_grants
                    .iter()
                    .filter(|(_, t, _)| t.as_deref().is_none_or(|t| t == trial_id))
                    .map(|(_, _, u)| u.as_deref().unwrap_or("*"))
                    .unique()
                    .collect();

                if types.is_empty() {
                    continue;
                }
                if types.contains(&"*") {
                    "*".to_string()
                } else {
                    types.join(",")
                }
            };

            rows.push(DataAccessRow {
                trial_id: trial_id.clone(),
                email: user.email.clone(),
                organization: user.organization.map(|o| o.to_string()).unwrap_or_default(),
                role: user.role.map(|r| r.to_string()).unwrap_or_default(),
                upload_types,
            });
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use cidc_core::model::user::{CidcRole, NewUser, Organization, UserUpdate};
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::{
        self,
        test_util::{DbConnection, db_conn},
    };

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            contact_email: None,
            first_name: Some("Test".to_string()),
            last_name: Some("User".to_string()),
            organization: Some(Organization::Dfci),
            role: None,
            approval_date: None,
            disabled: false,
        }
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn first_role_approves_user(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    let user = new_user("approve-me@example.com").write(conn).await?;
                    assert!(user.approval_date.is_none());

                    let updated = update(
                        &user,
                        UserUpdate {
                            role: Some(CidcRole::CimacUser),
                            ..Default::default()
                        },
                        conn,
                    )
                    .await?;

                    assert_eq!(updated.role, Some(CidcRole::CimacUser));
                    assert!(updated.approval_date.is_some());
                    assert_ne!(updated.etag, user.etag);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn duplicate_email_is_reported(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    new_user("twice@example.com").write(conn).await?;
                    let err = new_user("twice@example.com").write(conn).await.unwrap_err();

                    assert!(matches!(
                        err,
                        db::error::Error::DuplicateRecord { ref field, .. } if field.as_deref() == Some("email")
                    ));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

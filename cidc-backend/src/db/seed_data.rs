use chrono::Utc;
use cidc_core::model::user::{CidcRole, NewUser, Organization, User};
use diesel_async::AsyncPgConnection;

use super::{Write, error::Result, model::user::fetch_by_email};

/// The admin that dev mode authenticates every request as, unless a seed
/// admin email is configured.
pub const DEV_ADMIN_EMAIL: &str = "dev-admin@cidc.local";

fn new_admin(email: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        contact_email: None,
        first_name: Some("CIDC".to_string()),
        last_name: Some("Admin".to_string()),
        organization: Some(Organization::Cidc),
        role: Some(CidcRole::CidcAdmin),
        approval_date: Some(Utc::now()),
        disabled: false,
    }
}

/// Make sure an approved admin with `email` exists, returning it. An
/// existing user with that email is returned as is.
///
/// # Errors
pub async fn seed_admin(email: &str, db_conn: &mut AsyncPgConnection) -> Result<User> {
    if let Some(existing) = fetch_by_email(email, db_conn).await? {
        return Ok(existing);
    }

    let admin = new_admin(email).write(db_conn).await?;
    tracing::info!(email, "seeded admin user");

    Ok(admin)
}

#[cfg(test)]
mod tests {
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::{
        self,
        test_util::{DbConnection, db_conn},
    };

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn seeding_is_idempotent(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    let first = seed_admin("seeded@example.com", conn).await?;
                    let second = seed_admin("seeded@example.com", conn).await?;

                    assert_eq!(first.id, second.id);
                    assert!(second.is_admin());
                    assert!(second.approval_date.is_some());

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

//! Keeps users' data bucket bindings in step with their permissions.
//!
//! Database changes commit before the bucket policy is touched. When the
//! policy update fails, the committed changes are undone. Disabling
//! inactive users goes the other way round: access is revoked first.

use cidc_core::model::{
    permission::{NewPermission, Permission},
    upload_type,
    user::{User, UserUpdate},
};
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};

use crate::{
    db::{
        self, FetchById, Write,
        model::{permission, user},
    },
    storage::{self, Storage},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] db::error::Error),
    #[error(transparent)]
    Storage(#[from] storage::Error),
    #[error("{message}")]
    Invalid { message: String },
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Self::Db(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Give `user` lister access and download access for each of `permissions`.
async fn grant_bindings(user: &User, permissions: &[Permission], storage: &Storage) -> storage::Result<()> {
    storage.grant_lister_access(&user.email).await?;
    for perm in permissions {
        storage
            .grant_download_access(&user.email, perm.trial_id.as_deref(), perm.upload_type.as_deref())
            .await?;
    }

    Ok(())
}

async fn sync_new_grant(
    grantee: &User,
    granted: &Permission,
    superseded: &[Permission],
    storage: &Storage,
) -> storage::Result<()> {
    grant_bindings(grantee, std::slice::from_ref(granted), storage).await?;

    for perm in superseded {
        storage
            .revoke_download_access(
                &grantee.email,
                perm.trial_id.as_deref(),
                perm.upload_type.as_deref(),
            )
            .await?;
    }

    Ok(())
}

fn check_upload_type(new: &NewPermission) -> Result<()> {
    match &new.upload_type {
        Some(upload_type) if !upload_type::is_known(upload_type) => Err(Error::Invalid {
            message: format!("cannot grant permission on unknown upload type {upload_type}"),
        }),
        _ => Ok(()),
    }
}

/// Record a permission granted by `granter` and give the grantee the
/// matching bucket access. Narrower permissions of the grantee that the new
/// one covers are deleted.
///
/// # Errors
/// [`Error::Invalid`] for an unknown upload type, and [`Error::Storage`]
/// after the database changes have been undone when the bucket policy could
/// not be updated.
pub async fn grant_permission(
    mut new: NewPermission,
    granter: &User,
    storage: &Storage,
    db_conn: &mut AsyncPgConnection,
) -> Result<Permission> {
    check_upload_type(&new)?;
    new.granted_by_user = Some(granter.id);

    let (grantee, granted, superseded) = db_conn
        .transaction::<_, db::error::Error, _>(|conn| {
            async move {
                let grantee = User::fetch_by_id(&new.granted_to_user, conn).await?;
                let superseded = permission::delete_redundant(&new, conn).await?;
                let granted = new.write(conn).await?;

                Ok((grantee, granted, superseded))
            }
            .scope_boxed()
        })
        .await?;

    tracing::info!(
        admin_action = "grant permission",
        granter = %granter.email,
        grantee = %grantee.email,
        trial_id = granted.trial_id.as_deref(),
        upload_type = granted.upload_type.as_deref(),
        n_superseded = superseded.len(),
        "admin-action"
    );

    if grantee.is_network_viewer() {
        return Ok(granted);
    }

    if let Err(e) = sync_new_grant(&grantee, &granted, &superseded, storage).await {
        tracing::error!(error = %e, permission_id = %granted.id, "failed to grant bucket access, undoing permission");

        let granted_id = granted.id;
        db_conn
            .transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    permission::reinsert(&superseded, conn).await?;
                    permission::delete(granted_id, conn).await?;

                    Ok(())
                }
                .scope_boxed()
            })
            .await?;

        return Err(e.into());
    }

    Ok(granted)
}

/// Remove `perm` and the bucket access it gave. The grantee loses lister
/// access along with their last permission.
///
/// # Errors
pub async fn revoke_permission(
    perm: &Permission,
    revoker: &User,
    storage: &Storage,
    db_conn: &mut AsyncPgConnection,
) -> Result<()> {
    let grantee = User::fetch_by_id(&perm.granted_to_user, db_conn).await?;

    if !grantee.is_network_viewer() {
        storage
            .revoke_download_access(
                &grantee.email,
                perm.trial_id.as_deref(),
                perm.upload_type.as_deref(),
            )
            .await?;

        let remaining = permission::find_for_user(grantee.id, db_conn).await?;
        if remaining.iter().all(|p| p.id == perm.id) {
            storage.revoke_lister_access(&grantee.email).await?;
        }
    }

    permission::delete(perm.id, db_conn).await?;

    tracing::info!(
        admin_action = "revoke permission",
        revoker = %revoker.email,
        grantee = %grantee.email,
        trial_id = perm.trial_id.as_deref(),
        upload_type = perm.upload_type.as_deref(),
        "admin-action"
    );

    Ok(())
}

/// Update `current`, revoking all of their download access when they are
/// disabled and restoring it when they are re-enabled.
///
/// # Errors
pub async fn update_user(
    current: &User,
    update: UserUpdate,
    storage: &Storage,
    db_conn: &mut AsyncPgConnection,
) -> Result<User> {
    let disabling = !current.disabled && update.disabled == Some(true);
    let enabling = current.disabled && update.disabled == Some(false);

    let updated = user::update(current, update, db_conn).await?;

    if disabling {
        storage.revoke_all_download_access(&updated.email).await?;
    } else if enabling && !updated.is_network_viewer() {
        let permissions = permission::find_for_user(updated.id, db_conn).await?;
        grant_bindings(&updated, &permissions, storage).await?;
    }

    Ok(updated)
}

/// Revoke the download access of users who have not made a request for
/// [`INACTIVE_USER_DAYS`](crate::config::INACTIVE_USER_DAYS), then disable
/// them. A user whose revoke fails stays enabled, so the next run retries
/// them. Returns the disabled users' emails.
///
/// # Errors
pub async fn disable_inactive_users(
    storage: &Storage,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<String>> {
    let inactive = user::fetch_inactive(db_conn).await?;

    let mut revoked = Vec::with_capacity(inactive.len());
    for user in &inactive {
        tracing::info!(email = %user.email, "disabling inactive user");
        match storage.revoke_all_download_access(&user.email).await {
            Ok(()) => revoked.push(user.id),
            Err(e) => {
                tracing::error!(email = %user.email, error = %e, "failed to revoke access of inactive user");
            }
        }
    }

    let disabled = user::disable_all(&revoked, db_conn).await?;
    if disabled.len() < inactive.len() {
        tracing::warn!(
            n_inactive = inactive.len(),
            n_disabled = disabled.len(),
            "some inactive users were left enabled"
        );
    }

    Ok(disabled.into_iter().map(|u| u.email).collect())
}

/// Re-grant every permission-holding user's bucket access, pushing its
/// expiry forward.
///
/// # Errors
pub async fn refresh_download_permissions(
    storage: &Storage,
    db_conn: &mut AsyncPgConnection,
) -> Result<usize> {
    let holders = user::fetch_permission_holders(db_conn).await?;

    let mut n_refreshed = 0;
    for holder in holders.iter().filter(|u| !u.is_network_viewer()) {
        let permissions = permission::find_for_user(holder.id, db_conn).await?;
        grant_bindings(holder, &permissions, storage).await?;
        n_refreshed += 1;
    }

    tracing::info!(n_refreshed, "refreshed download permissions");

    Ok(n_refreshed)
}

//! Keeps the relational tables of each trial equal to its JSON document.

use std::collections::HashSet;

use chrono::Utc;
use cidc_core::model::trial::TrialMetadata;
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};
use serde_json::{Map, Value};

use crate::{
    db::{
        self, FetchById,
        model::{downloadable_file, trial, upload_job},
    },
    document,
};

pub mod mapping;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] db::error::Error),
    #[error(transparent)]
    Document(#[from] document::Error),
    #[error("{message}")]
    Mapping { message: String },
    #[error("sync rolled back with {} errors", .0.len())]
    RolledBack(Vec<String>),
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Self::Db(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rebuild the relational mirror of `trial_id` from `document`: the trial's
/// rows are replaced, its derived files upserted and files derived from a
/// previous version of the document that no longer appear are deleted.
///
/// # Errors
pub async fn sync_trial(
    trial_id: &str,
    document: &Value,
    db_conn: &mut AsyncPgConnection,
) -> Result<()> {
    let parsed = document::validate(document)?;
    if parsed.protocol_identifier != trial_id {
        return Err(Error::Mapping {
            message: format!(
                "document of trial {trial_id} has protocol_identifier {}",
                parsed.protocol_identifier
            ),
        });
    }

    let manifest_jobs = upload_job::manifest_jobs_for_trial(trial_id, db_conn).await?;
    let mapping::Mirror { relational, files } =
        mapping::mirror(&parsed, &manifest_jobs, Utc::now())?;

    let previously_linked = downloadable_file::linked_object_urls(trial_id, db_conn).await?;

    relational.write(db_conn).await?;

    for file in &files {
        downloadable_file::upsert(file, db_conn).await?;
    }

    let current: HashSet<&str> = files.iter().map(|f| f.object_url.as_str()).collect();
    let stale: Vec<String> = previously_linked
        .into_iter()
        .filter(|url| !current.contains(url.as_str()))
        .collect();
    if !stale.is_empty() {
        let n_deleted = downloadable_file::delete_by_object_urls(&stale, db_conn).await?;
        tracing::info!(trial_id, n_deleted, "deleted files no longer in document");
    }

    tracing::debug!(
        trial_id,
        n_samples = relational.samples.len(),
        n_files = files.len(),
        "synced trial"
    );

    Ok(())
}

/// [`sync_trial`] for a stored trial.
///
/// # Errors
pub async fn sync_stored_trial(trial: &TrialMetadata, db_conn: &mut AsyncPgConnection) -> Result<()> {
    sync_trial(&trial.trial_id, &trial.metadata_json, db_conn).await
}

/// Merge `patch` into the stored document of `trial_id` under a row lock,
/// validate the result, store it and rebuild the relational mirror.
///
/// # Errors
/// [`document::Error::MergeConflict`] when the patch contradicts the stored
/// document, or any validation or database failure.
pub async fn patch_document(
    trial_id: &str,
    patch: &Value,
    db_conn: &mut AsyncPgConnection,
) -> Result<TrialMetadata> {
    let stored = trial::fetch_for_update(trial_id, db_conn).await?;

    let merged = document::merge_patch(&stored.metadata_json, patch)?;
    document::validate(&merged)?;

    let updated = trial::update_document(trial_id, &merged, db_conn).await?;
    sync_trial(trial_id, &merged, db_conn).await?;

    Ok(updated)
}

/// Replace top-level fields of the stored document of `trial_id` under a row
/// lock. Callers keep protected fields out of `fields`.
///
/// # Errors
pub async fn update_trial_fields(
    trial_id: &str,
    fields: &Map<String, Value>,
    db_conn: &mut AsyncPgConnection,
) -> Result<TrialMetadata> {
    let stored = trial::fetch_for_update(trial_id, db_conn).await?;

    let mut updated = stored.metadata_json;
    let Value::Object(top_level) = &mut updated else {
        return Err(document::Error::Malformed {
            message: format!("stored document of trial {trial_id} is not an object"),
        }
        .into());
    };
    for (key, value) in fields {
        top_level.insert(key.clone(), value.clone());
    }
    document::validate(&updated)?;

    let stored = trial::update_document(trial_id, &updated, db_conn).await?;
    sync_trial(trial_id, &updated, db_conn).await?;

    Ok(stored)
}

/// Sync every trial in a single transaction. Each trial is synced inside its
/// own savepoint so that one failure does not hide the others. The
/// transaction is rolled back if any trial failed or `dry_run` is set.
///
/// Returns one message per failed trial.
///
/// # Errors
/// Only for failures outside a single trial's sync.
pub async fn syncall_from_blobs(
    dry_run: bool,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<String>> {
    let result = db_conn
        .transaction::<_, Error, _>(|conn| {
            async move {
                let mut errors = Vec::new();

                for trial_id in trial::all_trial_ids(conn).await? {
                    let stored = TrialMetadata::fetch_by_id(&trial_id, conn).await?;

                    let synced = conn
                        .transaction::<_, Error, _>(|conn| {
                            async move { sync_stored_trial(&stored, conn).await }.scope_boxed()
                        })
                        .await;

                    if let Err(e) = synced {
                        tracing::error!(trial_id = %trial_id, error = %e, "failed to sync trial");
                        errors.push(format!("{trial_id}: {e}"));
                    }
                }

                if dry_run || !errors.is_empty() {
                    return Err(Error::RolledBack(errors));
                }

                Ok(errors)
            }
            .scope_boxed()
        })
        .await;

    match result {
        Ok(errors) | Err(Error::RolledBack(errors)) => Ok(errors),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use cidc_core::model::{
        downloadable_file::DownloadableFile,
        trial::NewTrialMetadata,
    };
    use cidc_schema::{downloadable_files, samples, uploads};
    use diesel::prelude::*;
    use diesel_async::RunQueryDsl;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::db::{
        Write,
        test_util::{DbConnection, db_conn, trial_document},
    };

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn resync_follows_document(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let trial = NewTrialMetadata {
                        trial_id: "test-sync".to_string(),
                        metadata_json: trial_document("test-sync"),
                    }
                    .write(conn)
                    .await?;
                    sync_stored_trial(&trial, conn).await?;

                    let n_samples: i64 = samples::table
                        .filter(samples::trial_id.eq("test-sync"))
                        .count()
                        .get_result(conn)
                        .await?;
                    assert_eq!(n_samples, 2);

                    let mut document = trial.metadata_json.clone();
                    document["assays"]["wes_fastq"][0]["records"]
                        .as_array_mut()
                        .unwrap()
                        .pop();
                    document["participants"][1]["samples"] = json!([]);
                    sync_trial("test-sync", &document, conn).await?;

                    let n_samples: i64 = samples::table
                        .filter(samples::trial_id.eq("test-sync"))
                        .count()
                        .get_result(conn)
                        .await?;
                    assert_eq!(n_samples, 1);

                    let files: Vec<DownloadableFile> = downloadable_files::table
                        .filter(downloadable_files::trial_id.eq("test-sync"))
                        .select(DownloadableFile::as_select())
                        .load(conn)
                        .await?;
                    assert_eq!(files.len(), 1);
                    assert!(files[0].upload_id.is_some());

                    let n_uploads: i64 = uploads::table
                        .filter(uploads::trial_id.eq("test-sync"))
                        .count()
                        .get_result(conn)
                        .await?;
                    assert_eq!(n_uploads, 1);

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
    async fn patch_adds_cohort_and_rejects_conflicts(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let trial = NewTrialMetadata {
                        trial_id: "test-patch".to_string(),
                        metadata_json: trial_document("test-patch"),
                    }
                    .write(conn)
                    .await?;
                    sync_stored_trial(&trial, conn).await?;

                    let updated = patch_document(
                        "test-patch",
                        &json!({"allowed_cohort_names": ["Arm_C"]}),
                        conn,
                    )
                    .await?;
                    assert_ne!(updated.etag, trial.etag);
                    assert!(
                        updated.metadata_json["allowed_cohort_names"]
                            .as_array()
                            .unwrap()
                            .contains(&json!("Arm_C"))
                    );

                    let conflict = patch_document(
                        "test-patch",
                        &json!({"protocol_identifier": "someone-else"}),
                        conn,
                    )
                    .await;
                    assert!(matches!(
                        conflict,
                        Err(Error::Document(document::Error::MergeConflict { .. }))
                    ));

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
    async fn mismatched_protocol_identifier_is_rejected(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let result = sync_trial("test-other", &trial_document("test-sync-2"), conn).await;
                    assert!(matches!(result, Err(Error::Mapping { .. })));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

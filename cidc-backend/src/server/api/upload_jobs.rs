use std::collections::HashSet;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_extra::extract::{Query, WithRejection};
use cidc_core::model::{
    Endpoint, ListResponse, Pagination,
    upload_job::{
        GcsFileMap, NewUploadJob, UploadJob, UploadJobOrdinalColumn, UploadJobStatus,
        UploadJobUpdate, UploadToken,
    },
    upload_type,
    user::User,
};
use diesel_async::{AsyncConnection, AsyncPgConnection, scoped_futures::ScopedFutureExt};
use serde_json::Value;
use uuid::Uuid;

use super::{
    ADMIN, UPLOADERS,
    error::{Error, Result},
    handler::{ApiPath, ApiQuery, IfMatch, ValidJson, check_pagination},
};
use crate::{
    db::{
        self, FetchById, FetchByQuery,
        model::{permission, upload_job},
    },
    server::{AppState, auth, auth::Authenticated},
    sync,
};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(&NewUploadJob::endpoint(), get(list).post(create))
        .route(&UploadJob::endpoint(), get(by_id).patch(update))
        .route(&UploadJob::merge_endpoint(), post(merge))
}

/// Non-admins see only their own jobs, as if the others did not exist.
fn check_visible(job: &UploadJob, user: &User) -> Result<()> {
    if user.is_admin() || job.uploader_email == user.email {
        return Ok(());
    }

    Err(db::error::Error::RecordNotFound.into())
}

async fn list(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Query(pagination), _): ApiQuery<Pagination<UploadJobOrdinalColumn>>,
) -> Result<Json<ListResponse<UploadJob>>> {
    let user = auth.require(UPLOADERS)?;
    check_pagination(&pagination)?;

    let filter = upload_job::UploadJobFilter {
        uploader_email: (!user.is_admin()).then_some(user.email),
    };

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(
        UploadJob::fetch_by_query(&filter, &pagination, &mut db_conn).await?,
    ))
}

async fn by_id(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(job_id), _): ApiPath<Uuid>,
) -> Result<Json<UploadJob>> {
    let user = auth.require(UPLOADERS)?;

    let mut db_conn = app_state.db_conn().await?;
    let job = UploadJob::fetch_by_id(&job_id, &mut db_conn).await?;
    check_visible(&job, &user)?;

    Ok(Json(job))
}

async fn create(
    auth: Authenticated,
    State(app_state): State<AppState>,
    ValidJson(new): ValidJson<NewUploadJob>,
) -> Result<Json<UploadJob>> {
    let user = auth.require(UPLOADERS)?;

    if !upload_type::is_known(&new.upload_type) {
        return Err(Error::bad_request(format!(
            "unknown upload type {}",
            new.upload_type
        )));
    }

    let mut db_conn = app_state.db_conn().await?;

    if !user.is_admin() {
        let covering =
            permission::find_for_user_trial_type(user.id, &new.trial_id, &new.upload_type, &mut db_conn)
                .await?;
        if covering.is_none() {
            return Err(Error::permission(format!(
                "{} may not upload {} data to trial {}",
                user.email, new.upload_type, new.trial_id
            )));
        }
    }

    let job = upload_job::create(&new, &user.email, UploadJobStatus::Started, &mut db_conn).await?;
    tracing::info!(
        job_id = %job.id,
        email = %user.email,
        trial_id = %job.trial_id,
        upload_type = %job.upload_type,
        "started upload job"
    );

    Ok(Json(job))
}

fn fills_placeholder(value: &Value, placeholders: &HashSet<&str>) -> bool {
    value
        .get("upload_placeholder")
        .and_then(Value::as_str)
        .is_some_and(|p| placeholders.contains(p))
}

/// Remove every object in `patch` that fills one of `placeholders`, whether
/// it sits in an array or under a key, along with any container left empty
/// by the removal. Returns whether `patch` itself was emptied.
fn drop_placeholders(patch: &mut Value, placeholders: &HashSet<&str>) -> bool {
    match patch {
        Value::Array(items) => {
            let len = items.len();
            items.retain_mut(|item| {
                !fills_placeholder(item, placeholders) && !drop_placeholders(item, placeholders)
            });

            len > 0 && items.is_empty()
        }
        Value::Object(fields) => {
            let len = fields.len();
            fields.retain(|_, value| {
                !fills_placeholder(value, placeholders) && !drop_placeholders(value, placeholders)
            });

            len > 0 && fields.is_empty()
        }
        _ => false,
    }
}

/// The placeholders of `current` that no longer appear in `new`.
fn dropped_placeholders<'a>(current: Option<&'a GcsFileMap>, new: &GcsFileMap) -> HashSet<&'a str> {
    let kept: HashSet<&str> = new.0.values().map(String::as_str).collect();

    current
        .into_iter()
        .flat_map(|map| map.0.values())
        .map(String::as_str)
        .filter(|p| !kept.contains(p))
        .collect()
}

/// Check `update` against `job` and fill in the metadata patch it implies.
fn prepare_update(job: &UploadJob, mut update: UploadJobUpdate) -> Result<UploadJobUpdate> {
    if let Some(target) = update.status {
        let is_manifest = upload_type::is_manifest(&job.upload_type);
        if !job.status.can_transition_to(target, is_manifest) {
            return Err(Error::bad_request(format!(
                "upload job cannot go from {} to {target}",
                job.status
            )));
        }
    }

    if let Some(new_map) = &update.gcs_file_map {
        let dropped = dropped_placeholders(job.gcs_file_map.as_ref(), new_map);
        if !dropped.is_empty() {
            let mut patch = job.metadata_patch.clone();
            drop_placeholders(&mut patch, &dropped);
            update.metadata_patch = Some(patch);
        }
    }

    Ok(update)
}

/// Apply `update` to a job under a row lock, so the token and etag are
/// checked against the row being replaced.
async fn apply_update(
    job_id: Uuid,
    token: Uuid,
    if_match: &IfMatch,
    update: UploadJobUpdate,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let job = upload_job::fetch_for_update(job_id, db_conn).await?;

    if job.token != token {
        return Err(auth::Error::Unauthorized {
            message: "upload token does not match upload job".to_string(),
        }
        .into());
    }
    if_match.check(&job.etag)?;

    let update = prepare_update(&job, update)?;
    let updated = upload_job::update(&job, &update, db_conn).await?;

    tracing::info!(
        %job_id,
        email = %job.uploader_email,
        status = %updated.status,
        "updated upload job"
    );

    Ok(updated)
}

async fn update(
    State(app_state): State<AppState>,
    if_match: IfMatch,
    WithRejection(Path(job_id), _): ApiPath<Uuid>,
    WithRejection(Query(UploadToken { token }), _): ApiQuery<UploadToken>,
    ValidJson(update): ValidJson<UploadJobUpdate>,
) -> Result<Json<UploadJob>> {
    let mut db_conn = app_state.db_conn().await?;
    let updated = db_conn
        .transaction::<_, Error, _>(|conn| {
            async move { apply_update(job_id, token, &if_match, update, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(updated))
}

/// Merge a job's metadata patch into its trial's document. A failed merge
/// leaves the document untouched and records why on the job.
async fn merge(
    auth: Authenticated,
    State(app_state): State<AppState>,
    WithRejection(Path(job_id), _): ApiPath<Uuid>,
) -> Result<Json<UploadJob>> {
    let admin = auth.require(ADMIN)?;

    let mut db_conn = app_state.db_conn().await?;
    let updated = db_conn
        .transaction::<_, Error, _>(|conn| {
            async move {
                let job = upload_job::fetch_for_update(job_id, conn).await?;

                let is_manifest = upload_type::is_manifest(&job.upload_type);
                if !job
                    .status
                    .can_transition_to(UploadJobStatus::MergeCompleted, is_manifest)
                {
                    return Err(Error::bad_request(format!(
                        "upload job with status {} cannot be merged",
                        job.status
                    )));
                }

                let (trial_id, patch) = (&job.trial_id, &job.metadata_patch);
                let merged = conn
                    .transaction::<_, sync::Error, _>(|conn| {
                        async move { sync::patch_document(trial_id, patch, conn).await }
                            .scope_boxed()
                    })
                    .await;

                let update = match merged {
                    Ok(_) => UploadJobUpdate {
                        status: Some(UploadJobStatus::MergeCompleted),
                        ..Default::default()
                    },
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "failed to merge upload job");
                        UploadJobUpdate {
                            status: Some(UploadJobStatus::MergeFailed),
                            status_details: Some(e.to_string()),
                            ..Default::default()
                        }
                    }
                };

                Ok(upload_job::update(&job, &update, conn).await?)
            }
            .scope_boxed()
        })
        .await?;

    tracing::info!(
        %job_id,
        admin = %admin.email,
        status = %updated.status,
        "merged upload job"
    );

    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cidc_core::model::{trial::NewTrialMetadata, user::NewUser};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::db::{
        Write,
        test_util::{DbConnection, db_conn, trial_document},
    };

    fn file_map(entries: &[(&str, &str)]) -> GcsFileMap {
        GcsFileMap(
            entries
                .iter()
                .map(|(uri, placeholder)| ((*uri).to_string(), (*placeholder).to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn dropping_a_file_drops_its_placeholder() {
        let mut patch = json!({
            "assays": {"wes_fastq": [{"records": [
                {"cimac_id": "CTTTPP111.00", "files": {"r1": {"upload_placeholder": "a1"}}},
                {"cimac_id": "CTTTPP112.00", "files": [{"upload_placeholder": "b1"}, {"upload_placeholder": "b2"}]}
            ]}]}
        });

        let current = file_map(&[("gs://x/r1", "a1"), ("gs://x/b1", "b1"), ("gs://x/b2", "b2")]);
        let new = file_map(&[("gs://x/r1", "a1"), ("gs://x/b2", "b2")]);
        let dropped = dropped_placeholders(Some(&current), &new);
        assert_eq!(dropped, HashSet::from(["b1"]));

        drop_placeholders(&mut patch, &dropped);

        assert_eq!(
            patch["assays"]["wes_fastq"][0]["records"][1]["files"],
            json!([{"upload_placeholder": "b2"}])
        );
        assert_eq!(
            patch["assays"]["wes_fastq"][0]["records"][0]["files"]["r1"],
            json!({"upload_placeholder": "a1"})
        );
    }

    #[test]
    fn keyed_placeholders_and_emptied_containers_are_dropped() {
        let mut patch = json!({
            "assays": {"olink": [{"records": [{
                "files": {
                    "assay_npx": {"upload_placeholder": "a1"},
                    "assay_raw_ct": {"upload_placeholder": "a2"}
                }
            }]}]},
            "analysis": {"wes": {"report": {"upload_placeholder": "r1"}}, "run": "A"}
        });

        drop_placeholders(&mut patch, &HashSet::from(["a1", "r1"]));

        assert_eq!(
            patch,
            json!({
                "assays": {"olink": [{"records": [{
                    "files": {"assay_raw_ct": {"upload_placeholder": "a2"}}
                }]}]},
                "analysis": {"run": "A"}
            })
        );
    }

    #[test]
    fn nothing_is_dropped_without_a_previous_map() {
        assert!(dropped_placeholders(None, &file_map(&[("gs://x/a", "a")])).is_empty());
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn stale_etag_is_refused_after_an_update(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let email = "uploader@example.com";
                    NewUser {
                        email: email.to_string(),
                        contact_email: None,
                        first_name: None,
                        last_name: None,
                        organization: None,
                        role: None,
                        approval_date: None,
                        disabled: false,
                    }
                    .write(conn)
                    .await?;
                    NewTrialMetadata {
                        trial_id: "test-job-etag".to_string(),
                        metadata_json: trial_document("test-job-etag"),
                    }
                    .write(conn)
                    .await?;

                    let new = NewUploadJob {
                        trial_id: "test-job-etag".to_string(),
                        upload_type: "wes_fastq".to_string(),
                        metadata_patch: json!({"protocol_identifier": "test-job-etag"}),
                        gcs_file_map: None,
                        multifile: false,
                    };
                    let job = upload_job::create(&new, email, UploadJobStatus::Started, conn).await?;
                    let stale = IfMatch(job.etag.clone());
                    let completed = || UploadJobUpdate {
                        status: Some(UploadJobStatus::UploadCompleted),
                        ..Default::default()
                    };

                    let updated = apply_update(job.id, job.token, &stale, completed(), conn).await?;
                    assert_eq!(updated.status, UploadJobStatus::UploadCompleted);

                    let second = apply_update(job.id, job.token, &stale, completed(), conn).await;
                    assert!(matches!(second, Err(Error::PreconditionFailed { .. })));

                    let wrong_token = apply_update(
                        job.id,
                        Uuid::now_v7(),
                        &IfMatch(updated.etag.clone()),
                        completed(),
                        conn,
                    )
                    .await;
                    assert!(wrong_token.is_err());

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

use cidc_core::model::{
    ListResponse, Pagination,
    upload_job::{
        NewUploadJob, UploadJob, UploadJobOrdinalColumn, UploadJobStatus, UploadJobUpdate,
    },
    upload_type::SUPPORTED_MANIFESTS,
};
use cidc_schema::upload_jobs;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::{
    db::{
        AsDieselFilter, FetchById, FetchByQuery,
        error::Result,
        util::{BoxedDieselExpression, DieselExpressionBuilder, make_etag},
    },
    fetch_page,
};

/// Insert a job on behalf of `uploader_email` with a fresh upload token.
///
/// # Errors
pub async fn create(
    new: &NewUploadJob,
    uploader_email: &str,
    status: UploadJobStatus,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let token = Uuid::new_v4();
    let etag = make_etag(&(new, uploader_email, status, token));

    Ok(diesel::insert_into(upload_jobs::table)
        .values((
            new,
            upload_jobs::uploader_email.eq(uploader_email),
            upload_jobs::status.eq(status),
            upload_jobs::token.eq(token),
            upload_jobs::etag.eq(etag),
        ))
        .returning(UploadJob::as_returning())
        .get_result(db_conn)
        .await?)
}

impl FetchById for UploadJob {
    type Id = Uuid;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> Result<Self> {
        Ok(upload_jobs::table
            .find(id)
            .select(UploadJob::as_select())
            .first(db_conn)
            .await?)
    }
}

/// Non-admins only list their own jobs.
#[derive(Debug, Default)]
pub struct UploadJobFilter {
    pub uploader_email: Option<String>,
}

impl AsDieselFilter<upload_jobs::table> for UploadJobFilter {
    fn as_diesel_filter<'a>(&'a self) -> Option<BoxedDieselExpression<'a, upload_jobs::table>>
    where
        upload_jobs::table: 'a,
    {
        let mut query = DieselExpressionBuilder::default();

        if let Some(email) = &self.uploader_email {
            query = query.and_condition(upload_jobs::uploader_email.eq(email));
        }

        query.build()
    }
}

impl FetchByQuery for UploadJob {
    type QueryParams = UploadJobFilter;
    type OrdinalColumn = UploadJobOrdinalColumn;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> Result<ListResponse<Self>> {
        use UploadJobOrdinalColumn::{CreatedAt, Status, TrialId, UpdatedAt, UploadType};

        fetch_page!(
            upload_jobs,
            UploadJob,
            query,
            pagination,
            upload_jobs::created_at.desc(),
            [
                (CreatedAt, upload_jobs::created_at),
                (UpdatedAt, upload_jobs::updated_at),
                (TrialId, upload_jobs::trial_id),
                (UploadType, upload_jobs::upload_type),
                (Status, upload_jobs::status)
            ],
            db_conn
        )
    }
}

/// Fetch a job and lock its row until the surrounding transaction ends.
///
/// # Errors
pub async fn fetch_for_update(id: Uuid, db_conn: &mut AsyncPgConnection) -> Result<UploadJob> {
    Ok(upload_jobs::table
        .find(id)
        .select(UploadJob::as_select())
        .for_update()
        .first(db_conn)
        .await?)
}

/// # Errors
pub async fn update(
    current: &UploadJob,
    update: &UploadJobUpdate,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let etag = make_etag(&(current, update));

    Ok(diesel::update(upload_jobs::table.find(current.id))
        .set((update, upload_jobs::etag.eq(etag)))
        .returning(UploadJob::as_returning())
        .get_result(db_conn)
        .await?)
}

/// Correct the upload type a manifest upload was recorded with.
///
/// # Errors
pub async fn set_upload_type(
    current: &UploadJob,
    upload_type: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<UploadJob> {
    let etag = make_etag(&(current, upload_type));

    Ok(diesel::update(upload_jobs::table.find(current.id))
        .set((
            upload_jobs::upload_type.eq(upload_type),
            upload_jobs::etag.eq(etag),
        ))
        .returning(UploadJob::as_returning())
        .get_result(db_conn)
        .await?)
}

/// Completed manifest uploads for `trial_id`, oldest first.
///
/// # Errors
pub async fn manifest_jobs_for_trial(
    trial_id: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<UploadJob>> {
    Ok(upload_jobs::table
        .filter(upload_jobs::trial_id.eq(trial_id))
        .filter(upload_jobs::status.eq(UploadJobStatus::MergeCompleted))
        .filter(upload_jobs::upload_type.eq_any(SUPPORTED_MANIFESTS))
        .select(UploadJob::as_select())
        .order_by(upload_jobs::created_at)
        .load(db_conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use cidc_core::model::{
        trial::NewTrialMetadata,
        upload_job::{GcsFileMap, NewUploadJob, UploadJobStatus, UploadJobUpdate},
        user::NewUser,
    };
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::db::{
        self, Write,
        test_util::{DbConnection, db_conn, trial_document},
    };

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn jobs_are_listed_per_uploader(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    for email in ["one@example.com", "two@example.com"] {
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
                    }
                    NewTrialMetadata {
                        trial_id: "test-jobs".to_string(),
                        metadata_json: trial_document("test-jobs"),
                    }
                    .write(conn)
                    .await?;

                    let new = NewUploadJob {
                        trial_id: "test-jobs".to_string(),
                        upload_type: "olink".to_string(),
                        metadata_patch: json!({"protocol_identifier": "test-jobs"}),
                        gcs_file_map: None,
                        multifile: false,
                    };
                    let job =
                        create(&new, "one@example.com", UploadJobStatus::Started, conn).await?;
                    create(&new, "two@example.com", UploadJobStatus::Started, conn).await?;

                    let filter = UploadJobFilter {
                        uploader_email: Some("one@example.com".to_string()),
                    };
                    let page =
                        UploadJob::fetch_by_query(&filter, &Pagination::default(), conn).await?;
                    assert_eq!(page.meta.total, 1);

                    let updated = update(
                        &job,
                        &UploadJobUpdate {
                            status: Some(UploadJobStatus::UploadCompleted),
                            gcs_file_map: Some(GcsFileMap::default()),
                            ..Default::default()
                        },
                        conn,
                    )
                    .await?;
                    assert_eq!(updated.status, UploadJobStatus::UploadCompleted);
                    assert_ne!(updated.etag, job.etag);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

use cidc_core::model::{
    ListResponse, Pagination,
    downloadable_file::{DownloadableFile, FileOrdinalColumn, FileQuery, NewDownloadableFile},
    permission::Permission,
    user::User,
};
use cidc_schema::downloadable_files;
use diesel::{dsl::sql, prelude::*, sql_types::Bool};
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

/// Insert `new`, or replace the artifact already registered at its
/// `object_url`.
///
/// # Errors
pub async fn upsert(
    new: &NewDownloadableFile,
    db_conn: &mut AsyncPgConnection,
) -> Result<DownloadableFile> {
    let etag = make_etag(new);

    Ok(diesel::insert_into(downloadable_files::table)
        .values((new, downloadable_files::etag.eq(&etag)))
        .on_conflict(downloadable_files::object_url)
        .do_update()
        .set((new, downloadable_files::etag.eq(&etag)))
        .returning(DownloadableFile::as_returning())
        .get_result(db_conn)
        .await?)
}

impl FetchById for DownloadableFile {
    type Id = Uuid;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> Result<Self> {
        Ok(downloadable_files::table
            .find(id)
            .select(DownloadableFile::as_select())
            .first(db_conn)
            .await?)
    }
}

/// A (trial, upload type) scope a user may download from. `None` on either
/// side is a wildcard.
pub type Grant = (Option<String>, Option<String>);

/// The files a user may see, narrowed by the request's trial and facet
/// selections. Only visible files ever match.
#[derive(Debug, Default, Clone)]
pub struct FileFilter {
    pub trial_ids: Vec<String>,
    pub facets: Vec<(String, Option<String>)>,
    /// `None` for users who see every file.
    pub grants: Option<Vec<Grant>>,
}

impl FileFilter {
    #[must_use]
    pub fn new(query: &FileQuery, user: &User, permissions: &[Permission]) -> Self {
        let grants = (!user.sees_everything()).then(|| {
            permissions
                .iter()
                .map(|p| (p.trial_id.clone(), p.upload_type.clone()))
                .collect()
        });

        Self {
            trial_ids: query.trial_ids.as_slice().to_vec(),
            facets: query
                .parsed_facets()
                .into_iter()
                .map(|f| (f.upload_type.to_string(), f.facet_group.map(str::to_string)))
                .collect(),
            grants,
        }
    }

    /// Whether a single file is visible and passes the permission part of
    /// this filter.
    #[must_use]
    pub fn permits(&self, file: &DownloadableFile) -> bool {
        if !file.visible {
            return false;
        }
        let Some(grants) = &self.grants else {
            return true;
        };

        grants.iter().any(|(trial_id, upload_type)| {
            let trial_matches = trial_id.as_ref().is_none_or(|t| *t == file.trial_id);
            let type_matches = upload_type.as_ref().is_none_or(|u| *u == file.upload_type);

            (trial_id.is_some() || upload_type.is_some()) && trial_matches && type_matches
        })
    }
}

impl AsDieselFilter<downloadable_files::table> for FileFilter {
    fn as_diesel_filter<'a>(
        &'a self,
    ) -> Option<BoxedDieselExpression<'a, downloadable_files::table>>
    where
        downloadable_files::table: 'a,
    {
        use downloadable_files::{facet_group, trial_id, upload_type, visible};

        let mut query = DieselExpressionBuilder::default().and_condition(visible.eq(true));

        if !self.trial_ids.is_empty() {
            query = query.and_condition(trial_id.eq_any(&self.trial_ids));
        }

        if !self.facets.is_empty() {
            let mut facets = DieselExpressionBuilder::default();
            for (facet_type, group) in &self.facets {
                facets = match group {
                    Some(group) => {
                        facets.or_condition(upload_type.eq(facet_type).and(facet_group.eq(group)))
                    }
                    None => facets.or_condition(upload_type.eq(facet_type)),
                };
            }
            if let Some(facets) = facets.build() {
                query = query.and_condition(facets);
            }
        }

        if let Some(grants) = &self.grants {
            let mut permitted = DieselExpressionBuilder::default();
            for grant in grants {
                permitted = match grant {
                    (Some(t), Some(u)) => permitted.or_condition(trial_id.eq(t).and(upload_type.eq(u))),
                    (Some(t), None) => permitted.or_condition(trial_id.eq(t)),
                    (None, Some(u)) => permitted.or_condition(upload_type.eq(u)),
                    (None, None) => permitted,
                };
            }
            query = match permitted.build() {
                Some(permitted) => query.and_condition(permitted),
                None => query.and_condition(sql::<Bool>("false")),
            };
        }

        query.build()
    }
}

impl FetchByQuery for DownloadableFile {
    type QueryParams = FileFilter;
    type OrdinalColumn = FileOrdinalColumn;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> Result<ListResponse<Self>> {
        use FileOrdinalColumn::{
            FacetGroup, FileSizeBytes, ObjectUrl, TrialId, UploadType, UploadedTimestamp,
        };

        fetch_page!(
            downloadable_files,
            DownloadableFile,
            query,
            pagination,
            downloadable_files::uploaded_timestamp.desc(),
            [
                (TrialId, downloadable_files::trial_id),
                (UploadType, downloadable_files::upload_type),
                (FacetGroup, downloadable_files::facet_group),
                (FileSizeBytes, downloadable_files::file_size_bytes),
                (UploadedTimestamp, downloadable_files::uploaded_timestamp),
                (ObjectUrl, downloadable_files::object_url)
            ],
            db_conn
        )
    }
}

/// The files among `ids` that `filter` admits.
///
/// # Errors
pub async fn fetch_many(
    ids: &[Uuid],
    filter: &FileFilter,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<DownloadableFile>> {
    let mut statement = downloadable_files::table
        .filter(downloadable_files::id.eq_any(ids))
        .select(DownloadableFile::as_select())
        .order_by(downloadable_files::object_url)
        .into_boxed();

    if let Some(f) = filter.as_diesel_filter() {
        statement = statement.filter(f);
    }

    Ok(statement.load(db_conn).await?)
}

/// Files from the same sample as `file`, or for sample-less files, files of
/// the same kind in the same trial.
///
/// # Errors
pub async fn related_files(
    file: &DownloadableFile,
    filter: &FileFilter,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<DownloadableFile>> {
    let mut statement = downloadable_files::table
        .filter(downloadable_files::id.ne(file.id))
        .filter(downloadable_files::trial_id.eq(&file.trial_id))
        .select(DownloadableFile::as_select())
        .order_by(downloadable_files::object_url)
        .into_boxed();

    statement = match &file.cimac_id {
        Some(cimac_id) => statement.filter(downloadable_files::cimac_id.eq(cimac_id)),
        None => statement
            .filter(downloadable_files::cimac_id.is_null())
            .filter(downloadable_files::upload_type.eq(&file.upload_type))
            .filter(downloadable_files::facet_group.eq(&file.facet_group)),
    };

    if let Some(f) = filter.as_diesel_filter() {
        statement = statement.filter(f);
    }

    Ok(statement.load(db_conn).await?)
}

/// `(trial_id, upload_type, facet_group)` of every file `filter` admits.
///
/// # Errors
pub async fn facet_rows(
    filter: &FileFilter,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<(String, String, String)>> {
    let mut statement = downloadable_files::table
        .select((
            downloadable_files::trial_id,
            downloadable_files::upload_type,
            downloadable_files::facet_group,
        ))
        .into_boxed();

    if let Some(f) = filter.as_diesel_filter() {
        statement = statement.filter(f);
    }

    Ok(statement.load(db_conn).await?)
}

/// Object URLs of the files in `trial_id` that were derived from its
/// document's assay batches.
///
/// # Errors
pub async fn linked_object_urls(
    trial_id: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<String>> {
    Ok(downloadable_files::table
        .filter(downloadable_files::trial_id.eq(trial_id))
        .filter(downloadable_files::upload_id.is_not_null())
        .select(downloadable_files::object_url)
        .load(db_conn)
        .await?)
}

/// # Errors
pub async fn delete_by_object_urls(
    object_urls: &[String],
    db_conn: &mut AsyncPgConnection,
) -> Result<usize> {
    Ok(
        diesel::delete(downloadable_files::table.filter(downloadable_files::object_url.eq_any(object_urls)))
            .execute(db_conn)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use cidc_core::model::{Delimited, user::CidcRole};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn user(role: Option<CidcRole>) -> User {
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
            role,
            disabled: false,
        }
    }

    fn permission(trial_id: Option<&str>, upload_type: Option<&str>) -> Permission {
        Permission {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            etag: String::new(),
            granted_to_user: Uuid::now_v7(),
            granted_by_user: None,
            trial_id: trial_id.map(str::to_string),
            upload_type: upload_type.map(str::to_string),
        }
    }

    fn file(trial_id: &str, upload_type: &str) -> DownloadableFile {
        serde_json::from_value(json!({
            "id": Uuid::nil(),
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z",
            "_etag": "",
            "trial_id": trial_id,
            "upload_type": upload_type,
            "object_url": format!("{trial_id}/{upload_type}/file.txt"),
            "file_name": null,
            "data_format": "TEXT",
            "facet_group": "/file.txt",
            "file_size_bytes": 1,
            "uploaded_timestamp": "2025-01-01T00:00:00Z",
            "md5_hash": null,
            "crc32c_hash": null,
            "additional_metadata": {},
            "visible": true,
            "analysis_friendly": false,
            "upload_id": null,
            "cimac_id": null
        }))
        .unwrap()
    }

    #[test]
    fn admins_are_not_restricted() {
        let filter = FileFilter::new(
            &FileQuery::default(),
            &user(Some(CidcRole::CidcAdmin)),
            &[],
        );

        assert_eq!(filter.grants, None);
        assert!(filter.permits(&file("10021", "wes_fastq")));
    }

    #[rstest]
    #[case(Some("10021"), Some("olink"), "10021", "olink", true)]
    #[case(Some("10021"), Some("olink"), "10021", "wes_fastq", false)]
    #[case(None, Some("olink"), "E4412", "olink", true)]
    #[case(Some("10021"), None, "10021", "cytof", true)]
    #[case(Some("10021"), None, "E4412", "cytof", false)]
    fn permissions_narrow_files(
        #[case] trial_id: Option<&str>,
        #[case] upload_type: Option<&str>,
        #[case] file_trial: &str,
        #[case] file_type: &str,
        #[case] permitted: bool,
    ) {
        let filter = FileFilter::new(
            &FileQuery::default(),
            &user(Some(CidcRole::CimacUser)),
            &[permission(trial_id, upload_type)],
        );

        assert_eq!(filter.permits(&file(file_trial, file_type)), permitted);
    }

    #[rstest]
    #[case(Some(CidcRole::CidcAdmin), &[])]
    #[case(Some(CidcRole::CimacUser), &[(Some("10021"), None)])]
    fn hidden_files_are_never_permitted(
        #[case] role: Option<CidcRole>,
        #[case] grants: &[(Option<&str>, Option<&str>)],
    ) {
        let permissions: Vec<_> = grants.iter().map(|(t, u)| permission(*t, *u)).collect();
        let filter = FileFilter::new(&FileQuery::default(), &user(role), &permissions);

        let mut hidden = file("10021", "olink");
        hidden.visible = false;

        assert!(!filter.permits(&hidden));
    }

    #[test]
    fn query_selections_are_carried() {
        let query = FileQuery {
            trial_ids: Delimited(vec!["10021".to_string()]),
            facets: Delimited(vec!["olink:npx".to_string(), "cytof".to_string()]),
        };
        let filter = FileFilter::new(&query, &user(None), &[]);

        assert_eq!(filter.trial_ids, ["10021"]);
        assert_eq!(
            filter.facets,
            [
                ("olink".to_string(), Some("npx".to_string())),
                ("cytof".to_string(), None)
            ]
        );
        assert_eq!(filter.grants, Some(vec![]));
        assert!(!filter.permits(&file("10021", "olink")));
    }
}

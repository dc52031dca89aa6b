use std::collections::HashMap;

use cidc_core::model::{
    ListResponse, Pagination,
    trial::{
        DataOverview, MetadataCounts, NewTrialMetadata, TrialMetadata, TrialOrdinalColumn,
        TrialSummary,
    },
};
use cidc_schema::{assay_records, downloadable_files, participants, samples, trial_metadata, uploads};
use diesel::{
    dsl::{count_distinct, count_star, sql},
    prelude::*,
    sql_types::BigInt,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;

use crate::{
    db::{
        AsDieselFilter, FetchById, FetchByQuery, Write,
        error::Result,
        util::{BoxedDieselExpression, DieselExpressionBuilder, make_etag},
    },
    fetch_page,
};

const SUM_FILE_SIZE: &str = "coalesce(sum(file_size_bytes), 0)::bigint";

impl Write for NewTrialMetadata {
    type Returns = TrialMetadata;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> Result<Self::Returns> {
        let etag = make_etag(&self);

        let inserted = diesel::insert_into(trial_metadata::table)
            .values((&self, trial_metadata::etag.eq(etag)))
            .returning(TrialMetadata::as_returning())
            .get_result(db_conn)
            .await?;

        Ok(inserted)
    }
}

impl FetchById for TrialMetadata {
    type Id = String;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> Result<Self> {
        Ok(trial_metadata::table
            .filter(trial_metadata::trial_id.eq(id))
            .select(TrialMetadata::as_select())
            .first(db_conn)
            .await?)
    }
}

/// Fetch a trial and lock its row until the surrounding transaction ends.
///
/// # Errors
pub async fn fetch_for_update(
    trial_id: &str,
    db_conn: &mut AsyncPgConnection,
) -> Result<TrialMetadata> {
    Ok(trial_metadata::table
        .filter(trial_metadata::trial_id.eq(trial_id))
        .select(TrialMetadata::as_select())
        .for_update()
        .first(db_conn)
        .await?)
}

/// Replace a trial's document, returning the updated row.
///
/// # Errors
pub async fn update_document(
    trial_id: &str,
    document: &Value,
    db_conn: &mut AsyncPgConnection,
) -> Result<TrialMetadata> {
    let etag = make_etag(&(trial_id, document));

    Ok(diesel::update(trial_metadata::table.filter(trial_metadata::trial_id.eq(trial_id)))
        .set((
            trial_metadata::metadata_json.eq(document),
            trial_metadata::etag.eq(etag),
        ))
        .returning(TrialMetadata::as_returning())
        .get_result(db_conn)
        .await?)
}

/// # Errors
pub async fn all_trial_ids(db_conn: &mut AsyncPgConnection) -> Result<Vec<String>> {
    Ok(trial_metadata::table
        .select(trial_metadata::trial_id)
        .order_by(trial_metadata::trial_id)
        .load(db_conn)
        .await?)
}

/// Which trials a listing covers. `visible_to` is `None` for callers who may
/// see every trial.
#[derive(Debug, Default)]
pub struct TrialFilter {
    pub trial_ids: Vec<String>,
    pub visible_to: Option<Vec<String>>,
}

impl AsDieselFilter<trial_metadata::table> for TrialFilter {
    fn as_diesel_filter<'a>(&'a self) -> Option<BoxedDieselExpression<'a, trial_metadata::table>>
    where
        trial_metadata::table: 'a,
    {
        let mut query = DieselExpressionBuilder::default();

        if !self.trial_ids.is_empty() {
            query = query.and_condition(trial_metadata::trial_id.eq_any(&self.trial_ids));
        }

        if let Some(visible) = &self.visible_to {
            query = query.and_condition(trial_metadata::trial_id.eq_any(visible));
        }

        query.build()
    }
}

impl FetchByQuery for TrialMetadata {
    type QueryParams = TrialFilter;
    type OrdinalColumn = TrialOrdinalColumn;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> Result<ListResponse<Self>> {
        use TrialOrdinalColumn::{CreatedAt, TrialId, UpdatedAt};

        fetch_page!(
            trial_metadata,
            TrialMetadata,
            query,
            pagination,
            trial_metadata::trial_id.asc(),
            [
                (TrialId, trial_metadata::trial_id),
                (CreatedAt, trial_metadata::created_at),
                (UpdatedAt, trial_metadata::updated_at)
            ],
            db_conn
        )
    }
}

/// Participant and sample counts per trial, read from the relational mirror.
///
/// # Errors
pub async fn participant_sample_counts(
    trial_ids: &[String],
    db_conn: &mut AsyncPgConnection,
) -> Result<HashMap<String, (i64, i64)>> {
    let participant_counts: Vec<(String, i64)> = participants::table
        .filter(participants::trial_id.eq_any(trial_ids))
        .group_by(participants::trial_id)
        .select((participants::trial_id, count_star()))
        .load(db_conn)
        .await?;

    let sample_counts: Vec<(String, i64)> = samples::table
        .filter(samples::trial_id.eq_any(trial_ids))
        .group_by(samples::trial_id)
        .select((samples::trial_id, count_star()))
        .load(db_conn)
        .await?;

    let mut counts: HashMap<String, (i64, i64)> = HashMap::new();
    for (trial_id, n) in participant_counts {
        counts.entry(trial_id).or_default().0 = n;
    }
    for (trial_id, n) in sample_counts {
        counts.entry(trial_id).or_default().1 = n;
    }

    Ok(counts)
}

/// # Errors
pub async fn metadata_counts(db_conn: &mut AsyncPgConnection) -> Result<MetadataCounts> {
    let num_trials = trial_metadata::table
        .count()
        .get_result(db_conn)
        .await?;
    let num_participants = participants::table.count().get_result(db_conn).await?;
    let num_samples = samples::table.count().get_result(db_conn).await?;

    Ok(MetadataCounts {
        num_trials,
        num_participants,
        num_samples,
    })
}

/// # Errors
pub async fn data_overview(db_conn: &mut AsyncPgConnection) -> Result<DataOverview> {
    let MetadataCounts {
        num_trials,
        num_participants,
        num_samples,
    } = metadata_counts(db_conn).await?;

    let (num_files, num_bytes): (i64, i64) = downloadable_files::table
        .select((count_star(), sql::<BigInt>(SUM_FILE_SIZE)))
        .get_result(db_conn)
        .await?;

    let num_assays = uploads::table
        .filter(uploads::shipment_manifest_id.is_null())
        .select(count_distinct(uploads::upload_type))
        .get_result(db_conn)
        .await?;

    Ok(DataOverview {
        num_trials,
        num_participants,
        num_samples,
        num_files,
        num_bytes,
        num_assays,
    })
}

/// Per-trial summaries of the trials in `filter`.
///
/// # Errors
pub async fn summaries(
    filter: &TrialFilter,
    db_conn: &mut AsyncPgConnection,
) -> Result<Vec<TrialSummary>> {
    let mut statement = trial_metadata::table
        .select(trial_metadata::trial_id)
        .order_by(trial_metadata::trial_id)
        .into_boxed();
    if let Some(f) = filter.as_diesel_filter() {
        statement = statement.filter(f);
    }
    let trial_ids: Vec<String> = statement.load(db_conn).await?;

    let counts = participant_sample_counts(&trial_ids, db_conn).await?;

    let file_totals: Vec<(String, i64, i64)> = downloadable_files::table
        .filter(downloadable_files::trial_id.eq_any(&trial_ids))
        .group_by(downloadable_files::trial_id)
        .select((
            downloadable_files::trial_id,
            count_star(),
            sql::<BigInt>(SUM_FILE_SIZE),
        ))
        .load(db_conn)
        .await?;
    let file_totals: HashMap<String, (i64, i64)> = file_totals
        .into_iter()
        .map(|(trial_id, n, bytes)| (trial_id, (n, bytes)))
        .collect();

    let record_counts: Vec<(String, String, i64)> = assay_records::table
        .inner_join(uploads::table)
        .filter(uploads::trial_id.eq_any(&trial_ids))
        .group_by((uploads::trial_id, uploads::upload_type))
        .select((uploads::trial_id, uploads::upload_type, count_star()))
        .load(db_conn)
        .await?;

    let summaries = trial_ids
        .into_iter()
        .map(|trial_id| {
            let (num_participants, num_samples) =
                counts.get(&trial_id).copied().unwrap_or_default();
            let (num_files, file_size_bytes) =
                file_totals.get(&trial_id).copied().unwrap_or_default();
            let records_per_assay = record_counts
                .iter()
                .filter(|(t, ..)| *t == trial_id)
                .map(|(_, upload_type, n)| (upload_type.clone(), *n))
                .collect();

            TrialSummary {
                trial_id,
                num_participants,
                num_samples,
                num_files,
                file_size_bytes,
                records_per_assay,
            }
        })
        .collect();

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use cidc_core::model::{Pagination, trial::NewTrialMetadata};
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::db::{
        self,
        test_util::{DbConnection, db_conn, trial_document},
    };

    #[rstest]
    #[awt]
    #[tokio::test]
    #[ignore = "requires a docker daemon"]
    async fn listing_respects_visibility(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    for trial_id in ["test-list-1", "test-list-2", "test-list-3"] {
                        NewTrialMetadata {
                            trial_id: trial_id.to_string(),
                            metadata_json: trial_document(trial_id),
                        }
                        .write(conn)
                        .await?;
                    }

                    let filter = TrialFilter {
                        trial_ids: vec![],
                        visible_to: Some(vec!["test-list-2".to_string()]),
                    };
                    let page =
                        TrialMetadata::fetch_by_query(&filter, &Pagination::default(), conn)
                            .await?;

                    assert_eq!(page.meta.total, 1);
                    assert_eq!(page.items[0].trial_id, "test-list-2");

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
    async fn document_update_changes_etag(#[future] db_conn: DbConnection) {
        let mut db_conn = db_conn;

        db_conn
            .test_transaction::<_, db::error::Error, _>(|conn| {
                async move {
                    let trial = NewTrialMetadata {
                        trial_id: "test-update".to_string(),
                        metadata_json: trial_document("test-update"),
                    }
                    .write(conn)
                    .await?;

                    let mut document = trial.metadata_json.clone();
                    document["nct_id"] = json!("NCT99999999");

                    let locked = fetch_for_update("test-update", conn).await?;
                    let updated = update_document(&locked.trial_id, &document, conn).await?;

                    assert_ne!(updated.etag, trial.etag);
                    assert_eq!(updated.metadata_json["nct_id"], "NCT99999999");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}

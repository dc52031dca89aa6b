use cidc_core::model::{ListResponse, Pagination};
use diesel_async::AsyncPgConnection;
use util::BoxedDieselExpression;

pub mod error;
pub mod model;
pub mod seed_data;
#[cfg(test)]
pub(crate) mod test_util;
pub(crate) mod util;

trait AsDieselFilter<QuerySource> {
    fn as_diesel_filter<'a>(&'a self) -> Option<BoxedDieselExpression<'a, QuerySource>>
    where
        QuerySource: 'a;
}

pub trait Write {
    type Returns;

    fn write(
        self,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<Self::Returns>> + Send;
}

pub trait FetchById: Sized {
    type Id;

    fn fetch_by_id(
        id: &Self::Id,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<Self>> + Send;
}

pub trait FetchByQuery: Sized {
    type QueryParams;
    type OrdinalColumn;

    fn fetch_by_query(
        query: &Self::QueryParams,
        pagination: &Pagination<Self::OrdinalColumn>,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<ListResponse<Self>>> + Send;
}

/// Loads one page of `$table` rows matching `$filter`, together with the
/// total number of matching rows. The column list maps each ordinal column
/// variant to the database column it sorts by.
#[macro_export]
macro_rules! fetch_page {
    ($table:ident, $record:ty, $filter:expr, $pagination:expr, $default_order:expr, [$(($variant:path, $col:expr)),*], $db_conn:expr) => {{
        use diesel::prelude::*;
        use diesel_async::RunQueryDsl;
        use $crate::db::AsDieselFilter;

        let filter = $filter;
        let pagination = $pagination;

        let mut count_statement = $table::table.count().into_boxed();
        if let Some(f) = filter.as_diesel_filter() {
            count_statement = count_statement.filter(f);
        }
        let total: i64 = count_statement.get_result($db_conn).await?;

        let mut statement = $table::table
            .select(<$record>::as_select())
            .limit(pagination.limit())
            .offset(pagination.offset())
            .into_boxed();

        if let Some(f) = filter.as_diesel_filter() {
            statement = statement.filter(f);
        }

        statement = match (&pagination.sort_field, pagination.descending()) {
            $(
                (Some($variant), false) => statement.order_by($col.asc()),
                (Some($variant), true) => statement.order_by($col.desc()),
            )*
            (None, _) => statement.order_by($default_order),
        };

        let items: Vec<$record> = statement.load($db_conn).await?;

        Ok(cidc_core::model::ListResponse::new(items, total))
    }};
}

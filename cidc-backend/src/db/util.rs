use diesel::{pg::Pg, prelude::*, sql_types};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub(crate) type BoxedDieselExpression<'a, Table> =
    Box<dyn BoxableExpression<Table, Pg, SqlType = sql_types::Bool> + 'a>;

/// Accumulates optional filter conditions into one boxed expression.
pub(crate) struct DieselExpressionBuilder<'a, Table>(Option<BoxedDieselExpression<'a, Table>>);
impl<Table> Default for DieselExpressionBuilder<'_, Table> {
    fn default() -> Self {
        Self(None)
    }
}

impl<'a, Table: 'a> DieselExpressionBuilder<'a, Table> {
    pub fn and_condition<Q>(self, other: Q) -> Self
    where
        Q: BoxableExpression<Table, Pg, SqlType = sql_types::Bool> + 'a,
    {
        let other: BoxedDieselExpression<Table> = Box::new(other);

        let Self(Some(current)) = self else {
            return Self(Some(other));
        };

        Self(Some(Box::new(current.and(other))))
    }

    pub fn or_condition<Q>(self, other: Q) -> Self
    where
        Q: BoxableExpression<Table, Pg, SqlType = sql_types::Bool> + 'a,
    {
        let other: BoxedDieselExpression<Table> = Box::new(other);

        let Self(Some(current)) = self else {
            return Self(Some(other));
        };

        Self(Some(Box::new(current.or(other))))
    }

    pub fn build(self) -> Option<BoxedDieselExpression<'a, Table>> {
        let Self(query) = self;

        query
    }
}

/// SHA-256 hex digest of a record's JSON serialization.
pub(crate) fn make_etag<T: Serialize + ?Sized>(content: &T) -> String {
    let bytes = serde_json::to_vec(content).unwrap_or_default();

    hex::encode(Sha256::digest(bytes))
}

/// An etag that differs from every previous one for the same record, for
/// updates where the new content is not assembled in memory.
pub(crate) fn fresh_etag<T: Serialize + ?Sized>(content: &T) -> String {
    make_etag(&(content, uuid::Uuid::now_v7()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn etag_is_sha256_hex() {
        let etag = make_etag(&json!({"a": 1}));

        assert_eq!(etag.len(), 64);
        assert_eq!(etag, make_etag(&json!({"a": 1})));
        assert_ne!(etag, make_etag(&json!({"a": 2})));
    }

    #[test]
    fn fresh_etags_differ() {
        assert_ne!(fresh_etag("x"), fresh_etag("x"));
    }
}

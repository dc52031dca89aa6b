use cidc_macros::api_enum;
use serde::{Deserialize, Deserializer, Serialize};

pub mod downloadable_file;
pub mod permission;
pub mod trial;
pub mod upload_type;
pub mod upload_job;
pub mod user;

pub trait Endpoint {
    fn endpoint() -> String;
}

pub const PAGINATION_PAGE_SIZE: i64 = 25;
pub const MAX_PAGINATION_PAGE_SIZE: i64 = 200;

#[api_enum]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Page-based pagination shared by every list endpoint. `C` is the set of
/// columns a resource can be sorted by.
#[derive(Deserialize, Debug, Clone)]
pub struct Pagination<C> {
    pub page_num: Option<i64>,
    pub page_size: Option<i64>,
    pub sort_field: Option<C>,
    pub sort_direction: Option<SortDirection>,
}

impl<C> Default for Pagination<C> {
    fn default() -> Self {
        Self {
            page_num: None,
            page_size: None,
            sort_field: None,
            sort_direction: None,
        }
    }
}

impl<C> Pagination<C> {
    /// # Errors
    pub fn check(&self) -> Result<(), String> {
        if let Some(page_size) = self.page_size {
            if page_size > MAX_PAGINATION_PAGE_SIZE {
                return Err(format!(
                    "page_size {page_size} exceeds the maximum of {MAX_PAGINATION_PAGE_SIZE}"
                ));
            }
            if page_size < 1 {
                return Err("page_size must be positive".to_string());
            }
        }

        if let Some(page_num) = self.page_num {
            if page_num < 0 {
                return Err("page_num must not be negative".to_string());
            }
            if page_num.checked_mul(self.limit()).is_none() {
                return Err(format!("page_num {page_num} is out of range"));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn limit(&self) -> i64 {
        self.page_size
            .unwrap_or(PAGINATION_PAGE_SIZE)
            .clamp(1, MAX_PAGINATION_PAGE_SIZE)
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.page_num
            .unwrap_or_default()
            .max(0)
            .saturating_mul(self.limit())
    }

    #[must_use]
    pub fn descending(&self) -> bool {
        matches!(self.sort_direction, Some(SortDirection::Desc))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ListMeta {
    pub total: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResponse<T> {
    #[serde(rename = "_items")]
    pub items: Vec<T>,
    #[serde(rename = "_meta")]
    pub meta: ListMeta,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>, total: i64) -> Self {
        Self {
            items,
            meta: ListMeta { total },
        }
    }
}

/// A comma-delimited query-string list, e.g. `?trial_ids=a,b`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delimited(pub Vec<String>);

impl Delimited {
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Delimited {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;

        Ok(Self(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, None, 25, 0)]
    #[case(Some(2), None, 25, 50)]
    #[case(Some(3), Some(10), 10, 30)]
    #[case(None, Some(200), 200, 0)]
    fn pagination_window(
        #[case] page_num: Option<i64>,
        #[case] page_size: Option<i64>,
        #[case] limit: i64,
        #[case] offset: i64,
    ) {
        let pagination = Pagination::<()> {
            page_num,
            page_size,
            ..Default::default()
        };

        assert_eq!(pagination.check(), Ok(()));
        assert_eq!(pagination.limit(), limit);
        assert_eq!(pagination.offset(), offset);
    }

    #[rstest]
    #[case(Some(0), Some(201))]
    #[case(Some(-1), None)]
    #[case(None, Some(0))]
    #[case(Some(i64::MAX), None)]
    #[case(Some(i64::MAX / 10), Some(11))]
    fn pagination_rejects_out_of_range(
        #[case] page_num: Option<i64>,
        #[case] page_size: Option<i64>,
    ) {
        let pagination = Pagination::<()> {
            page_num,
            page_size,
            ..Default::default()
        };

        assert!(pagination.check().is_err());
    }

    #[test]
    fn offset_of_huge_page_saturates() {
        let pagination = Pagination::<()> {
            page_num: Some(i64::MAX),
            ..Default::default()
        };

        assert_eq!(pagination.offset(), i64::MAX);
    }

    #[test]
    fn delimited_list() {
        let Delimited(trial_ids) =
            serde_json::from_value(serde_json::json!("10021, 10022,,E4412")).unwrap();

        assert_eq!(trial_ids, ["10021", "10022", "E4412"]);
    }

    #[test]
    fn list_response_shape() {
        let response = ListResponse::new(vec![1, 2], 7);

        assert_eq!(
            serde_json::to_value(response).unwrap(),
            serde_json::json!({"_items": [1, 2], "_meta": {"total": 7}})
        );
    }
}

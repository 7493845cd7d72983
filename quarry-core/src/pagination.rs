//! Page-at-a-time reads

use crate::builder::QueryState;
use crate::error::{Error, Result};
use crate::executor::ConnectionPool;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One page of results plus the totals needed to render a pager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub per_page: u64,
    pub total_items: u64,
    pub total_pages: u64,
}

impl<T> PagedResult<T> {
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn has_previous(&self) -> bool {
        self.page > 1
    }
}

/// `ceil(total_items / per_page)`; a `per_page` of zero counts as one
pub fn page_count(total_items: u64, per_page: u64) -> u64 {
    total_items.div_ceil(per_page.max(1))
}

impl QueryState {
    /// Count the matches, then fetch page `page` of `per_page` rows
    ///
    /// Pages are 1-based; values below 1 are clamped to 1. Any limit or offset
    /// already on the state is replaced. A page past the end is empty.
    #[tracing::instrument(skip_all, fields(table = self.table_name(), page = page, per_page = per_page))]
    pub async fn paged<T: DeserializeOwned>(
        self,
        pool: &impl ConnectionPool,
        page: i64,
        per_page: i64,
    ) -> Result<PagedResult<T>> {
        if let Some(err) = self.error() {
            return Err(err.clone());
        }
        if self.target.is_none() {
            return Err(Error::unaddressable("paged needs a table to count against"));
        }

        let page = page.max(1).unsigned_abs();
        let per_page = per_page.max(1).unsigned_abs();
        let total_items = self.clone().count(pool).await?;
        let offset = (page - 1).saturating_mul(per_page);

        let items = if offset >= total_items {
            Vec::new()
        } else {
            self.limit(i64::try_from(per_page).unwrap_or(i64::MAX))
                .offset(i64::try_from(offset).unwrap_or(i64::MAX))
                .find(pool)
                .await?
        };

        Ok(PagedResult {
            items,
            page,
            per_page,
            total_items,
            total_pages: page_count(total_items, per_page),
        })
    }
}

//! Paging for list queries

use serde::{Deserialize, Serialize};

/// Page selection for list queries.
///
/// Pages are 1-based; a page number of 0 is treated as the first page and
/// a page size of 0 as a size of 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page number, starting at 1
    pub page: u32,

    /// Rows per page
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, size: 20 }
    }
}

impl PageRequest {
    /// Create a page request.
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// Number of rows skipped before this page.
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit()
    }

    /// Maximum number of rows on this page.
    pub fn limit(&self) -> usize {
        self.size.max(1) as usize
    }

    /// Cut this page out of a fully ordered result set.
    pub fn slice<T>(&self, rows: Vec<T>) -> Page<T> {
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(self.offset())
            .take(self.limit())
            .collect();

        Page {
            items,
            total,
            page: self.page.max(1),
            size: self.limit() as u32,
        }
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Rows on this page
    pub items: Vec<T>,

    /// Total rows matching the query
    pub total: u64,

    /// Page number
    pub page: u32,

    /// Page size
    pub size: u32,
}

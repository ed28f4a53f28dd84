//! Pagination utilities for list endpoints
//!
//! Pages are 1-indexed. `page` defaults to 1 and `limit` to 10; values below 1
//! are rejected and `limit` is capped at [`MAX_LIMIT`].

use serde::Serialize;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Validated page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
}

impl PageRequest {
    /// Apply defaults, bounds and the limit cap
    ///
    /// # Examples
    /// ```
    /// use xplat_predict::pagination::PageRequest;
    ///
    /// let p = PageRequest::new(None, Some(500)).unwrap();
    /// assert_eq!(p.page, 1);
    /// assert_eq!(p.limit, 100);
    /// assert_eq!(p.offset(), 0);
    ///
    /// assert!(PageRequest::new(Some(0), None).is_err());
    /// ```
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Result<Self, String> {
        let page = page.unwrap_or(DEFAULT_PAGE);
        let limit = limit.unwrap_or(DEFAULT_LIMIT);

        if page < 1 {
            return Err(format!("page must be at least 1 (got {})", page));
        }
        if limit < 1 {
            return Err(format!("limit must be at least 1 (got {})", limit));
        }

        Ok(Self {
            page,
            limit: limit.min(MAX_LIMIT),
        })
    }

    /// Rows to skip for SQL OFFSET
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

/// Pagination metadata returned with every list response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub total_items: i64,
    pub item_count: i64,
    pub items_per_page: i64,
    pub total_pages: i64,
    pub current_page: i64,
}

impl PaginationMeta {
    pub fn new(request: PageRequest, total_items: i64, item_count: usize) -> Self {
        Self {
            total_items,
            item_count: item_count as i64,
            items_per_page: request.limit,
            total_pages: (total_items + request.limit - 1) / request.limit,
            current_page: request.page,
        }
    }
}

/// `{items, meta}` envelope
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T: Serialize> {
    pub items: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T: Serialize> Paginated<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total_items: i64) -> Self {
        let meta = PaginationMeta::new(request, total_items, items.len());
        Self { items, meta }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = PageRequest::new(None, None).unwrap();
        assert_eq!(p, PageRequest { page: 1, limit: 10 });
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn test_offset() {
        let p = PageRequest::new(Some(3), Some(25)).unwrap();
        assert_eq!(p.offset(), 50);
    }

    #[test]
    fn test_bounds_rejected() {
        assert!(PageRequest::new(Some(0), Some(10)).is_err());
        assert!(PageRequest::new(Some(-1), Some(10)).is_err());
        assert!(PageRequest::new(Some(1), Some(0)).is_err());
    }

    #[test]
    fn test_limit_capped() {
        assert_eq!(PageRequest::new(Some(1), Some(1000)).unwrap().limit, MAX_LIMIT);
    }

    #[test]
    fn test_meta_total_pages_rounds_up() {
        let request = PageRequest::new(Some(3), Some(10)).unwrap();
        let meta = PaginationMeta::new(request, 25, 5);
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.item_count, 5);
        assert_eq!(meta.current_page, 3);

        let empty = PaginationMeta::new(request, 0, 0);
        assert_eq!(empty.total_pages, 0);
    }

    #[test]
    fn test_meta_serializes_camel_case() {
        let meta = PaginationMeta::new(PageRequest::new(None, None).unwrap(), 11, 10);
        let value = serde_json::to_value(meta).unwrap();
        assert_eq!(value["totalItems"], 11);
        assert_eq!(value["itemCount"], 10);
        assert_eq!(value["itemsPerPage"], 10);
        assert_eq!(value["totalPages"], 2);
        assert_eq!(value["currentPage"], 1);
    }
}

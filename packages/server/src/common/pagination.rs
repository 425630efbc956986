//! Page-based pagination arguments for list endpoints.

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Validated page/limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageArgs {
    /// 1-based page number.
    pub page: i64,
    /// Rows per page, within `[1, MAX_PAGE_LIMIT]`.
    pub limit: i64,
}

impl PageArgs {
    /// Validate raw query values; `None` falls back to the defaults.
    pub fn validate(page: Option<i64>, limit: Option<i64>) -> Result<Self, String> {
        let page = page.unwrap_or(1);
        if page < 1 {
            return Err(format!("page must be >= 1, got {}", page));
        }
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(format!(
                "limit must be between 1 and {}, got {}",
                MAX_PAGE_LIMIT, limit
            ));
        }
        Ok(Self { page, limit })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

impl Default for PageArgs {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

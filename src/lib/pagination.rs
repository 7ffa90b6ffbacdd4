use actix_web::{http::StatusCode, HttpResponse};
use serde::Deserialize;

fn default_limit() -> i64 {
    20
}

fn default_page() -> i64 {
    1
}

#[derive(Deserialize, Clone, Copy)]
pub struct Paginator {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_page")]
    pub page: i64,
}

impl Default for Paginator {
    fn default() -> Self {
        Self { limit: default_limit(), page: default_page() }
    }
}

impl Paginator {
    pub fn offset(&self) -> i64 {
        (self.page - 1).max(0) * self.limit
    }
}

/// Single-key sort direction accepted by the world/game listing queries.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        Self::Desc
    }
}

impl SortDirection {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

pub fn new_paginated_response<T: serde::Serialize>(
    limit: i64,
    page: i64,
    count: i64,
    content: Vec<T>,
) -> HttpResponse {
    let first = (page - 1) * limit;
    let last = first + content.len() as i64;
    HttpResponse::build(StatusCode::PARTIAL_CONTENT)
        .header("content-range", format!("items {}-{}/{}", first, last, count))
        .json(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paginator_is_page_one_limit_twenty() {
        let p = Paginator::default();
        assert_eq!(p.limit, 20);
        assert_eq!(p.page, 1);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn offset_advances_by_limit_per_page() {
        let p = Paginator { limit: 10, page: 3 };
        assert_eq!(p.offset(), 20);
    }

    #[test]
    fn missing_query_params_fall_back_to_defaults() {
        let p: Paginator = serde_json::from_str("{}").unwrap();
        assert_eq!(p.limit, 20);
        assert_eq!(p.page, 1);
    }

    #[test]
    fn sort_direction_defaults_to_descending() {
        assert_eq!(SortDirection::default().as_sql(), "DESC");
        assert_eq!(SortDirection::Asc.as_sql(), "ASC");
    }
}

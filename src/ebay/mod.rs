pub mod auth;
pub mod browse;
pub mod config;

use crate::models::{ItemDetail, ItemSummary, Task};
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use auth::{AccessToken, AppKeys};
pub use browse::BrowseClient;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarketplaceError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited by marketplace")]
    RateLimited,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl MarketplaceError {
    pub fn from_status(status: StatusCode, detail: &str) -> Self {
        let detail: String = detail.chars().take(200).collect();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Auth(format!("HTTP {status}: {detail}"))
            }
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited,
            s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
                Self::Transient(format!("HTTP {status}"))
            }
            _ => Self::Malformed(format!("HTTP {status}: {detail}")),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, "")
        } else {
            // timeouts, connect errors, resets
            Self::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub keywords: String,
    pub category_ids: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub limit: u32,
}

impl SearchQuery {
    pub fn for_task(task: &Task, limit: u32) -> Self {
        Self {
            keywords: task.keywords.trim().to_string(),
            category_ids: task.filters.category_ids.clone(),
            min_price: task.filters.min_price,
            max_price: task.filters.max_price,
            limit,
        }
    }

    /// Browse API `filter` expression, if any bound is set.
    pub fn price_filter(&self, currency: &str) -> Option<String> {
        if self.min_price.is_none() && self.max_price.is_none() {
            return None;
        }
        let bound = |v: Option<f64>| v.map(|p| format!("{p:.2}")).unwrap_or_default();
        Some(format!(
            "price:[{}..{}],priceCurrency:{currency}",
            bound(self.min_price),
            bound(self.max_price)
        ))
    }
}

/// The three marketplace endpoints the worker consumes.
#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn exchange_token(&self, keys: &AppKeys) -> Result<AccessToken, MarketplaceError>;

    /// Newest-first summaries for the query.
    async fn search(
        &self,
        token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ItemSummary>, MarketplaceError>;

    async fn item_detail(&self, token: &str, item_id: &str)
    -> Result<ItemDetail, MarketplaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            MarketplaceError::from_status(StatusCode::UNAUTHORIZED, ""),
            MarketplaceError::Auth(_)
        ));
        assert_eq!(
            MarketplaceError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            MarketplaceError::RateLimited
        );
        assert!(matches!(
            MarketplaceError::from_status(StatusCode::BAD_GATEWAY, ""),
            MarketplaceError::Transient(_)
        ));
        assert!(matches!(
            MarketplaceError::from_status(StatusCode::NOT_FOUND, "gone"),
            MarketplaceError::Malformed(_)
        ));
    }

    #[test]
    fn price_filter_renders_open_bounds() {
        let query = SearchQuery {
            keywords: "ring".into(),
            category_ids: vec![],
            min_price: Some(25.0),
            max_price: None,
            limit: 50,
        };
        assert_eq!(
            query.price_filter("USD").as_deref(),
            Some("price:[25.00..],priceCurrency:USD")
        );
        let open = SearchQuery {
            min_price: None,
            ..query
        };
        assert!(open.price_filter("USD").is_none());
    }
}

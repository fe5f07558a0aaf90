#![allow(non_snake_case)]

use crate::ebay::auth::{AccessToken, AppKeys, exchange_app_token};
use crate::ebay::config::EbayConfig;
use crate::ebay::{Marketplace, MarketplaceError, SearchQuery};
use crate::models::{ItemDetail, ItemSpecs, ItemSummary, SellerInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_with::{DisplayFromStr, serde_as};
use tracing::warn;

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
struct WirePrice {
    #[serde_as(as = "DisplayFromStr")]
    value: f64,
    currency: String,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
struct WireSeller {
    username: Option<String>,
    feedbackScore: Option<i64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    feedbackPercentage: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireImage {
    imageUrl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireAspect {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireSummary {
    itemId: String,
    title: Option<String>,
    price: Option<WirePrice>,
    currentBidPrice: Option<WirePrice>,
    itemWebUrl: Option<String>,
    itemCreationDate: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    itemSummaries: Vec<WireSummary>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireDetail {
    itemId: String,
    title: Option<String>,
    price: Option<WirePrice>,
    currentBidPrice: Option<WirePrice>,
    condition: Option<String>,
    #[serde(default)]
    localizedAspects: Vec<WireAspect>,
    seller: Option<WireSeller>,
    itemWebUrl: Option<String>,
    image: Option<WireImage>,
    itemCreationDate: Option<DateTime<Utc>>,
}

impl TryFrom<WireSummary> for ItemSummary {
    type Error = MarketplaceError;

    fn try_from(wire: WireSummary) -> Result<Self, Self::Error> {
        let title = wire
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| MarketplaceError::Malformed(format!("{}: missing title", wire.itemId)))?;
        let price = wire
            .price
            .or(wire.currentBidPrice)
            .ok_or_else(|| MarketplaceError::Malformed(format!("{}: missing price", wire.itemId)))?;
        Ok(ItemSummary {
            item_id: wire.itemId,
            title,
            price: price.value,
            currency: price.currency,
            item_url: wire.itemWebUrl,
            listed_at: wire.itemCreationDate,
        })
    }
}

impl TryFrom<WireDetail> for ItemDetail {
    type Error = MarketplaceError;

    fn try_from(wire: WireDetail) -> Result<Self, Self::Error> {
        let title = wire
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| MarketplaceError::Malformed(format!("{}: missing title", wire.itemId)))?;
        let price = wire
            .price
            .or(wire.currentBidPrice)
            .ok_or_else(|| MarketplaceError::Malformed(format!("{}: missing price", wire.itemId)))?;
        Ok(ItemDetail {
            item_id: wire.itemId,
            title,
            price: price.value,
            currency: price.currency,
            condition: wire.condition,
            specs: flatten_aspects(wire.localizedAspects),
            seller: wire.seller.and_then(|s| {
                Some(SellerInfo {
                    username: s.username?,
                    feedback_score: s.feedbackScore,
                    feedback_percentage: s.feedbackPercentage,
                })
            }),
            item_url: wire.itemWebUrl,
            image_url: wire.image.and_then(|i| i.imageUrl),
            listed_at: wire.itemCreationDate,
        })
    }
}

/// Lower-cases aspect names; repeated names keep the first value.
fn flatten_aspects(aspects: Vec<WireAspect>) -> ItemSpecs {
    let mut specs = ItemSpecs::new();
    for aspect in aspects {
        let name = aspect.name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        specs.entry(name).or_insert_with(|| aspect.value.trim().to_string());
    }
    specs
}

/// eBay Browse API client.
#[derive(Debug, Clone)]
pub struct BrowseClient {
    http: Client,
    config: EbayConfig,
}

impl BrowseClient {
    pub fn new(http: Client, config: EbayConfig) -> Self {
        Self { http, config }
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, MarketplaceError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::from_status(status, &detail));
        }
        let body = response.text().await.map_err(MarketplaceError::from_reqwest)?;
        serde_json::from_str(&body).map_err(|err| MarketplaceError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl Marketplace for BrowseClient {
    async fn exchange_token(&self, keys: &AppKeys) -> Result<AccessToken, MarketplaceError> {
        exchange_app_token(&self.http, &self.config, keys).await
    }

    async fn search(
        &self,
        token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ItemSummary>, MarketplaceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("sort", "newlyListed".to_string()),
            ("limit", query.limit.to_string()),
        ];
        if !query.keywords.is_empty() {
            params.push(("q", query.keywords.clone()));
        }
        if !query.category_ids.is_empty() {
            params.push(("category_ids", query.category_ids.join(",")));
        }
        if let Some(filter) = query.price_filter(&self.config.currency) {
            params.push(("filter", filter));
        }

        let response = self
            .http
            .get(self.config.search_url())
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.config.marketplace_id)
            .query(&params)
            .send()
            .await
            .map_err(MarketplaceError::from_reqwest)?;

        let payload: SearchResponse = Self::read_json(response).await?;
        let summaries = payload
            .itemSummaries
            .into_iter()
            .filter_map(|wire| match ItemSummary::try_from(wire) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    warn!(target = "hermes.ebay", error = %err, "search_summary_skipped");
                    None
                }
            })
            .collect();
        Ok(summaries)
    }

    async fn item_detail(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<ItemDetail, MarketplaceError> {
        let response = self
            .http
            .get(self.config.item_url(item_id))
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.config.marketplace_id)
            .send()
            .await
            .map_err(MarketplaceError::from_reqwest)?;
        let wire: WireDetail = Self::read_json(response).await?;
        ItemDetail::try_from(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_payload_skips_incomplete_summaries() {
        let raw = serde_json::json!({
            "total": 2,
            "itemSummaries": [
                {
                    "itemId": "v1|111|0",
                    "title": "14k Gold Ring",
                    "price": { "value": "129.99", "currency": "USD" },
                    "itemWebUrl": "https://www.ebay.com/itm/111",
                    "itemCreationDate": "2026-10-14T18:22:05.000Z"
                },
                { "itemId": "v1|222|0", "title": "No price" }
            ]
        });
        let payload: SearchResponse = serde_json::from_value(raw).expect("payload");
        let items: Vec<ItemSummary> = payload
            .itemSummaries
            .into_iter()
            .filter_map(|w| ItemSummary::try_from(w).ok())
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 129.99);
        assert!(items[0].listed_at.is_some());
    }

    #[test]
    fn detail_payload_flattens_aspects() {
        let raw = serde_json::json!({
            "itemId": "v1|333|0",
            "title": "Sapphire Ring",
            "currentBidPrice": { "value": "45.00", "currency": "USD" },
            "condition": "Pre-owned",
            "localizedAspects": [
                { "type": "STRING", "name": "Main Stone", "value": "Sapphire" },
                { "type": "STRING", "name": "Main Stone Creation", "value": "Natural" },
                { "type": "STRING", "name": "main stone", "value": "Diamond" }
            ],
            "seller": { "username": "gemdealer", "feedbackScore": 512, "feedbackPercentage": "99.8" }
        });
        let wire: WireDetail = serde_json::from_value(raw).expect("wire");
        let detail = ItemDetail::try_from(wire).expect("detail");
        assert_eq!(detail.price, 45.0);
        assert_eq!(detail.specs.get("main stone").map(String::as_str), Some("Sapphire"));
        assert_eq!(detail.specs.len(), 2);
        let seller = detail.seller.expect("seller");
        assert_eq!(seller.feedback_percentage, Some(99.8));
    }

    #[test]
    fn non_numeric_price_is_a_decode_error() {
        let raw = serde_json::json!({
            "itemId": "v1|444|0",
            "title": "Ring",
            "price": { "value": "n/a", "currency": "USD" }
        });
        assert!(serde_json::from_value::<WireDetail>(raw).is_err());
    }
}

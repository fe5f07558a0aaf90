use crate::ebay::MarketplaceError;
use crate::ebay::config::{BROWSE_SCOPE, EbayConfig};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;

/// Application keyset for one credential.
#[derive(Clone, PartialEq, Eq)]
pub struct AppKeys {
    pub app_id: String,
    pub cert_id: String,
}

impl fmt::Debug for AppKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKeys")
            .field("app_id", &self.app_id)
            .field("cert_id", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    7200
}

fn basic_auth_header(keys: &AppKeys) -> Result<String, MarketplaceError> {
    if keys.app_id.is_empty() || keys.cert_id.is_empty() {
        return Err(MarketplaceError::Auth("missing app credentials".into()));
    }
    let raw = format!("{}:{}", keys.app_id, keys.cert_id);
    Ok(format!("Basic {}", BASE64.encode(raw)))
}

/// Client-credentials grant: exchanges an app keyset for a short-lived bearer token.
pub async fn exchange_app_token(
    http: &Client,
    config: &EbayConfig,
    keys: &AppKeys,
) -> Result<AccessToken, MarketplaceError> {
    let authorization = basic_auth_header(keys)?;
    let body = [
        ("grant_type", "client_credentials"),
        ("scope", BROWSE_SCOPE),
    ];
    let response = http
        .post(config.token_url())
        .header(reqwest::header::AUTHORIZATION, authorization)
        .form(&body)
        .send()
        .await
        .map_err(MarketplaceError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(MarketplaceError::from_status(status, &detail));
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| MarketplaceError::Malformed(err.to_string()))?;
    Ok(AccessToken {
        value: payload.access_token,
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secret() {
        let keys = AppKeys {
            app_id: "app-1".into(),
            cert_id: "super-secret".into(),
        };
        let rendered = format!("{keys:?}");
        assert!(rendered.contains("app-1"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn missing_keys_are_an_auth_failure() {
        let keys = AppKeys {
            app_id: String::new(),
            cert_id: "x".into(),
        };
        assert!(matches!(
            basic_auth_header(&keys),
            Err(MarketplaceError::Auth(_))
        ));
    }

    #[test]
    fn token_freshness_honors_margin() {
        let now = Utc::now();
        let token = AccessToken {
            value: "t".into(),
            expires_at: now + Duration::seconds(200),
        };
        assert!(token.is_fresh(now, Duration::seconds(60)));
        assert!(!token.is_fresh(now, Duration::seconds(300)));
    }
}

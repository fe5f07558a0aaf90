use serde::Deserialize;
use std::str::FromStr;

pub const BROWSE_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EbayEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl FromStr for EbayEnvironment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "SANDBOX" => Ok(Self::Sandbox),
            "PROD" | "PRODUCTION" => Ok(Self::Production),
            other => Err(format!("unknown eBay environment `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EbayConfig {
    pub environment: EbayEnvironment,
    pub marketplace_id: String,
    pub currency: String,
}

impl Default for EbayConfig {
    fn default() -> Self {
        Self {
            environment: EbayEnvironment::Sandbox,
            marketplace_id: "EBAY_US".to_string(),
            currency: "USD".to_string(),
        }
    }
}

impl EbayConfig {
    pub fn root(&self) -> &'static str {
        match self.environment {
            EbayEnvironment::Production => "https://api.ebay.com",
            EbayEnvironment::Sandbox => "https://api.sandbox.ebay.com",
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/identity/v1/oauth2/token", self.root())
    }

    pub fn search_url(&self) -> String {
        format!("{}/buy/browse/v1/item_summary/search", self.root())
    }

    pub fn item_url(&self, item_id: &str) -> String {
        format!(
            "{}/buy/browse/v1/item/{}",
            self.root(),
            urlencoding::encode(item_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ids_are_path_encoded() {
        let config = EbayConfig {
            environment: EbayEnvironment::Production,
            ..EbayConfig::default()
        };
        assert_eq!(
            config.item_url("v1|1234|0"),
            "https://api.ebay.com/buy/browse/v1/item/v1%7C1234%7C0"
        );
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!("prod".parse::<EbayEnvironment>(), Ok(EbayEnvironment::Production));
        assert_eq!("Sandbox".parse::<EbayEnvironment>(), Ok(EbayEnvironment::Sandbox));
        assert!("staging".parse::<EbayEnvironment>().is_err());
    }
}

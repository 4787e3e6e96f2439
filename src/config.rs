use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// How users are told apart on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Addressing {
    /// One derived address per user, allocated by sequential index.
    Derived,
    /// One shared address; users are identified by destination tag.
    Tagged { shared_address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub native_asset: String,
    /// Token assets received on the native asset's deposit address.
    #[serde(default)]
    pub tokens: Vec<String>,
    pub addressing: Addressing,
}

impl ChainConfig {
    pub fn supports(&self, asset: &str) -> bool {
        let asset = asset.trim().to_ascii_uppercase();
        self.native_asset == asset || self.tokens.iter().any(|t| *t == asset)
    }

    pub fn shared_address(&self) -> Option<&str> {
        match &self.addressing {
            Addressing::Tagged { shared_address } if !shared_address.is_empty() => {
                Some(shared_address)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Confirmations at which a deposit is treated as final.
    pub confirmation_threshold: u64,
    pub maintenance_margin_ratio: Decimal,
    pub max_leverage: u32,
    pub reconcile_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub oracle_timeout_secs: u64,
    /// Prices older than this are treated as missing.
    pub price_max_age_secs: u64,
    pub allocation_attempts: u32,
    pub tag_attempts: u32,
    pub destination_tag_min: u32,
    pub destination_tag_max: u32,
    pub chains: Vec<ChainConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmation_threshold: 12,
            maintenance_margin_ratio: Decimal::new(5, 3),
            max_leverage: 125,
            reconcile_interval_secs: 30,
            monitor_interval_secs: 5,
            oracle_timeout_secs: 10,
            price_max_age_secs: 60,
            allocation_attempts: 5,
            tag_attempts: 10,
            destination_tag_min: 100_000,
            destination_tag_max: 999_999,
            chains: vec![
                ChainConfig {
                    name: "ethereum".to_string(),
                    native_asset: "ETH".to_string(),
                    tokens: vec!["USDT".to_string()],
                    addressing: Addressing::Derived,
                },
                ChainConfig {
                    name: "xrp".to_string(),
                    native_asset: "XRP".to_string(),
                    tokens: Vec::new(),
                    addressing: Addressing::Tagged {
                        shared_address: String::new(),
                    },
                },
            ],
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Defaults overridden by `KASSA_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let xrp_address = env::var("KASSA_XRP_SHARED_ADDRESS").unwrap_or_default();
        let chains = defaults
            .chains
            .into_iter()
            .map(|mut chain| {
                if let Addressing::Tagged { shared_address } = &mut chain.addressing {
                    if chain.name == "xrp" && !xrp_address.is_empty() {
                        *shared_address = xrp_address.trim().to_string();
                    }
                }
                chain
            })
            .collect();

        Self {
            confirmation_threshold: env_or(
                "KASSA_CONFIRMATION_THRESHOLD",
                defaults.confirmation_threshold,
            ),
            maintenance_margin_ratio: env_or(
                "KASSA_MAINTENANCE_MARGIN",
                defaults.maintenance_margin_ratio,
            ),
            max_leverage: env_or("KASSA_MAX_LEVERAGE", defaults.max_leverage),
            reconcile_interval_secs: env_or(
                "KASSA_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            monitor_interval_secs: env_or(
                "KASSA_MONITOR_INTERVAL_SECS",
                defaults.monitor_interval_secs,
            ),
            oracle_timeout_secs: env_or("KASSA_ORACLE_TIMEOUT_SECS", defaults.oracle_timeout_secs),
            price_max_age_secs: env_or("KASSA_PRICE_MAX_AGE_SECS", defaults.price_max_age_secs),
            allocation_attempts: env_or(
                "KASSA_ALLOCATION_ATTEMPTS",
                defaults.allocation_attempts,
            ),
            tag_attempts: env_or("KASSA_TAG_ATTEMPTS", defaults.tag_attempts),
            destination_tag_min: env_or("KASSA_DESTINATION_TAG_MIN", defaults.destination_tag_min),
            destination_tag_max: env_or("KASSA_DESTINATION_TAG_MAX", defaults.destination_tag_max),
            chains,
        }
    }

    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.confirmation_threshold == 0 {
            return Err(Error::validation("confirmation_threshold must be positive"));
        }
        if self.max_leverage == 0 {
            return Err(Error::validation("max_leverage must be at least 1"));
        }
        if self.maintenance_margin_ratio.is_sign_negative()
            || self.maintenance_margin_ratio >= Decimal::ONE
        {
            return Err(Error::validation("maintenance_margin_ratio must be in [0, 1)"));
        }
        if self.destination_tag_min > self.destination_tag_max {
            return Err(Error::validation("destination tag range is empty"));
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        let name = name.trim();
        self.chains.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn price_max_age(&self) -> Duration {
        Duration::from_secs(self.price_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.confirmation_threshold, 12);
        assert_eq!(config.maintenance_margin_ratio, dec!(0.005));
        assert_eq!(config.max_leverage, 125);
        assert!(config.validate().is_ok());

        let eth = config.chain("Ethereum").unwrap();
        assert!(eth.supports("usdt"));
        assert!(!eth.supports("XRP"));
        assert_eq!(config.chain("xrp").unwrap().shared_address(), None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(
            r#"{
                "confirmation_threshold": 6,
                "chains": [
                    {"name": "xrp", "native_asset": "XRP",
                     "addressing": {"type": "tagged", "shared_address": "rSHARED"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.confirmation_threshold, 6);
        assert_eq!(config.max_leverage, 125);
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chain("xrp").unwrap().shared_address(), Some("rSHARED"));
    }

    #[test]
    fn test_from_json_rejects_bad_range() {
        let err = EngineConfig::from_json(
            r#"{"destination_tag_min": 10, "destination_tag_max": 1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

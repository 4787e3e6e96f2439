//! Latest traded price per pair.
//!
//! The book is explicit process state owned by the [`crate::Engine`]: it is
//! populated at startup or by a refresh loop and read through the engine.
//! A price older than `max_age` reads as absent; callers never fall back to
//! a made-up value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{Error, pair::TradingPair};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// External market-data provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Last traded price for each requested pair the source knows about.
    async fn fetch(&self, pairs: &[TradingPair]) -> Result<Vec<(TradingPair, Decimal)>, Error>;
}

pub struct PriceBook {
    max_age: Duration,
    quotes: RwLock<HashMap<TradingPair, PriceQuote>>,
}

impl PriceBook {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            quotes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set(&self, pair: TradingPair, price: Decimal) {
        self.set_at(pair, price, Utc::now()).await;
    }

    pub async fn set_at(&self, pair: TradingPair, price: Decimal, observed_at: DateTime<Utc>) {
        if price <= Decimal::ZERO {
            warn!(pair = %pair, price = %price, "ignoring non-positive price");
            return;
        }
        self.quotes
            .write()
            .await
            .insert(pair, PriceQuote { price, observed_at });
    }

    /// Fresh price, or `None` if unknown or stale.
    pub async fn get(&self, pair: &TradingPair) -> Option<Decimal> {
        let quote = self.quotes.read().await.get(pair).copied()?;
        let age = Utc::now().signed_duration_since(quote.observed_at);
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        if age > max_age {
            debug!(pair = %pair, age_secs = age.num_seconds(), "price is stale");
            return None;
        }
        Some(quote.price)
    }

    pub async fn snapshot(&self) -> HashMap<TradingPair, PriceQuote> {
        self.quotes.read().await.clone()
    }

    pub async fn pairs(&self) -> Vec<TradingPair> {
        self.quotes.read().await.keys().cloned().collect()
    }

    /// Pull fresh prices for `pairs`. A failed fetch leaves the book as it
    /// was; staleness takes care of prices that stop updating.
    pub async fn refresh(
        &self,
        source: &dyn PriceSource,
        pairs: &[TradingPair],
    ) -> Result<usize, Error> {
        let prices = match source.fetch(pairs).await {
            Ok(prices) => prices,
            Err(e) => {
                counter!("kassa.oracle.failures", "chain" => "prices").increment(1);
                warn!(error = %e, "price refresh failed");
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut updated = 0;
        for (pair, price) in prices {
            if price > Decimal::ZERO {
                self.set_at(pair, price, now).await;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct FixedSource(Vec<(TradingPair, Decimal)>);

    #[async_trait]
    impl PriceSource for FixedSource {
        async fn fetch(
            &self,
            pairs: &[TradingPair],
        ) -> Result<Vec<(TradingPair, Decimal)>, Error> {
            Ok(self
                .0
                .iter()
                .filter(|(p, _)| pairs.contains(p))
                .cloned()
                .collect())
        }
    }

    struct DownSource;

    #[async_trait]
    impl PriceSource for DownSource {
        async fn fetch(&self, _: &[TradingPair]) -> Result<Vec<(TradingPair, Decimal)>, Error> {
            Err(Error::Oracle("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_stale_price_reads_absent() {
        let book = PriceBook::new(Duration::from_secs(30));
        let pair = TradingPair::new("BTC", "USDT");

        book.set_at(pair.clone(), dec!(50000), Utc::now() - chrono::Duration::seconds(31))
            .await;
        assert_eq!(book.get(&pair).await, None);

        book.set(pair.clone(), dec!(50100)).await;
        assert_eq!(book.get(&pair).await, Some(dec!(50100)));
    }

    #[tokio::test]
    async fn test_refresh_keeps_book_on_failure() {
        let book = PriceBook::default();
        let btc = TradingPair::new("BTC", "USDT");
        let eth = TradingPair::new("ETH", "USDT");

        let source = FixedSource(vec![(btc.clone(), dec!(1)), (eth.clone(), dec!(0))]);
        let updated = book
            .refresh(&source, &[btc.clone(), eth.clone()])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(book.get(&eth).await, None);

        assert!(book.refresh(&DownSource, &[btc.clone()]).await.is_err());
        assert_eq!(book.get(&btc).await, Some(dec!(1)));
    }
}

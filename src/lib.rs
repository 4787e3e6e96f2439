//! # Kassa
//!
//! Kassa is the balance core of a crypto exchange: one authoritative
//! available/locked balance per (user, asset, account type), an append-only
//! ledger describing every change to it, and the operations that move money
//! between the two.
//!
//! ## What's inside
//!
//! ### Atomic plans
//! Every operation builds an execution plan (balance ops, ledger entries and
//! guarded record writes) and hands it to the store in one call. Either all
//! of it lands or none of it does; a balance mutation without its ledger
//! entry cannot be observed.
//!
//! ```rust,ignore
//! Ledger::atomic(engine.ledger(), |tx| async move {
//!     tx.put_record(order.to_record()?, Expect::Absent)?;
//!     tx.lock(&key, dec!(500), Reference::order(order.id), json!({}))?;
//!     Ok::<_, Error>(())
//! })
//! .await?;
//! ```
//!
//! ### Operations
//! - **Transfer** between funding, spot and perp accounts of one user
//! - **Spot orders** lock on placement and unlock on cancel
//! - **Perpetual positions** lock margin at open and release it at close,
//!   with liquidation price computed up front
//! - **Deposits** are observed from chain oracles, tracked through their
//!   confirmations and credited exactly once
//! - **Balance adjustment** for operators, recorded as an `adjustment` entry
//!
//! Status transitions (`open → canceled`, `open → closed`,
//! `confirmed → credited`) are conditional writes, so two concurrent
//! requests for the same transition resolve to one winner.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kassa::{Engine, EngineConfig, ledger::PostgresAdapter};
//!
//! let adapter = PostgresAdapter::from_pool(pool);
//! adapter.init_schema().await?;
//!
//! let engine = Engine::builder(Box::new(adapter))
//!     .config(EngineConfig::from_env())
//!     .chain_oracle(Arc::new(EthereumOracle::new(rpc)))
//!     .deriver(Arc::new(deriver))
//!     .build()?;
//! ```
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                  |
//! |------------|---------|------------------------------|
//! | `postgres` | ✓       | PostgreSQL ledger via sqlx   |

pub mod admin;
pub mod config;
pub mod deposits;
pub mod error;
pub mod monitor;
pub mod pair;
pub mod perp;
pub mod pricing;
pub mod record;
pub mod spot;
pub mod transfer;

pub use ledger;

use metrics::histogram;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use ledger::{
    AccountType, Balance, BalanceKey, EntryFilter, LedgerAdapter, LedgerContext, LedgerEntry,
    RecordQuery,
};

pub use crate::admin::{AdjustBalanceRequest, BalanceAdjustment};
pub use crate::config::{Addressing, ChainConfig, EngineConfig};
pub use crate::deposits::addresses::{AddressDeriver, DepositAddress, DepositTarget, DestinationTag};
pub use crate::deposits::reconciler::{DepositReconciler, PollReport};
pub use crate::deposits::{
    ChainOracle, ChainTransfer, CreditOutcome, Deposit, DepositCheck, DepositStatus,
    VerifyDepositRequest,
};
pub use crate::error::Error;
pub use crate::monitor::{MonitorReport, PositionMonitor};
pub use crate::pair::TradingPair;
pub use crate::perp::{
    CloseReason, OpenPositionRequest, PerpOrder, PerpPosition, PositionSide, PositionStatus,
};
pub use crate::pricing::{PriceBook, PriceQuote, PriceSource};
pub use crate::record::Record;
pub use crate::spot::{Order, OrderSide, OrderStatus, OrderType, PlaceOrderRequest};
pub use crate::transfer::{Transfer, TransferRequest};

/// Entry point for every operation. Cheap to clone; clones share the
/// store, the price book and the registered oracles.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Kassa>,
}

pub struct Kassa {
    ledger: LedgerContext,
    config: EngineConfig,
    prices: Arc<PriceBook>,
    deriver: Option<Arc<dyn AddressDeriver>>,
    oracles: HashMap<String, Arc<dyn ChainOracle>>,
}

pub struct EngineBuilder {
    adapter: Arc<dyn LedgerAdapter>,
    config: EngineConfig,
    prices: Option<Arc<PriceBook>>,
    deriver: Option<Arc<dyn AddressDeriver>>,
    oracles: HashMap<String, Arc<dyn ChainOracle>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a price book that is refreshed elsewhere.
    pub fn prices(mut self, prices: Arc<PriceBook>) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn deriver(mut self, deriver: Arc<dyn AddressDeriver>) -> Self {
        self.deriver = Some(deriver);
        self
    }

    /// Register the oracle for the chain it reports through `chain()`.
    pub fn chain_oracle(mut self, oracle: Arc<dyn ChainOracle>) -> Self {
        self.oracles
            .insert(oracle.chain().trim().to_ascii_lowercase(), oracle);
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        self.config.validate()?;
        let prices = self
            .prices
            .unwrap_or_else(|| Arc::new(PriceBook::new(self.config.price_max_age())));

        Ok(Engine {
            inner: Arc::new(Kassa {
                ledger: LedgerContext::new(self.adapter),
                config: self.config,
                prices,
                deriver: self.deriver,
                oracles: self.oracles,
            }),
        })
    }
}

impl Engine {
    /// An engine with no oracles or address deriver attached.
    pub fn new(adapter: Box<dyn LedgerAdapter>, config: EngineConfig) -> Result<Self, Error> {
        Self::builder(adapter).config(config).build()
    }

    pub fn builder(adapter: Box<dyn LedgerAdapter>) -> EngineBuilder {
        EngineBuilder {
            adapter: Arc::from(adapter),
            config: EngineConfig::default(),
            prices: None,
            deriver: None,
            oracles: HashMap::new(),
        }
    }

    pub fn ledger(&self) -> &LedgerContext {
        &self.inner.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn prices(&self) -> &PriceBook {
        &self.inner.prices
    }

    pub(crate) fn deriver(&self) -> Option<&Arc<dyn AddressDeriver>> {
        self.inner.deriver.as_ref()
    }

    pub fn chain_oracle(&self, chain: &str) -> Option<Arc<dyn ChainOracle>> {
        self.inner
            .oracles
            .get(&chain.trim().to_ascii_lowercase())
            .cloned()
    }

    // ==================== Records ====================

    pub(crate) async fn fetch<T: Record>(&self, id: &str) -> Result<Option<T>, Error> {
        let record = self.ledger().adapter().get_record(T::KIND, id).await?;
        record.map(T::from_record).transpose()
    }

    pub(crate) async fn find_by_key<T: Record>(&self, key: &str) -> Result<Option<T>, Error> {
        let record = self.ledger().adapter().find_record_by_key(T::KIND, key).await?;
        record.map(T::from_record).transpose()
    }

    pub(crate) async fn query<T: Record>(&self, query: &RecordQuery) -> Result<Vec<T>, Error> {
        let start = Instant::now();
        let records = self.ledger().adapter().query_records(query).await?;
        histogram!("kassa.query.duration_ms", "kind" => T::KIND)
            .record(start.elapsed().as_millis() as f64);
        records.into_iter().map(T::from_record).collect()
    }

    // ==================== Balances ====================

    /// Missing rows read as zero.
    pub async fn balance(
        &self,
        user_id: Uuid,
        asset: &str,
        account_type: AccountType,
    ) -> Result<Balance, Error> {
        let key = BalanceKey::new(user_id, asset, account_type);
        Ok(self.ledger().adapter().get_balance(&key).await?)
    }

    pub async fn balances(
        &self,
        user_id: Uuid,
        account_type: Option<AccountType>,
    ) -> Result<Vec<Balance>, Error> {
        Ok(self
            .ledger()
            .adapter()
            .get_balances(user_id, account_type)
            .await?)
    }

    /// Newest first.
    pub async fn ledger_entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>, Error> {
        let start = Instant::now();
        let entries = self.ledger().adapter().get_entries(filter).await?;
        histogram!("kassa.query.duration_ms", "kind" => "ledger_entry")
            .record(start.elapsed().as_millis() as f64);
        Ok(entries)
    }
}

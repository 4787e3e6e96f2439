#![allow(dead_code)]

use async_trait::async_trait;
use kassa::{
    AddressDeriver, AdjustBalanceRequest, ChainOracle, ChainTransfer, Engine, EngineConfig, Error,
    ledger::{AccountType, MemoryAdapter},
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const XRP_SHARED: &str = "rKassaSharedDepositAddress";

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    for chain in &mut config.chains {
        if let kassa::Addressing::Tagged { shared_address } = &mut chain.addressing {
            *shared_address = XRP_SHARED.to_string();
        }
    }
    config
}

pub fn engine() -> Engine {
    Engine::new(Box::new(MemoryAdapter::new()), config()).unwrap()
}

pub struct Harness {
    pub engine: Engine,
    pub eth: Arc<MockOracle>,
    pub xrp: Arc<MockOracle>,
}

pub fn harness() -> Harness {
    let eth = Arc::new(MockOracle::new("ethereum"));
    let xrp = Arc::new(MockOracle::new("xrp"));
    let engine = Engine::builder(Box::new(MemoryAdapter::new()))
        .config(config())
        .deriver(Arc::new(SequentialDeriver))
        .chain_oracle(eth.clone())
        .chain_oracle(xrp.clone())
        .build()
        .unwrap();
    Harness { engine, eth, xrp }
}

/// Set a user's available balance through the admin path.
pub async fn seed(engine: &Engine, user_id: Uuid, asset: &str, account: AccountType, amount: Decimal) {
    engine
        .adjust_balance(AdjustBalanceRequest {
            user_id,
            asset: asset.to_string(),
            account_type: account,
            available: amount,
            locked: Decimal::ZERO,
            reason: Some("test seed".to_string()),
            admin_id: None,
        })
        .await
        .unwrap();
}

pub async fn available(engine: &Engine, user_id: Uuid, asset: &str, account: AccountType) -> Decimal {
    engine.balance(user_id, asset, account).await.unwrap().available
}

pub async fn locked(engine: &Engine, user_id: Uuid, asset: &str, account: AccountType) -> Decimal {
    engine.balance(user_id, asset, account).await.unwrap().locked
}

pub struct SequentialDeriver;

impl AddressDeriver for SequentialDeriver {
    fn derive(&self, chain: &str, index: u32) -> Result<String, Error> {
        Ok(format!("0x{chain}{index:036x}"))
    }
}

/// Chain double: transfers keyed by recipient address.
pub struct MockOracle {
    chain: String,
    transfers: Mutex<HashMap<String, Vec<ChainTransfer>>>,
    failing: Mutex<bool>,
}

impl MockOracle {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            transfers: Mutex::new(HashMap::new()),
            failing: Mutex::new(false),
        }
    }

    /// Add a transfer, or replace the one with the same hash.
    pub fn report(&self, transfer: ChainTransfer) {
        let mut transfers = self.transfers.lock().unwrap();
        let list = transfers.entry(transfer.to_address.clone()).or_default();
        list.retain(|t| t.tx_hash != transfer.tx_hash);
        list.push(transfer);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn check(&self) -> Result<(), Error> {
        if *self.failing.lock().unwrap() {
            return Err(Error::Oracle(format!("{} node unavailable", self.chain)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainOracle for MockOracle {
    fn chain(&self) -> &str {
        &self.chain
    }

    async fn transfers_to(&self, address: &str) -> Result<Vec<ChainTransfer>, Error> {
        self.check()?;
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn transfer_by_hash(&self, tx_hash: &str) -> Result<Option<ChainTransfer>, Error> {
        self.check()?;
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|t| t.tx_hash.eq_ignore_ascii_case(tx_hash))
            .cloned())
    }
}

pub fn transfer(tx_hash: &str, asset: &str, to: &str, amount: Decimal, confirmations: u64) -> ChainTransfer {
    ChainTransfer {
        tx_hash: tx_hash.to_string(),
        asset: asset.to_string(),
        from_address: "0xsender".to_string(),
        to_address: to.to_string(),
        amount,
        confirmations,
        finalized: false,
        destination_tag: None,
        failed: false,
        block_time: None,
    }
}

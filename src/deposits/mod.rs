//! On-chain deposits: observation, confirmation tracking and the one-time
//! credit into the funding account.
//!
//! A deposit is keyed by `(chain, tx_hash)`. Its status only moves forward
//! (`pending → detected → confirmed → credited`); confirmations follow the
//! latest observation. Crediting is guarded twice: the record transition is
//! conditioned on the stored status still being `confirmed`, and the ledger
//! refuses a second `deposit_credit` entry for the same transaction.

pub mod addresses;
pub mod reconciler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{BalanceKey, Expect, Ledger, LedgerError, RecordQuery};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Addressing, ChainConfig};
use crate::{Engine, Error, Record};
use addresses::{DepositAddress, DestinationTag};

/// Attempts at writing an observation before giving up on a contended row.
const OBSERVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Detected,
    Confirmed,
    Credited,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Detected => "detected",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Credited => "credited",
        }
    }

    /// Status implied by an observation. `finalized` covers ledgers that
    /// report validation instead of a confirmation count.
    pub fn from_confirmations(confirmations: u64, finalized: bool, threshold: u64) -> Self {
        if finalized || confirmations >= threshold {
            DepositStatus::Confirmed
        } else if confirmations > 0 {
            DepositStatus::Detected
        } else {
            DepositStatus::Pending
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer as reported by a chain oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransfer {
    pub tx_hash: String,
    pub asset: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub confirmations: u64,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub destination_tag: Option<u32>,
    /// The transaction executed with an error.
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub block_time: Option<DateTime<Utc>>,
}

impl ChainTransfer {
    pub fn is_creditable(&self) -> bool {
        !self.failed && self.amount > Decimal::ZERO
    }
}

/// Read-only view of one chain. Implementations are eventually consistent
/// and are re-polled; they never see a balance lock.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    fn chain(&self) -> &str;

    /// Recent transfers received by `address`.
    async fn transfers_to(&self, address: &str) -> Result<Vec<ChainTransfer>, Error>;

    async fn transfer_by_hash(&self, tx_hash: &str) -> Result<Option<ChainTransfer>, Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub chain: String,
    pub tx_hash: String,
    pub user_id: Uuid,
    pub asset: String,
    pub to_address: String,
    pub from_address: String,
    pub amount: Decimal,
    pub status: DepositStatus,
    pub confirmations: u64,
    pub destination_tag: Option<u32>,
    #[serde(default)]
    pub metadata: Value,
    pub detected_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub credited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn normalize_hash(tx_hash: &str) -> String {
    tx_hash.trim().to_ascii_lowercase()
}

impl Deposit {
    pub fn key(chain: &str, tx_hash: &str) -> String {
        format!("{}:{}", chain.trim().to_ascii_lowercase(), normalize_hash(tx_hash))
    }

    fn observed(
        chain: &str,
        owner: Uuid,
        transfer: &ChainTransfer,
        status: DepositStatus,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let seen_at = transfer.block_time.unwrap_or(now);
        Self {
            chain: chain.to_ascii_lowercase(),
            tx_hash: normalize_hash(&transfer.tx_hash),
            user_id: owner,
            asset: transfer.asset.trim().to_ascii_uppercase(),
            to_address: transfer.to_address.clone(),
            from_address: transfer.from_address.clone(),
            amount: transfer.amount,
            status,
            confirmations: transfer.confirmations,
            destination_tag: transfer.destination_tag,
            metadata,
            detected_at: (status >= DepositStatus::Detected).then_some(seen_at),
            confirmed_at: (status >= DepositStatus::Confirmed).then_some(now),
            credited_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a later observation in. Returns `None` when nothing changed.
    fn merge(
        &self,
        transfer: &ChainTransfer,
        status: DepositStatus,
        metadata: &Value,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let mut next = self.clone();
        next.status = self.status.max(status);
        next.confirmations = transfer.confirmations;
        if self.status < DepositStatus::Confirmed {
            next.amount = transfer.amount;
        }
        if next.status >= DepositStatus::Detected && next.detected_at.is_none() {
            next.detected_at = Some(transfer.block_time.unwrap_or(now));
        }
        if next.status >= DepositStatus::Confirmed && next.confirmed_at.is_none() {
            next.confirmed_at = Some(now);
        }
        merge_metadata(&mut next.metadata, metadata);

        if next == *self {
            return None;
        }
        next.updated_at = now;
        Some(next)
    }
}

fn merge_metadata(target: &mut Value, extra: &Value) {
    match (target, extra) {
        (Value::Object(target), Value::Object(extra)) => {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        (target, extra) if !extra.is_null() => *target = extra.clone(),
        _ => {}
    }
}

impl Record for Deposit {
    const KIND: &'static str = "deposit";

    fn record_id(&self) -> String {
        Deposit::key(&self.chain, &self.tx_hash)
    }

    fn owner(&self) -> Uuid {
        self.user_id
    }

    fn status(&self) -> String {
        self.status.as_str().to_string()
    }

    fn partition(&self) -> String {
        self.chain.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited,
    /// Already credited earlier; nothing changed.
    AlreadyCredited,
    NotConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyDepositRequest {
    pub chain: String,
    pub tx_hash: String,
    #[serde(default)]
    pub asset: Option<String>,
    /// Amount the user says they sent. Recorded, never trusted.
    #[serde(default)]
    pub claimed_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepositCheck {
    pub deposit: Deposit,
    pub outcome: CreditOutcome,
}

impl Engine {
    pub(crate) fn chain_config(&self, chain: &str) -> Result<&ChainConfig, Error> {
        self.config()
            .chain(chain)
            .ok_or_else(|| Error::validation(format!("unsupported chain: {chain}")))
    }

    /// Run an oracle call under the configured timeout, counting failures.
    pub(crate) async fn oracle_call<T>(
        &self,
        chain: &str,
        call: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.config().oracle_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                counter!("kassa.oracle.failures", "chain" => chain.to_string()).increment(1);
                warn!(chain, error = %e, "chain oracle call failed");
                Err(e)
            }
            Err(_) => {
                counter!("kassa.oracle.failures", "chain" => chain.to_string()).increment(1);
                warn!(chain, "chain oracle call timed out");
                Err(Error::Oracle(format!("{chain} oracle timed out")))
            }
        }
    }

    /// Upsert the deposit row for an observed transfer. Status never moves
    /// backwards; a row owned by another user is left untouched.
    pub async fn record_observation(
        &self,
        chain: &str,
        owner: Uuid,
        transfer: &ChainTransfer,
        metadata: Value,
    ) -> Result<Deposit, Error> {
        let threshold = self.config().confirmation_threshold;
        let observed =
            DepositStatus::from_confirmations(transfer.confirmations, transfer.finalized, threshold);
        let id = Deposit::key(chain, &transfer.tx_hash);

        for attempt in 1..=OBSERVE_ATTEMPTS {
            let now = Utc::now();
            let (next, expect) = match self.fetch::<Deposit>(&id).await? {
                None => (
                    Deposit::observed(chain, owner, transfer, observed, metadata.clone(), now),
                    Expect::Absent,
                ),
                Some(current) if current.user_id != owner => {
                    warn!(deposit = %id, stored_owner = %current.user_id, observed_owner = %owner, "deposit owner mismatch, keeping stored row");
                    return Ok(current);
                }
                Some(current) => match current.merge(transfer, observed, &metadata, now) {
                    None => return Ok(current),
                    Some(next) => {
                        let expect = Expect::Status(current.status.as_str().to_string());
                        (next, expect)
                    }
                },
            };

            let record = next.to_record()?;
            let result = Ledger::atomic(self.ledger(), |tx| async move {
                tx.put_record(record, expect)?;
                Ok::<_, Error>(())
            })
            .await;

            match result {
                Ok(_) => {
                    debug!(deposit = %id, status = %next.status, confirmations = next.confirmations, "deposit observed");
                    return Ok(next);
                }
                Err(Error::Store(LedgerError::Conflict(_))) | Err(Error::InvalidState { .. }) => {
                    debug!(deposit = %id, attempt, "deposit row changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Store(LedgerError::Conflict(format!(
            "deposit {id} kept changing"
        ))))
    }

    /// Credit a confirmed deposit to the funding account exactly once.
    pub async fn credit_deposit_if_confirmed(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<CreditOutcome, Error> {
        let id = Deposit::key(chain, tx_hash);
        let deposit = self
            .fetch::<Deposit>(&id)
            .await?
            .ok_or_else(|| Error::not_found("deposit", &id))?;

        if deposit.status == DepositStatus::Credited || deposit.credited_at.is_some() {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        if deposit.status < DepositStatus::Confirmed {
            return Ok(CreditOutcome::NotConfirmed);
        }

        let now = Utc::now();
        let mut credited = deposit.clone();
        credited.status = DepositStatus::Credited;
        credited.credited_at = Some(now);
        credited.updated_at = now;

        let record = credited.to_record()?;
        let key = BalanceKey::funding(deposit.user_id, &deposit.asset);
        let (amount, hash) = (deposit.amount, deposit.tx_hash.clone());
        let metadata = json!({
            "chain": deposit.chain,
            "to_address": deposit.to_address,
            "confirmations": deposit.confirmations,
        });

        let result = Ledger::atomic(self.ledger(), |tx| async move {
            tx.credit_deposit_once(&key, amount, &hash, metadata)?;
            tx.put_record(record, Expect::Status(DepositStatus::Confirmed.as_str().to_string()))?;
            Ok::<_, Error>(())
        })
        .await;

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(Error::InvalidState { .. }) => {
                let current = self.fetch::<Deposit>(&id).await?;
                if current.is_some_and(|d| d.status == DepositStatus::Credited) {
                    debug!(deposit = %id, "deposit credited by a concurrent poll");
                    return Ok(CreditOutcome::AlreadyCredited);
                }
                return Err(Error::invalid_state(Deposit::KIND, &id, "confirmed"));
            }
            Err(e) => return Err(e),
        };

        if receipt.credit_skipped(&deposit.tx_hash) {
            warn!(deposit = %id, "ledger already held this credit; status updated only");
            return Ok(CreditOutcome::AlreadyCredited);
        }

        counter!("kassa.deposits.credited", "chain" => deposit.chain.clone()).increment(1);
        info!(
            deposit = %id,
            user_id = %deposit.user_id,
            asset = %deposit.asset,
            amount = %deposit.amount,
            "deposit credited"
        );
        Ok(CreditOutcome::Credited)
    }

    /// Record an observation and credit it if it is confirmed.
    pub(crate) async fn observe_and_credit(
        &self,
        chain: &str,
        owner: Uuid,
        transfer: &ChainTransfer,
        metadata: Value,
    ) -> Result<DepositCheck, Error> {
        let deposit = self
            .record_observation(chain, owner, transfer, metadata)
            .await?;

        let outcome = match deposit.status {
            DepositStatus::Credited => CreditOutcome::AlreadyCredited,
            DepositStatus::Confirmed => {
                self.credit_deposit_if_confirmed(&deposit.chain, &deposit.tx_hash)
                    .await?
            }
            _ => CreditOutcome::NotConfirmed,
        };

        let deposit = match outcome {
            CreditOutcome::Credited | CreditOutcome::AlreadyCredited => self
                .fetch::<Deposit>(&deposit.record_id())
                .await?
                .unwrap_or(deposit),
            CreditOutcome::NotConfirmed => deposit,
        };
        Ok(DepositCheck { deposit, outcome })
    }

    /// Resolve which user a transfer belongs to on `chain`.
    pub(crate) async fn resolve_owner(
        &self,
        chain: &ChainConfig,
        transfer: &ChainTransfer,
    ) -> Result<Option<Uuid>, Error> {
        match &chain.addressing {
            Addressing::Derived => {
                let key = DepositAddress::address_key(&chain.name, &transfer.to_address);
                Ok(self
                    .find_by_key::<DepositAddress>(&key)
                    .await?
                    .map(|a| a.user_id))
            }
            Addressing::Tagged { shared_address } => {
                if transfer.to_address != *shared_address {
                    return Ok(None);
                }
                let Some(tag) = transfer.destination_tag else {
                    return Ok(None);
                };
                let key = DestinationTag::tag_key(&chain.name, tag);
                Ok(self
                    .find_by_key::<DestinationTag>(&key)
                    .await?
                    .map(|t| t.user_id))
            }
        }
    }

    /// Look a single transaction up on chain and credit it if it belongs to
    /// a known deposit address and is confirmed. The on-chain amount is
    /// authoritative; a differing claimed amount is only noted.
    pub async fn verify_deposit(&self, req: VerifyDepositRequest) -> Result<DepositCheck, Error> {
        if req.tx_hash.trim().is_empty() {
            return Err(Error::validation("tx_hash is required"));
        }
        if req.claimed_amount.is_some_and(|a| a <= Decimal::ZERO) {
            return Err(Error::validation("claimed amount must be positive"));
        }
        let chain = self.chain_config(&req.chain)?.clone();
        let oracle = self
            .chain_oracle(&chain.name)
            .ok_or_else(|| Error::validation(format!("no oracle for chain {}", chain.name)))?;

        let transfer = self
            .oracle_call(&chain.name, oracle.transfer_by_hash(req.tx_hash.trim()))
            .await?
            .ok_or_else(|| Error::not_found("transaction", req.tx_hash.trim()))?;

        if !transfer.is_creditable() {
            return Err(Error::validation("transaction failed or carries no value"));
        }
        if !chain.supports(&transfer.asset) {
            return Err(Error::validation(format!(
                "{} is not accepted on {}",
                transfer.asset, chain.name
            )));
        }
        if let Some(asset) = &req.asset {
            if !asset.trim().eq_ignore_ascii_case(transfer.asset.trim()) {
                return Err(Error::validation(format!(
                    "transaction carries {}, not {}",
                    transfer.asset, asset
                )));
            }
        }

        let owner = self
            .resolve_owner(&chain, &transfer)
            .await?
            .ok_or_else(|| Error::not_found("deposit address", &transfer.to_address))?;

        let mut metadata = json!({ "source": "verify" });
        if let Some(claimed) = req.claimed_amount {
            metadata["claimed_amount"] = json!(claimed);
            if claimed != transfer.amount {
                warn!(tx_hash = %transfer.tx_hash, %claimed, onchain = %transfer.amount, "claimed deposit amount differs from chain");
                metadata["amount_mismatch"] = json!(true);
            }
        }

        self.observe_and_credit(&chain.name, owner, &transfer, metadata)
            .await
    }

    pub async fn deposit(&self, chain: &str, tx_hash: &str) -> Result<Option<Deposit>, Error> {
        self.fetch::<Deposit>(&Deposit::key(chain, tx_hash)).await
    }

    /// Newest first.
    pub async fn deposits(
        &self,
        user_id: Uuid,
        status: Option<DepositStatus>,
    ) -> Result<Vec<Deposit>, Error> {
        let mut query = RecordQuery::kind(Deposit::KIND).owner(user_id);
        if let Some(status) = status {
            query = query.status(status.as_str());
        }
        self.query::<Deposit>(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn transfer(confirmations: u64) -> ChainTransfer {
        ChainTransfer {
            tx_hash: "0xABC".into(),
            asset: "eth".into(),
            from_address: "0xfrom".into(),
            to_address: "0xto".into(),
            amount: dec!(2.5),
            confirmations,
            finalized: false,
            destination_tag: None,
            failed: false,
            block_time: None,
        }
    }

    #[test]
    fn test_status_from_confirmations() {
        assert_eq!(DepositStatus::from_confirmations(0, false, 12), DepositStatus::Pending);
        assert_eq!(DepositStatus::from_confirmations(3, false, 12), DepositStatus::Detected);
        assert_eq!(DepositStatus::from_confirmations(12, false, 12), DepositStatus::Confirmed);
        assert_eq!(DepositStatus::from_confirmations(0, true, 12), DepositStatus::Confirmed);
        assert!(DepositStatus::Credited > DepositStatus::Confirmed);
    }

    #[test]
    fn test_merge_is_monotonic() {
        let now = Utc::now();
        let owner = Uuid::now_v7();
        let first = Deposit::observed("ethereum", owner, &transfer(12), DepositStatus::Confirmed, Value::Null, now);
        assert_eq!(first.tx_hash, "0xabc");
        assert_eq!(first.asset, "ETH");
        assert!(first.confirmed_at.is_some());

        // a lagging node reports fewer confirmations
        let next = first
            .merge(&transfer(5), DepositStatus::Detected, &Value::Null, now)
            .unwrap();
        assert_eq!(next.status, DepositStatus::Confirmed);
        assert_eq!(next.confirmations, 5);

        assert!(next.merge(&transfer(5), DepositStatus::Detected, &Value::Null, now).is_none());
    }

    #[test]
    fn test_metadata_merge() {
        let mut target = json!({"a": 1});
        merge_metadata(&mut target, &json!({"b": 2}));
        assert_eq!(target, json!({"a": 1, "b": 2}));

        let mut empty = Value::Null;
        merge_metadata(&mut empty, &json!({"c": 3}));
        assert_eq!(empty, json!({"c": 3}));
        merge_metadata(&mut empty, &Value::Null);
        assert_eq!(empty, json!({"c": 3}));
    }

    #[test]
    fn test_key_normalizes() {
        assert_eq!(Deposit::key("Ethereum", " 0xAbC "), "ethereum:0xabc");
    }
}

// ledger/src/adapters/memory.rs
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{apply_credit, apply_debit, apply_lock, apply_set, apply_unlock};
use crate::{
    AccountType, Balance, BalanceKey, EntryFilter, EntryType, ExecutionPlan, Expect,
    LedgerAdapter, LedgerEntry, LedgerError, ObjectRecord, Operation, PlanReceipt, RecordQuery,
};

type RecordId = (String, String);

#[derive(Default)]
struct MemoryStore {
    balances: HashMap<BalanceKey, Balance>,
    entries: Vec<LedgerEntry>,
    /// Idempotency keys of every `deposit_credit` entry.
    credited: HashSet<String>,
    records: HashMap<RecordId, ObjectRecord>,
    /// Hashed unique key -> owning record.
    unique_keys: HashMap<String, RecordId>,
}

/// Everything a plan writes, held aside until the last operation succeeds.
#[derive(Default)]
struct Staged {
    balances: BTreeMap<BalanceKey, Balance>,
    entries: Vec<LedgerEntry>,
    credited: HashSet<String>,
    records: HashMap<RecordId, ObjectRecord>,
    unique_keys: HashMap<String, RecordId>,
}

impl Staged {
    fn balance(&mut self, key: &BalanceKey) -> Result<&mut Balance, LedgerError> {
        // Every key was loaded up front from plan.balance_keys().
        self.balances
            .get_mut(key)
            .ok_or_else(|| LedgerError::Storage(format!("balance row not locked: {key:?}")))
    }

    fn append(&mut self, entry: &LedgerEntry) {
        if entry.entry_type == EntryType::DepositCredit {
            self.credited.insert(entry.idempotency_key());
        }
        self.entries.push(entry.clone());
    }
}

/// In-process adapter. One mutex serializes every plan, which gives the
/// same all-or-nothing visibility as a database transaction.
#[derive(Default)]
pub struct MemoryAdapter {
    store: Mutex<MemoryStore>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> Result<MutexGuard<'_, MemoryStore>, LedgerError> {
        self.store
            .lock()
            .map_err(|_| LedgerError::Storage("memory store lock poisoned".to_string()))
    }

    fn apply(
        store: &MemoryStore,
        plan: &ExecutionPlan,
        staged: &mut Staged,
        receipt: &mut PlanReceipt,
    ) -> Result<(), LedgerError> {
        for key in plan.balance_keys() {
            let row = store
                .balances
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Balance::zero(&key));
            staged.balances.insert(key, row);
        }

        for op in plan.operations() {
            match op {
                Operation::Credit { key, amount } => {
                    apply_credit(staged.balance(key)?, *amount)?;
                }
                Operation::Debit { key, amount } => {
                    apply_debit(staged.balance(key)?, *amount)?;
                }
                Operation::Lock { key, amount } => {
                    apply_lock(staged.balance(key)?, *amount)?;
                }
                Operation::Unlock { key, amount } => {
                    if let Some(shortfall) = apply_unlock(staged.balance(key)?, *amount)? {
                        receipt.over_unlocks.push((key.clone(), shortfall));
                    }
                }
                Operation::SetBalance {
                    key,
                    prior_available,
                    prior_locked,
                    available,
                    locked,
                } => {
                    apply_set(
                        staged.balance(key)?,
                        key,
                        (*prior_available, *prior_locked),
                        (*available, *locked),
                    )?;
                }
                Operation::Append { entry } => staged.append(entry),
                Operation::CreditOnce { key, entry } => {
                    let idem = entry.idempotency_key();
                    if store.credited.contains(&idem) || staged.credited.contains(&idem) {
                        receipt.skipped_credits.push(entry.reference_id.clone());
                        continue;
                    }
                    apply_credit(staged.balance(key)?, entry.amount)?;
                    staged.append(entry);
                }
                Operation::PutRecord { record, expect } => {
                    Self::put_record(store, staged, record, expect)?;
                }
            }
        }

        Ok(())
    }

    fn put_record(
        store: &MemoryStore,
        staged: &mut Staged,
        record: &ObjectRecord,
        expect: &Expect,
    ) -> Result<(), LedgerError> {
        let id = (record.kind.clone(), record.id.clone());
        let current = staged
            .records
            .get(&id)
            .or_else(|| store.records.get(&id))
            .cloned();

        match expect {
            Expect::Absent => {
                if current.is_some() {
                    return Err(LedgerError::Conflict(format!(
                        "{} {} already exists",
                        record.kind, record.id
                    )));
                }
                let hashes = record.hashed_keys();
                for hash in &hashes {
                    if store.unique_keys.contains_key(hash)
                        || staged.unique_keys.contains_key(hash)
                    {
                        return Err(LedgerError::Conflict(format!(
                            "unique key taken for {}",
                            record.kind
                        )));
                    }
                }
                for hash in hashes {
                    staged.unique_keys.insert(hash, id.clone());
                }
                staged.records.insert(id, record.clone());
            }
            Expect::Status(prior) => match current {
                Some(existing) if existing.status == *prior => {
                    let mut next = record.clone();
                    next.created_at = existing.created_at;
                    next.unique_keys = existing.unique_keys;
                    next.updated_at = Utc::now();
                    staged.records.insert(id, next);
                }
                _ => {
                    return Err(LedgerError::GuardFailed {
                        kind: record.kind.clone(),
                        id: record.id.clone(),
                        expected: prior.clone(),
                    });
                }
            },
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<PlanReceipt, LedgerError> {
        plan.validate()?;

        let mut store = self.store()?;
        let mut staged = Staged::default();
        let mut receipt = PlanReceipt::default();

        // Nothing below touches `store` until every operation has succeeded.
        Self::apply(&store, plan, &mut staged, &mut receipt)?;

        let now = Utc::now();
        for (key, mut balance) in staged.balances {
            balance.updated_at = now;
            store.balances.insert(key, balance);
        }
        store.entries.extend(staged.entries);
        store.credited.extend(staged.credited);
        store.records.extend(staged.records);
        store.unique_keys.extend(staged.unique_keys);

        Ok(receipt)
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Balance, LedgerError> {
        let store = self.store()?;
        Ok(store
            .balances
            .get(key)
            .cloned()
            .unwrap_or_else(|| Balance::zero(key)))
    }

    async fn get_balances(
        &self,
        user_id: Uuid,
        account_type: Option<AccountType>,
    ) -> Result<Vec<Balance>, LedgerError> {
        let store = self.store()?;
        let mut balances: Vec<Balance> = store
            .balances
            .values()
            .filter(|b| b.user_id == user_id && account_type.is_none_or(|a| a == b.account_type))
            .cloned()
            .collect();
        balances.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(balances)
    }

    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        let store = self.store()?;
        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(store
            .entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_record(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError> {
        let store = self.store()?;
        Ok(store
            .records
            .get(&(kind.to_string(), id.to_string()))
            .cloned())
    }

    async fn find_record_by_key(
        &self,
        kind: &str,
        key: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError> {
        let store = self.store()?;
        let hash = crate::unique_key_hash(kind, key);
        Ok(store
            .unique_keys
            .get(&hash)
            .and_then(|id| store.records.get(id))
            .cloned())
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ObjectRecord>, LedgerError> {
        let store = self.store()?;
        let mut records: Vec<ObjectRecord> = store
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ledger, LedgerContext, Reference, ReferenceType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ctx() -> (Arc<MemoryAdapter>, LedgerContext) {
        let adapter = Arc::new(MemoryAdapter::new());
        (adapter.clone(), LedgerContext::new(adapter))
    }

    #[tokio::test]
    async fn test_failed_plan_leaves_no_trace() {
        let (adapter, ctx) = ctx();
        let user = Uuid::now_v7();
        let funding = BalanceKey::funding(user, "USDT");
        let spot = BalanceKey::spot(user, "USDT");

        let result: Result<_, LedgerError> = Ledger::atomic(&ctx, |tx| async move {
            tx.credit(&spot, dec!(10), Reference::admin("seed"), serde_json::Value::Null)?;
            tx.debit(&funding, dec!(10), Reference::admin("seed"), serde_json::Value::Null)?;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(LedgerError::InsufficientFunds));
        let spot = adapter.get_balance(&BalanceKey::spot(user, "USDT")).await.unwrap();
        assert_eq!(spot.available, dec!(0));
        let entries = adapter.get_entries(&EntryFilter::for_user(user)).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_credit_once_skips_duplicate_in_same_plan() {
        let (adapter, ctx) = ctx();
        let key = BalanceKey::funding(Uuid::now_v7(), "ETH");

        let receipt: PlanReceipt = Ledger::atomic::<_, _, LedgerError>(&ctx, |tx| {
            let key = key.clone();
            async move {
                tx.credit_deposit_once(&key, dec!(1), "0xaa", serde_json::Value::Null)?;
                tx.credit_deposit_once(&key, dec!(1), "0xaa", serde_json::Value::Null)?;
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(receipt.credit_skipped("0xaa"));
        assert_eq!(adapter.get_balance(&key).await.unwrap().available, dec!(1));
        let credits = adapter
            .get_entries(
                &EntryFilter::for_reference(&Reference::deposit("0xaa"))
                    .entry_type(EntryType::DepositCredit),
            )
            .await
            .unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].reference_type, ReferenceType::Deposit);
    }

    #[tokio::test]
    async fn test_overflowing_plan_is_rejected_and_store_stays_usable() {
        let (adapter, ctx) = ctx();
        let user = Uuid::now_v7();
        let funding = BalanceKey::funding(user, "USDT");
        let spot = BalanceKey::spot(user, "USDT");

        Ledger::atomic::<_, _, LedgerError>(&ctx, |tx| {
            let (funding, spot) = (funding.clone(), spot.clone());
            async move {
                tx.credit(&funding, dec!(1), Reference::admin("seed"), serde_json::Value::Null)?;
                tx.credit(&spot, Decimal::MAX, Reference::admin("seed"), serde_json::Value::Null)?;
                Ok(())
            }
        })
        .await
        .unwrap();

        let result: Result<_, LedgerError> = Ledger::atomic(&ctx, |tx| {
            let (funding, spot) = (funding.clone(), spot.clone());
            async move {
                tx.debit(&funding, dec!(1), Reference::admin("move"), serde_json::Value::Null)?;
                tx.credit(&spot, dec!(1), Reference::admin("move"), serde_json::Value::Null)?;
                Ok(())
            }
        })
        .await;
        assert_eq!(result, Err(LedgerError::Overflow));

        assert_eq!(adapter.get_balance(&funding).await.unwrap().available, dec!(1));
        assert_eq!(adapter.get_balance(&spot).await.unwrap().available, Decimal::MAX);
        let entries = adapter.get_entries(&EntryFilter::for_user(user)).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}

// ledger/src/transaction.rs
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::{
    Balance, BalanceKey, EntryType, ExecutionPlan, Expect, LedgerAdapter, LedgerEntry,
    LedgerError, ObjectRecord, Operation, PlanReceipt, Reference,
};

#[derive(Clone)]
pub struct LedgerContext {
    adapter: Arc<dyn LedgerAdapter>,
}

impl LedgerContext {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }
}

/// Collects the operations of one atomic unit. Nothing touches the store
/// until the planning closure returns; reads through the context are
/// advisory and the adapter re-checks every precondition under lock.
#[derive(Clone)]
pub struct TransactionContext {
    ctx: LedgerContext,
    plan: Arc<Mutex<ExecutionPlan>>,
}

impl TransactionContext {
    fn new(ctx: LedgerContext) -> Self {
        Self {
            ctx,
            plan: Arc::new(Mutex::new(ExecutionPlan::new())),
        }
    }

    fn plan(&self) -> Result<MutexGuard<'_, ExecutionPlan>, LedgerError> {
        self.plan
            .lock()
            .map_err(|_| LedgerError::Storage("execution plan lock poisoned".to_string()))
    }

    fn push(&self, ops: impl IntoIterator<Item = Operation>) -> Result<(), LedgerError> {
        let mut plan = self.plan()?;
        for op in ops {
            op.validate()?;
            plan.add(op);
        }
        Ok(())
    }

    pub async fn balance(&self, key: &BalanceKey) -> Result<Balance, LedgerError> {
        self.ctx.adapter().get_balance(key).await
    }

    pub async fn record(&self, kind: &str, id: &str) -> Result<Option<ObjectRecord>, LedgerError> {
        self.ctx.adapter().get_record(kind, id).await
    }

    pub fn credit(
        &self,
        key: &BalanceKey,
        amount: Decimal,
        reference: Reference,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let entry = LedgerEntry::new(key, amount, EntryType::Credit, reference, metadata);
        self.push([
            Operation::Credit {
                key: key.clone(),
                amount,
            },
            Operation::Append { entry },
        ])
    }

    pub fn debit(
        &self,
        key: &BalanceKey,
        amount: Decimal,
        reference: Reference,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let entry = LedgerEntry::new(key, amount, EntryType::Debit, reference, metadata);
        self.push([
            Operation::Debit {
                key: key.clone(),
                amount,
            },
            Operation::Append { entry },
        ])
    }

    pub fn lock(
        &self,
        key: &BalanceKey,
        amount: Decimal,
        reference: Reference,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let entry = LedgerEntry::new(key, amount, EntryType::Lock, reference, metadata);
        self.push([
            Operation::Lock {
                key: key.clone(),
                amount,
            },
            Operation::Append { entry },
        ])
    }

    pub fn unlock(
        &self,
        key: &BalanceKey,
        amount: Decimal,
        reference: Reference,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let entry = LedgerEntry::new(key, amount, EntryType::Unlock, reference, metadata);
        self.push([
            Operation::Unlock {
                key: key.clone(),
                amount,
            },
            Operation::Append { entry },
        ])
    }

    /// Administrative override computed from `current`. The `adjustment`
    /// entry carries the signed change in total balance, and the plan fails
    /// with `GuardFailed` if the row moved after `current` was read.
    pub fn set_balance(
        &self,
        current: &Balance,
        available: Decimal,
        locked: Decimal,
        reference: Reference,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let delta = current.delta_to(available, locked)?;
        let key = current.key();
        let entry = LedgerEntry::new(&key, delta, EntryType::Adjustment, reference, metadata);
        self.push([
            Operation::SetBalance {
                key,
                prior_available: current.available,
                prior_locked: current.locked,
                available,
                locked,
            },
            Operation::Append { entry },
        ])
    }

    /// Credit a deposit unless a `deposit_credit` entry for the same
    /// (user, asset, tx hash) already exists. A skip is reported in the
    /// receipt, not as an error.
    pub fn credit_deposit_once(
        &self,
        key: &BalanceKey,
        amount: Decimal,
        tx_hash: &str,
        metadata: Value,
    ) -> Result<(), LedgerError> {
        let entry = LedgerEntry::new(
            key,
            amount,
            EntryType::DepositCredit,
            Reference::deposit(tx_hash),
            metadata,
        );
        self.push([Operation::CreditOnce {
            key: key.clone(),
            entry,
        }])
    }

    pub fn put_record(&self, record: ObjectRecord, expect: Expect) -> Result<(), LedgerError> {
        self.push([Operation::PutRecord { record, expect }])
    }
}

pub struct Ledger;

impl Ledger {
    /// Run `f` to build a plan, then execute the plan in one adapter call.
    ///
    /// The closure must not perform external I/O it expects to be rolled
    /// back: only the returned plan is transactional.
    pub async fn atomic<F, Fut, E>(ctx: &LedgerContext, f: F) -> Result<PlanReceipt, E>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
        E: From<LedgerError>,
    {
        let tx = TransactionContext::new(ctx.clone());

        f(tx.clone()).await?;

        let plan = tx.plan()?.clone();
        if plan.is_empty() {
            return Ok(PlanReceipt::default());
        }

        for op in plan.operations() {
            let entry = match op {
                Operation::Append { entry } | Operation::CreditOnce { entry, .. } => entry,
                _ => continue,
            };
            if let Some(amount) = entry.amount.abs().to_f64() {
                histogram!("ledger.entry.amount", "entry_type" => entry.entry_type.as_str())
                    .record(amount);
            }
        }

        let result = ctx.adapter().execute_plan(&plan).await;

        counter!("ledger.plans.total",
            "status" => if result.is_ok() { "success" } else { "failed" }
        )
        .increment(1);

        match &result {
            Ok(receipt) => debug!(
                operations = plan.operations().len(),
                skipped = receipt.skipped_credits.len(),
                "plan executed"
            ),
            Err(e) => debug!(error = %e, "plan rejected"),
        }

        Ok(result?)
    }
}

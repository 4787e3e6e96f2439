// ledger/src/plan.rs
use rust_decimal::Decimal;

use crate::{BalanceKey, Expect, LedgerEntry, ObjectRecord};

#[derive(Debug, Clone)]
pub enum Operation {
    /// available += amount
    Credit { key: BalanceKey, amount: Decimal },
    /// available -= amount; fails if available < amount
    Debit { key: BalanceKey, amount: Decimal },
    /// available -> locked; fails if available < amount
    Lock { key: BalanceKey, amount: Decimal },
    /// locked -> available; locked floors at zero
    Unlock { key: BalanceKey, amount: Decimal },
    /// Administrative override of both columns; fails with `GuardFailed`
    /// unless the row still holds `prior_available`/`prior_locked`.
    SetBalance {
        key: BalanceKey,
        prior_available: Decimal,
        prior_locked: Decimal,
        available: Decimal,
        locked: Decimal,
    },
    /// Append-only ledger write.
    Append { entry: LedgerEntry },
    /// Credit `entry.amount` and append `entry`, unless an entry with the same
    /// (user, asset, reference type, reference id) already exists, in which
    /// case both are skipped.
    CreditOnce { key: BalanceKey, entry: LedgerEntry },
    PutRecord { record: ObjectRecord, expect: Expect },
}

impl Operation {
    fn balance_key(&self) -> Option<&BalanceKey> {
        match self {
            Operation::Credit { key, .. }
            | Operation::Debit { key, .. }
            | Operation::Lock { key, .. }
            | Operation::Unlock { key, .. }
            | Operation::SetBalance { key, .. }
            | Operation::CreditOnce { key, .. } => Some(key),
            Operation::Append { .. } | Operation::PutRecord { .. } => None,
        }
    }

    /// Amount must be strictly positive for movement operations.
    pub fn validate(&self) -> Result<(), crate::LedgerError> {
        let amount = match self {
            Operation::Credit { amount, .. }
            | Operation::Debit { amount, .. }
            | Operation::Lock { amount, .. }
            | Operation::Unlock { amount, .. } => *amount,
            Operation::CreditOnce { entry, .. } => entry.amount,
            Operation::SetBalance {
                available,
                locked,
                prior_available,
                prior_locked,
                ..
            } => {
                if available.is_sign_negative()
                    || locked.is_sign_negative()
                    || prior_available.is_sign_negative()
                    || prior_locked.is_sign_negative()
                {
                    return Err(crate::LedgerError::InvalidAmount);
                }
                return Ok(());
            }
            Operation::Append { .. } | Operation::PutRecord { .. } => return Ok(()),
        };

        if amount <= Decimal::ZERO {
            return Err(crate::LedgerError::InvalidAmount);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    operations: Vec<Operation>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Balance rows the plan touches, sorted and deduplicated. Adapters lock
    /// them in this order before executing anything.
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> = self
            .operations
            .iter()
            .filter_map(|op| op.balance_key().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn validate(&self) -> Result<(), crate::LedgerError> {
        self.operations.iter().try_for_each(Operation::validate)
    }
}

/// What an executed plan actually did beyond the happy path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReceipt {
    /// Reference ids of `CreditOnce` operations skipped because the ledger
    /// already held a matching entry.
    pub skipped_credits: Vec<String>,
    /// Unlocks that asked for more than was locked, with the shortfall.
    pub over_unlocks: Vec<(BalanceKey, Decimal)>,
}

impl PlanReceipt {
    pub fn credit_skipped(&self, reference_id: &str) -> bool {
        self.skipped_credits.iter().any(|r| r == reference_id)
    }
}

// ledger/src/adapters/mod.rs
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryAdapter;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;

use metrics::counter;
use rust_decimal::Decimal;
use tracing::error;

use crate::{Balance, BalanceKey, LedgerError};

fn checked_sum(a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

pub(crate) fn apply_credit(balance: &mut Balance, amount: Decimal) -> Result<(), LedgerError> {
    balance.available = checked_sum(balance.available, amount)?;
    Ok(())
}

/// Move `amount` from locked to available. Locked floors at zero and the
/// full amount is still credited so the ledger entry matches the delta; the
/// shortfall is returned so the caller can report it.
pub(crate) fn apply_unlock(
    balance: &mut Balance,
    amount: Decimal,
) -> Result<Option<Decimal>, LedgerError> {
    let available = checked_sum(balance.available, amount)?;
    let shortfall = amount - balance.locked;
    balance.available = available;
    if shortfall > Decimal::ZERO {
        balance.locked = Decimal::ZERO;
        error!(
            user_id = %balance.user_id,
            asset = %balance.asset,
            account_type = %balance.account_type,
            requested = %amount,
            shortfall = %shortfall,
            "unlock exceeds locked balance, clamping to zero"
        );
        counter!("ledger.invariant.over_unlock", "asset" => balance.asset.clone()).increment(1);
        Ok(Some(shortfall))
    } else {
        balance.locked -= amount;
        Ok(None)
    }
}

pub(crate) fn apply_debit(balance: &mut Balance, amount: Decimal) -> Result<(), LedgerError> {
    if balance.available < amount {
        return Err(LedgerError::InsufficientFunds);
    }
    balance.available -= amount;
    Ok(())
}

pub(crate) fn apply_lock(balance: &mut Balance, amount: Decimal) -> Result<(), LedgerError> {
    let locked = checked_sum(balance.locked, amount)?;
    apply_debit(balance, amount)?;
    balance.locked = locked;
    Ok(())
}

/// Overwrite both columns, but only if the row still holds the values the
/// override was computed from.
pub(crate) fn apply_set(
    balance: &mut Balance,
    key: &BalanceKey,
    prior: (Decimal, Decimal),
    next: (Decimal, Decimal),
) -> Result<(), LedgerError> {
    if (balance.available, balance.locked) != prior {
        return Err(LedgerError::GuardFailed {
            kind: "balance".to_string(),
            id: format!("{}:{}:{}", key.user_id, key.account_type, key.asset),
            expected: format!("available={} locked={}", prior.0, prior.1),
        });
    }
    (balance.available, balance.locked) = next;
    Ok(())
}

// ledger/src/balance.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AccountType, LedgerError};

/// Natural key of a balance row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub user_id: Uuid,
    pub asset: String,
    pub account_type: AccountType,
}

impl BalanceKey {
    pub fn new(user_id: Uuid, asset: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            user_id,
            asset: asset.into().trim().to_ascii_uppercase(),
            account_type,
        }
    }

    pub fn funding(user_id: Uuid, asset: impl Into<String>) -> Self {
        Self::new(user_id, asset, AccountType::Funding)
    }

    pub fn spot(user_id: Uuid, asset: impl Into<String>) -> Self {
        Self::new(user_id, asset, AccountType::Spot)
    }

    pub fn perp(user_id: Uuid, asset: impl Into<String>) -> Self {
        Self::new(user_id, asset, AccountType::Perp)
    }
}

/// Available/locked amounts for one (user, asset, account type).
///
/// A row that was never touched reads as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub asset: String,
    pub account_type: AccountType,
    pub available: Decimal,
    pub locked: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn zero(key: &BalanceKey) -> Self {
        Self {
            user_id: key.user_id,
            asset: key.asset.clone(),
            account_type: key.account_type,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            user_id: self.user_id,
            asset: self.asset.clone(),
            account_type: self.account_type,
        }
    }

    /// `None` if available + locked leaves the representable range.
    pub fn total(&self) -> Option<Decimal> {
        self.available.checked_add(self.locked)
    }

    /// Signed change in total if the row were overwritten with
    /// `available`/`locked`.
    pub fn delta_to(&self, available: Decimal, locked: Decimal) -> Result<Decimal, LedgerError> {
        let next = available.checked_add(locked).ok_or(LedgerError::Overflow)?;
        let current = self.total().ok_or(LedgerError::Overflow)?;
        next.checked_sub(current).ok_or(LedgerError::Overflow)
    }

    pub fn is_consistent(&self) -> bool {
        !self.available.is_sign_negative() && !self.locked.is_sign_negative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_key_normalizes_asset() {
        let user = Uuid::now_v7();
        let key = BalanceKey::spot(user, " usdt ");
        assert_eq!(key.asset, "USDT");
        assert_eq!(key.account_type, AccountType::Spot);
    }

    #[test]
    fn test_zero_balance() {
        let key = BalanceKey::funding(Uuid::now_v7(), "ETH");
        let mut balance = Balance::zero(&key);
        assert_eq!(balance.total(), Some(Decimal::ZERO));
        assert!(balance.is_consistent());
        assert_eq!(balance.key(), key);

        balance.locked = dec!(-1);
        assert!(!balance.is_consistent());
    }

    #[test]
    fn test_delta_to_covers_locked() {
        let key = BalanceKey::spot(Uuid::now_v7(), "USDT");
        let mut balance = Balance::zero(&key);
        balance.available = dec!(100);
        balance.locked = dec!(50);
        assert_eq!(balance.delta_to(dec!(80), dec!(0)), Ok(dec!(-70)));
        assert_eq!(
            balance.delta_to(Decimal::MAX, dec!(1)),
            Err(LedgerError::Overflow)
        );
    }
}

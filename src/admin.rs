use ledger::{AccountType, BalanceKey, Ledger, Reference};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{Engine, Error};

/// Operator override of one balance row. Both fields are absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustBalanceRequest {
    pub user_id: Uuid,
    pub asset: String,
    pub account_type: AccountType,
    pub available: Decimal,
    pub locked: Decimal,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub admin_id: Option<String>,
}

impl AdjustBalanceRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.asset.trim().is_empty() {
            return Err(Error::validation("asset is required"));
        }
        if self.available.is_sign_negative() || self.locked.is_sign_negative() {
            return Err(Error::validation("balances cannot be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAdjustment {
    pub user_id: Uuid,
    pub asset: String,
    pub account_type: AccountType,
    pub previous_available: Decimal,
    pub previous_locked: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
    /// Change in total holdings, as recorded on the `adjustment` entry.
    pub delta: Decimal,
}

impl Engine {
    /// Overwrite a balance and record an `adjustment` entry carrying the
    /// change in total. Setting a balance to its current value writes
    /// nothing. Fails with `InvalidState` if the row moves between the read
    /// and the write; the caller re-reads and decides again.
    pub async fn adjust_balance(&self, req: AdjustBalanceRequest) -> Result<BalanceAdjustment, Error> {
        req.validate()?;

        let key = BalanceKey::new(req.user_id, &req.asset, req.account_type);
        let current = self.ledger().adapter().get_balance(&key).await?;
        let delta = current.delta_to(req.available, req.locked)?;

        let adjustment = BalanceAdjustment {
            user_id: req.user_id,
            asset: key.asset.clone(),
            account_type: req.account_type,
            previous_available: current.available,
            previous_locked: current.locked,
            available: req.available,
            locked: req.locked,
            delta,
        };
        if current.available == req.available && current.locked == req.locked {
            return Ok(adjustment);
        }

        let admin = req.admin_id.clone().unwrap_or_else(|| "manual".to_string());
        let metadata = json!({
            "reason": req.reason,
            "previous_available": current.available,
            "previous_locked": current.locked,
        });
        let (available, locked) = (req.available, req.locked);
        Ledger::atomic(self.ledger(), |tx| async move {
            tx.set_balance(&current, available, locked, Reference::admin(&admin), metadata)?;
            Ok::<_, Error>(())
        })
        .await?;

        info!(
            user_id = %adjustment.user_id,
            asset = %adjustment.asset,
            account_type = %adjustment.account_type,
            available = %adjustment.available,
            locked = %adjustment.locked,
            %delta,
            admin = req.admin_id.as_deref().unwrap_or("manual"),
            "balance adjusted"
        );
        Ok(adjustment)
    }
}

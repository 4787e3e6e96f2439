use chrono::{DateTime, Utc};
use ledger::{AccountType, BalanceKey, Ledger, Reference};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Engine, Error};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub user_id: Uuid,
    pub asset: String,
    pub from: AccountType,
    pub to: AccountType,
    pub amount: Decimal,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.asset.trim().is_empty() {
            return Err(Error::validation("asset is required"));
        }
        if self.from == self.to {
            return Err(Error::validation("source and destination accounts must differ"));
        }
        if self.amount <= Decimal::ZERO {
            return Err(Error::validation("amount must be positive"));
        }
        Ok(())
    }
}

/// Result of a completed transfer. Both ledger legs carry `id` as their
/// reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset: String,
    pub from: AccountType,
    pub to: AccountType,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Engine {
    /// Move `amount` of available balance between two accounts of one user.
    pub async fn transfer(&self, req: TransferRequest) -> Result<Transfer, Error> {
        req.validate()?;

        let source = BalanceKey::new(req.user_id, &req.asset, req.from);
        let dest = BalanceKey::new(req.user_id, &req.asset, req.to);

        let available = self.ledger().adapter().get_balance(&source).await?.available;
        if available < req.amount {
            debug!(user_id = %req.user_id, asset = %source.asset, %available, amount = %req.amount, "transfer rejected");
            return Err(Error::InsufficientFunds);
        }

        let transfer = Transfer {
            id: Uuid::now_v7(),
            user_id: req.user_id,
            asset: source.asset.clone(),
            from: req.from,
            to: req.to,
            amount: req.amount,
            created_at: Utc::now(),
        };

        let metadata = json!({ "from": req.from, "to": req.to });
        Ledger::atomic(self.ledger(), |tx| {
            let (source, dest, metadata) = (source.clone(), dest.clone(), metadata.clone());
            let (id, amount) = (transfer.id, transfer.amount);
            async move {
                tx.debit(&source, amount, Reference::transfer(id), metadata.clone())?;
                tx.credit(&dest, amount, Reference::transfer(id), metadata)?;
                Ok::<_, Error>(())
            }
        })
        .await?;

        info!(
            transfer_id = %transfer.id,
            user_id = %transfer.user_id,
            asset = %transfer.asset,
            from = %transfer.from,
            to = %transfer.to,
            amount = %transfer.amount,
            "transfer completed"
        );
        Ok(transfer)
    }
}

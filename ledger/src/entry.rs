// ledger/src/entry.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{AccountType, BalanceKey};

/// Direction/cause of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    DepositCredit,
    Debit,
    Credit,
    Lock,
    Unlock,
    Adjustment,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::DepositCredit => "deposit_credit",
            EntryType::Debit => "debit",
            EntryType::Credit => "credit",
            EntryType::Lock => "lock",
            EntryType::Unlock => "unlock",
            EntryType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit_credit" => Ok(EntryType::DepositCredit),
            "debit" => Ok(EntryType::Debit),
            "credit" => Ok(EntryType::Credit),
            "lock" => Ok(EntryType::Lock),
            "unlock" => Ok(EntryType::Unlock),
            "adjustment" => Ok(EntryType::Adjustment),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

/// What kind of external object an entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Order,
    PerpOrder,
    PerpPosition,
    Transfer,
    Deposit,
    Admin,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Order => "order",
            ReferenceType::PerpOrder => "perp_order",
            ReferenceType::PerpPosition => "perp_position",
            ReferenceType::Transfer => "transfer",
            ReferenceType::Deposit => "deposit",
            ReferenceType::Admin => "admin",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(ReferenceType::Order),
            "perp_order" => Ok(ReferenceType::PerpOrder),
            "perp_position" => Ok(ReferenceType::PerpPosition),
            "transfer" => Ok(ReferenceType::Transfer),
            "deposit" => Ok(ReferenceType::Deposit),
            "admin" => Ok(ReferenceType::Admin),
            other => Err(format!("unknown reference type: {other}")),
        }
    }
}

/// External correlation key carried by every entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: ReferenceType,
    pub id: String,
}

impl Reference {
    pub fn new(kind: ReferenceType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn order(id: Uuid) -> Self {
        Self::new(ReferenceType::Order, id.to_string())
    }

    pub fn perp_order(id: Uuid) -> Self {
        Self::new(ReferenceType::PerpOrder, id.to_string())
    }

    pub fn perp_position(id: Uuid) -> Self {
        Self::new(ReferenceType::PerpPosition, id.to_string())
    }

    pub fn transfer(id: Uuid) -> Self {
        Self::new(ReferenceType::Transfer, id.to_string())
    }

    pub fn deposit(tx_hash: impl Into<String>) -> Self {
        Self::new(ReferenceType::Deposit, tx_hash)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(ReferenceType::Admin, id)
    }
}

/// Immutable audit record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset: String,
    pub account_type: AccountType,
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        key: &BalanceKey,
        amount: Decimal,
        entry_type: EntryType,
        reference: Reference,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: key.user_id,
            asset: key.asset.clone(),
            account_type: key.account_type,
            amount,
            entry_type,
            reference_type: reference.kind,
            reference_id: reference.id,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.reference_type, self.reference_id.clone())
    }

    /// Key the deposit idempotency guard is checked against.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(
            self.user_id,
            &self.asset,
            self.reference_type,
            &self.reference_id,
        )
    }
}

pub fn idempotency_key(
    user_id: Uuid,
    asset: &str,
    reference_type: ReferenceType,
    reference_id: &str,
) -> String {
    crate::hash_key(&format!(
        "{}:{}:{}:{}",
        user_id, asset, reference_type, reference_id
    ))
}

/// Read-side filter over ledger entries. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub user_id: Option<Uuid>,
    pub asset: Option<String>,
    pub entry_type: Option<EntryType>,
    pub reference_type: Option<ReferenceType>,
    pub reference_id: Option<String>,
    pub limit: Option<u32>,
}

impl EntryFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn for_reference(reference: &Reference) -> Self {
        Self {
            reference_type: Some(reference.kind),
            reference_id: Some(reference.id.clone()),
            ..Default::default()
        }
    }

    pub fn asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into().trim().to_ascii_uppercase());
        self
    }

    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user_id.is_none_or(|u| u == entry.user_id)
            && self.asset.as_ref().is_none_or(|a| *a == entry.asset)
            && self.entry_type.is_none_or(|t| t == entry.entry_type)
            && self.reference_type.is_none_or(|t| t == entry.reference_type)
            && self
                .reference_id
                .as_ref()
                .is_none_or(|r| *r == entry.reference_id)
    }
}

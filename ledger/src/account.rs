// ledger/src/account.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Independent balance bucket a user holds per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Receives on-chain deposits.
    Funding,
    /// Backs spot orders.
    Spot,
    /// Backs perpetual position margin.
    Perp,
}

impl AccountType {
    pub const ALL: [AccountType; 3] = [AccountType::Funding, AccountType::Spot, AccountType::Perp];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Funding => "funding",
            AccountType::Spot => "spot",
            AccountType::Perp => "perp",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "funding" => Ok(AccountType::Funding),
            "spot" => Ok(AccountType::Spot),
            "perp" | "perpetual" | "futures" => Ok(AccountType::Perp),
            other => Err(format!("unknown account type: {other}")),
        }
    }
}

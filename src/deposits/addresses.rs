//! Per-user deposit addresses and destination tags.
//!
//! Uniqueness is enforced by the record store: every allocation is an
//! insert guarded by unique keys, and a collision is answered by retrying
//! with the next candidate.

use chrono::{DateTime, Utc};
use ledger::{Expect, Ledger, LedgerError, RecordQuery};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Addressing;
use crate::{Engine, Error, Record};

/// Turns a derivation index into a chain address. Key material stays with
/// the implementation.
pub trait AddressDeriver: Send + Sync {
    fn derive(&self, chain: &str, index: u32) -> Result<String, Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositAddress {
    pub user_id: Uuid,
    pub chain: String,
    pub address: String,
    pub derivation_index: u32,
    pub created_at: DateTime<Utc>,
}

impl DepositAddress {
    pub fn id_for(chain: &str, user_id: Uuid) -> String {
        format!("{}:{}", chain.to_ascii_lowercase(), user_id)
    }

    pub fn address_key(chain: &str, address: &str) -> String {
        format!(
            "{}:address:{}",
            chain.to_ascii_lowercase(),
            address.trim().to_ascii_lowercase()
        )
    }

    fn index_key(chain: &str, index: u32) -> String {
        format!("{}:index:{}", chain.to_ascii_lowercase(), index)
    }
}

impl Record for DepositAddress {
    const KIND: &'static str = "deposit_address";

    fn record_id(&self) -> String {
        DepositAddress::id_for(&self.chain, self.user_id)
    }

    fn owner(&self) -> Uuid {
        self.user_id
    }

    fn status(&self) -> String {
        "active".to_string()
    }

    fn partition(&self) -> String {
        self.chain.clone()
    }

    fn unique_keys(&self) -> Vec<String> {
        vec![
            DepositAddress::address_key(&self.chain, &self.address),
            DepositAddress::index_key(&self.chain, self.derivation_index),
        ]
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationTag {
    pub user_id: Uuid,
    pub chain: String,
    pub tag: u32,
    pub created_at: DateTime<Utc>,
}

impl DestinationTag {
    pub fn id_for(chain: &str, user_id: Uuid) -> String {
        format!("{}:{}", chain.to_ascii_lowercase(), user_id)
    }

    pub fn tag_key(chain: &str, tag: u32) -> String {
        format!("{}:tag:{}", chain.to_ascii_lowercase(), tag)
    }
}

impl Record for DestinationTag {
    const KIND: &'static str = "destination_tag";

    fn record_id(&self) -> String {
        DestinationTag::id_for(&self.chain, self.user_id)
    }

    fn owner(&self) -> Uuid {
        self.user_id
    }

    fn status(&self) -> String {
        "active".to_string()
    }

    fn partition(&self) -> String {
        self.chain.clone()
    }

    fn unique_keys(&self) -> Vec<String> {
        vec![DestinationTag::tag_key(&self.chain, self.tag)]
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Where a user sends `asset` on `chain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTarget {
    pub chain: String,
    pub asset: String,
    pub address: String,
    pub destination_tag: Option<u32>,
}

impl Engine {
    /// Return the user's address on a derived-address chain, allocating the
    /// next free derivation index on first use.
    pub async fn allocate_deposit_address(
        &self,
        user_id: Uuid,
        chain: &str,
    ) -> Result<DepositAddress, Error> {
        let config = self.chain_config(chain)?;
        if config.addressing != Addressing::Derived {
            return Err(Error::validation(format!(
                "{} deposits use destination tags",
                config.name
            )));
        }
        let chain = config.name.to_ascii_lowercase();
        let id = DepositAddress::id_for(&chain, user_id);

        if let Some(existing) = self.fetch::<DepositAddress>(&id).await? {
            return Ok(existing);
        }

        let deriver = self
            .deriver()
            .ok_or_else(|| Error::validation("no address deriver configured"))?;

        let attempts = self.config().allocation_attempts.max(1);
        for attempt in 1..=attempts {
            let newest = self
                .query::<DepositAddress>(
                    &RecordQuery::kind(DepositAddress::KIND)
                        .partition(chain.clone())
                        .limit(1),
                )
                .await?;
            let index = newest
                .first()
                .map_or(0, |a| a.derivation_index.saturating_add(1));

            let address = DepositAddress {
                user_id,
                chain: chain.clone(),
                address: deriver.derive(&chain, index)?,
                derivation_index: index,
                created_at: Utc::now(),
            };

            let record = address.to_record()?;
            let result = Ledger::atomic(self.ledger(), |tx| async move {
                tx.put_record(record, Expect::Absent)?;
                Ok::<_, Error>(())
            })
            .await;

            match result {
                Ok(_) => {
                    info!(
                        user_id = %user_id,
                        chain = %chain,
                        index,
                        address = %address.address,
                        "deposit address allocated"
                    );
                    return Ok(address);
                }
                Err(Error::Store(LedgerError::Conflict(reason))) => {
                    if let Some(existing) = self.fetch::<DepositAddress>(&id).await? {
                        return Ok(existing);
                    }
                    debug!(chain = %chain, index, attempt, %reason, "derivation index taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(user_id = %user_id, chain = %chain, attempts, "deposit address allocation exhausted");
        Err(Error::Store(LedgerError::Conflict(format!(
            "no free derivation index on {chain} after {attempts} attempts"
        ))))
    }

    /// Return the user's destination tag on a shared-address chain,
    /// drawing a random unused tag on first use.
    pub async fn allocate_destination_tag(
        &self,
        user_id: Uuid,
        chain: &str,
    ) -> Result<DestinationTag, Error> {
        let config = self.chain_config(chain)?;
        if !matches!(config.addressing, Addressing::Tagged { .. }) {
            return Err(Error::validation(format!(
                "{} deposits use derived addresses",
                config.name
            )));
        }
        let chain = config.name.to_ascii_lowercase();
        let id = DestinationTag::id_for(&chain, user_id);

        if let Some(existing) = self.fetch::<DestinationTag>(&id).await? {
            return Ok(existing);
        }

        let (min, max) = (
            self.config().destination_tag_min,
            self.config().destination_tag_max,
        );
        let attempts = self.config().tag_attempts.max(1);
        for attempt in 1..=attempts {
            let tag = rand::rng().random_range(min..=max);
            let candidate = DestinationTag {
                user_id,
                chain: chain.clone(),
                tag,
                created_at: Utc::now(),
            };

            let record = candidate.to_record()?;
            let result = Ledger::atomic(self.ledger(), |tx| async move {
                tx.put_record(record, Expect::Absent)?;
                Ok::<_, Error>(())
            })
            .await;

            match result {
                Ok(_) => {
                    info!(user_id = %user_id, chain = %chain, tag, "destination tag allocated");
                    return Ok(candidate);
                }
                Err(Error::Store(LedgerError::Conflict(_))) => {
                    if let Some(existing) = self.fetch::<DestinationTag>(&id).await? {
                        return Ok(existing);
                    }
                    debug!(chain = %chain, tag, attempt, "destination tag taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(user_id = %user_id, chain = %chain, attempts, "destination tag allocation exhausted");
        Err(Error::Store(LedgerError::Conflict(format!(
            "no free destination tag on {chain} after {attempts} attempts"
        ))))
    }

    /// Allocate (or return) whatever the user needs to deposit `asset` on
    /// `chain`. Fails when a shared-address chain has no address configured.
    pub async fn deposit_target(
        &self,
        user_id: Uuid,
        chain: &str,
        asset: &str,
    ) -> Result<DepositTarget, Error> {
        let config = self.chain_config(chain)?.clone();
        if !config.supports(asset) {
            return Err(Error::validation(format!(
                "{asset} is not accepted on {}",
                config.name
            )));
        }
        let asset = asset.trim().to_ascii_uppercase();

        match &config.addressing {
            Addressing::Derived => {
                let allocated = self.allocate_deposit_address(user_id, &config.name).await?;
                Ok(DepositTarget {
                    chain: allocated.chain,
                    asset,
                    address: allocated.address,
                    destination_tag: None,
                })
            }
            Addressing::Tagged { .. } => {
                let shared = config.shared_address().ok_or_else(|| {
                    Error::validation(format!("{} shared address is not configured", config.name))
                })?;
                let tag = self.allocate_destination_tag(user_id, &config.name).await?;
                Ok(DepositTarget {
                    chain: tag.chain,
                    asset,
                    address: shared.to_string(),
                    destination_tag: Some(tag.tag),
                })
            }
        }
    }

    /// The user's existing deposit target, without allocating.
    pub async fn deposit_address(
        &self,
        user_id: Uuid,
        chain: &str,
        asset: &str,
    ) -> Result<Option<DepositTarget>, Error> {
        let config = self.chain_config(chain)?.clone();
        if !config.supports(asset) {
            return Ok(None);
        }
        let asset = asset.trim().to_ascii_uppercase();

        let target = match &config.addressing {
            Addressing::Derived => self
                .fetch::<DepositAddress>(&DepositAddress::id_for(&config.name, user_id))
                .await?
                .map(|a| DepositTarget {
                    chain: a.chain,
                    asset,
                    address: a.address,
                    destination_tag: None,
                }),
            Addressing::Tagged { .. } => {
                let Some(shared) = config.shared_address() else {
                    return Ok(None);
                };
                self.fetch::<DestinationTag>(&DestinationTag::id_for(&config.name, user_id))
                    .await?
                    .map(|t| DepositTarget {
                        chain: t.chain,
                        asset,
                        address: shared.to_string(),
                        destination_tag: Some(t.tag),
                    })
            }
        };
        Ok(target)
    }
}

//! Periodic deposit discovery.
//!
//! Each poll asks every chain oracle for transfers to the addresses (or the
//! shared tagged address) the engine knows about, records what it sees and
//! credits whatever crossed the confirmation threshold. No balance is held
//! while an oracle call is in flight, so overlapping polls are harmless.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::addresses::{DepositAddress, DestinationTag};
use super::{ChainOracle, ChainTransfer, CreditOutcome};
use crate::config::{Addressing, ChainConfig};
use crate::{Engine, Error, Record};
use ledger::RecordQuery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Addresses queried.
    pub targets: usize,
    pub observed: usize,
    pub credited: usize,
    pub failures: usize,
}

impl PollReport {
    fn absorb(&mut self, other: PollReport) {
        self.targets += other.targets;
        self.observed += other.observed;
        self.credited += other.credited;
        self.failures += other.failures;
    }
}

pub struct DepositReconciler {
    engine: Engine,
}

impl DepositReconciler {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// One pass over every configured chain. Failures are counted and
    /// logged; the next pass retries them.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        for chain in &self.engine.config().chains {
            let Some(oracle) = self.engine.chain_oracle(&chain.name) else {
                debug!(chain = %chain.name, "no oracle registered, skipping chain");
                continue;
            };

            let result = match &chain.addressing {
                Addressing::Derived => self.poll_derived(chain, oracle).await,
                Addressing::Tagged { .. } => self.poll_tagged(chain, oracle).await,
            };
            match result {
                Ok(chain_report) => report.absorb(chain_report),
                Err(e) => {
                    warn!(chain = %chain.name, error = %e, "deposit poll failed");
                    report.failures += 1;
                }
            }
        }

        report
    }

    async fn poll_derived(
        &self,
        chain: &ChainConfig,
        oracle: Arc<dyn ChainOracle>,
    ) -> Result<PollReport, Error> {
        let addresses = self
            .engine
            .query::<DepositAddress>(
                &RecordQuery::kind(DepositAddress::KIND).partition(chain.name.to_ascii_lowercase()),
            )
            .await?;

        let mut report = PollReport::default();
        for address in addresses {
            report.targets += 1;
            let transfers = match self
                .engine
                .oracle_call(&chain.name, oracle.transfers_to(&address.address))
                .await
            {
                Ok(transfers) => transfers,
                Err(_) => {
                    report.failures += 1;
                    continue;
                }
            };

            for transfer in transfers.iter().filter(|t| {
                t.to_address.trim().eq_ignore_ascii_case(address.address.trim())
                    && t.is_creditable()
                    && chain.supports(&t.asset)
            }) {
                self.apply(chain, address.user_id, transfer, &mut report)
                    .await;
            }
        }
        Ok(report)
    }

    async fn poll_tagged(
        &self,
        chain: &ChainConfig,
        oracle: Arc<dyn ChainOracle>,
    ) -> Result<PollReport, Error> {
        let Some(shared) = chain.shared_address() else {
            warn!(chain = %chain.name, "shared deposit address not configured, skipping chain");
            return Ok(PollReport::default());
        };

        let tags: HashMap<u32, Uuid> = self
            .engine
            .query::<DestinationTag>(
                &RecordQuery::kind(DestinationTag::KIND).partition(chain.name.to_ascii_lowercase()),
            )
            .await?
            .into_iter()
            .map(|t| (t.tag, t.user_id))
            .collect();

        let mut report = PollReport {
            targets: 1,
            ..PollReport::default()
        };
        if tags.is_empty() {
            return Ok(report);
        }

        let transfers = match self
            .engine
            .oracle_call(&chain.name, oracle.transfers_to(shared))
            .await
        {
            Ok(transfers) => transfers,
            Err(_) => {
                report.failures += 1;
                return Ok(report);
            }
        };

        for transfer in transfers
            .iter()
            .filter(|t| t.to_address.trim() == shared && t.is_creditable() && chain.supports(&t.asset))
        {
            let Some(owner) = transfer.destination_tag.and_then(|tag| tags.get(&tag)) else {
                debug!(chain = %chain.name, tx_hash = %transfer.tx_hash, tag = ?transfer.destination_tag, "transfer without a known tag, ignoring");
                continue;
            };
            self.apply(chain, *owner, transfer, &mut report).await;
        }
        Ok(report)
    }

    async fn apply(
        &self,
        chain: &ChainConfig,
        owner: Uuid,
        transfer: &ChainTransfer,
        report: &mut PollReport,
    ) {
        let metadata = json!({ "source": "poll" });
        match self
            .engine
            .observe_and_credit(&chain.name, owner, transfer, metadata)
            .await
        {
            Ok(check) => {
                report.observed += 1;
                if check.outcome == CreditOutcome::Credited {
                    report.credited += 1;
                }
            }
            Err(e) => {
                warn!(chain = %chain.name, tx_hash = %transfer.tx_hash, error = %e, "failed to apply observed deposit");
                report.failures += 1;
            }
        }
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.engine.config().reconcile_interval();
        info!(interval_secs = interval.as_secs(), "deposit reconciler started");

        while !*shutdown.borrow() {
            let report = self.poll_once().await;
            debug!(
                targets = report.targets,
                observed = report.observed,
                credited = report.credited,
                failures = report.failures,
                "deposit poll finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("deposit reconciler stopped");
    }
}

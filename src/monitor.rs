//! Server-side take-profit / stop-loss evaluation.
//!
//! Positions are closed through the regular close path, so the `open`
//! status guard makes each auto-close happen at most once even when two
//! monitors race. Crossing the liquidation price is only reported.

use ledger::RecordQuery;
use metrics::counter;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pair::TradingPair;
use crate::perp::{PerpPosition, PositionStatus};
use crate::{Engine, Error, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    pub closed: usize,
    pub liquidatable: usize,
    /// Positions skipped for lack of a fresh price.
    pub unpriced: usize,
    pub failures: usize,
}

pub struct PositionMonitor {
    engine: Engine,
}

impl PositionMonitor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn run_once(&self) -> Result<MonitorReport, Error> {
        let positions = self
            .engine
            .query::<PerpPosition>(
                &RecordQuery::kind(PerpPosition::KIND).status(PositionStatus::Open.as_str()),
            )
            .await?;

        let mut report = MonitorReport::default();
        let mut prices = HashMap::new();

        for position in positions {
            report.checked += 1;

            if !prices.contains_key(&position.pair) {
                let price = match TradingPair::parse(&position.pair) {
                    Ok(pair) => self.engine.prices().get(&pair).await,
                    Err(_) => None,
                };
                prices.insert(position.pair.clone(), price);
            }
            let Some(price) = prices.get(&position.pair).copied().flatten() else {
                report.unpriced += 1;
                continue;
            };

            if position.is_liquidatable(price) {
                report.liquidatable += 1;
                counter!("kassa.positions.liquidatable").increment(1);
                warn!(
                    position_id = %position.id,
                    user_id = %position.user_id,
                    %price,
                    liquidation_price = %position.liquidation_price,
                    "position past liquidation price"
                );
            }

            let Some(reason) = position.trigger(price) else {
                continue;
            };
            let position_id = position.id;
            match self
                .engine
                .close_with_reason(position, Some(price), reason)
                .await
            {
                Ok(_) => report.closed += 1,
                Err(Error::InvalidState { .. }) => {
                    debug!(%position_id, "position closed elsewhere, skipping");
                }
                Err(e) => {
                    warn!(%position_id, error = %e, "auto-close failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Evaluate until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.engine.config().monitor_interval();
        info!(interval_secs = interval.as_secs(), "position monitor started");

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(report) if report.closed > 0 || report.liquidatable > 0 => info!(
                    checked = report.checked,
                    closed = report.closed,
                    liquidatable = report.liquidatable,
                    "position monitor pass"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "position monitor pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("position monitor stopped");
    }
}

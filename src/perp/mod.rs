//! Leveraged positions. Opening locks margin in the perp account of the
//! quote asset; closing releases it. No PnL is settled.

pub mod margin;

use chrono::{DateTime, Utc};
use ledger::{BalanceKey, Expect, Ledger, RecordQuery, Reference};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Engine, Error, Record, pair::TradingPair, spot::OrderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    TakeProfit,
    StopLoss,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
        }
    }
}

/// Immutable record of the requested trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub side: PositionSide,
    pub order_type: OrderType,
    pub leverage: u32,
    pub price: Decimal,
    pub amount: Decimal,
    pub margin: Decimal,
    pub notional: Decimal,
    pub margin_asset: String,
    pub created_at: DateTime<Utc>,
}

impl Record for PerpOrder {
    const KIND: &'static str = "perp_order";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn owner(&self) -> Uuid {
        self.user_id
    }

    fn status(&self) -> String {
        "accepted".to_string()
    }

    fn partition(&self) -> String {
        self.pair.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpPosition {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub side: PositionSide,
    pub leverage: u32,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub margin_asset: String,
    pub notional: Decimal,
    pub liquidation_price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub status: PositionStatus,
    pub exit_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PerpPosition {
    /// Which exit, if any, `price` hits. Unset (or zero) levels never fire.
    pub fn trigger(&self, price: Decimal) -> Option<CloseReason> {
        if self.status != PositionStatus::Open {
            return None;
        }
        let tp = self.take_profit.filter(|p| *p > Decimal::ZERO);
        let sl = self.stop_loss.filter(|p| *p > Decimal::ZERO);
        match self.side {
            PositionSide::Long => {
                if tp.is_some_and(|tp| price >= tp) {
                    Some(CloseReason::TakeProfit)
                } else if sl.is_some_and(|sl| price <= sl) {
                    Some(CloseReason::StopLoss)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if tp.is_some_and(|tp| price <= tp) {
                    Some(CloseReason::TakeProfit)
                } else if sl.is_some_and(|sl| price >= sl) {
                    Some(CloseReason::StopLoss)
                } else {
                    None
                }
            }
        }
    }

    pub fn is_liquidatable(&self, price: Decimal) -> bool {
        if self.status != PositionStatus::Open || self.liquidation_price <= Decimal::ZERO {
            return false;
        }
        match self.side {
            PositionSide::Long => price <= self.liquidation_price,
            PositionSide::Short => price >= self.liquidation_price,
        }
    }
}

impl Record for PerpPosition {
    const KIND: &'static str = "perp_position";

    fn record_id(&self) -> String {
        self.id.to_string()
    }

    fn owner(&self) -> Uuid {
        self.user_id
    }

    fn status(&self) -> String {
        self.status.as_str().to_string()
    }

    fn partition(&self) -> String {
        self.pair.clone()
    }

    /// One position per order.
    fn unique_keys(&self) -> Vec<String> {
        vec![format!("order:{}", self.order_id)]
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPositionRequest {
    pub user_id: Uuid,
    pub pair: String,
    pub side: PositionSide,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    pub leverage: u32,
    pub amount: Decimal,
    /// Entry price; the price book is used for market orders without one.
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub base_asset: Option<String>,
    #[serde(default)]
    pub quote_asset: Option<String>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

impl OpenPositionRequest {
    pub fn validate(&self, max_leverage: u32) -> Result<(), Error> {
        if self.leverage < 1 || self.leverage > max_leverage {
            return Err(Error::validation(format!(
                "leverage must be between 1 and {max_leverage}"
            )));
        }
        if self.amount <= Decimal::ZERO {
            return Err(Error::validation("amount must be positive"));
        }
        if self.price.is_some_and(|p| p <= Decimal::ZERO) {
            return Err(Error::validation("price must be positive"));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(Error::validation("limit orders require a price"));
        }
        for (name, level) in [("take_profit", self.take_profit), ("stop_loss", self.stop_loss)] {
            if level.is_some_and(|p| p.is_sign_negative()) {
                return Err(Error::validation(format!("{name} must not be negative")));
            }
        }
        Ok(())
    }
}

impl Engine {
    pub async fn open_position(&self, req: OpenPositionRequest) -> Result<PerpPosition, Error> {
        let config = self.config();
        req.validate(config.max_leverage)?;
        let pair = TradingPair::resolve(
            &req.pair,
            req.base_asset.as_deref(),
            req.quote_asset.as_deref(),
        )?;

        let entry_price = match req.price {
            Some(price) => price,
            None => self
                .prices()
                .get(&pair)
                .await
                .ok_or_else(|| Error::validation(format!("no usable price for {pair}")))?,
        };

        let notional = margin::notional(req.amount, entry_price)
            .ok_or_else(|| Error::validation("amount * price out of range"))?;
        let margin = margin::initial_margin(notional, req.leverage);
        if notional <= Decimal::ZERO || margin <= Decimal::ZERO {
            return Err(Error::validation("position notional must be positive"));
        }
        let liquidation_price = margin::liquidation_price(
            req.side,
            entry_price,
            req.leverage,
            config.maintenance_margin_ratio,
        )
        .ok_or_else(|| Error::validation("entry price out of range"))?;

        let key = BalanceKey::perp(req.user_id, &pair.quote);
        let available = self.ledger().adapter().get_balance(&key).await?.available;
        if available < margin {
            debug!(user_id = %req.user_id, asset = %key.asset, %available, required = %margin, "position rejected");
            return Err(Error::InsufficientFunds);
        }

        let now = Utc::now();
        let order = PerpOrder {
            id: Uuid::now_v7(),
            user_id: req.user_id,
            pair: pair.symbol(),
            side: req.side,
            order_type: req.order_type,
            leverage: req.leverage,
            price: entry_price,
            amount: req.amount,
            margin,
            notional,
            margin_asset: key.asset.clone(),
            created_at: now,
        };
        let position = PerpPosition {
            id: Uuid::now_v7(),
            order_id: order.id,
            user_id: req.user_id,
            pair: order.pair.clone(),
            side: req.side,
            leverage: req.leverage,
            amount: req.amount,
            entry_price,
            margin,
            margin_asset: key.asset.clone(),
            notional,
            liquidation_price,
            take_profit: req.take_profit.filter(|p| *p > Decimal::ZERO),
            stop_loss: req.stop_loss.filter(|p| *p > Decimal::ZERO),
            status: PositionStatus::Open,
            exit_price: None,
            close_reason: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        };

        let order_record = order.to_record()?;
        let position_record = position.to_record()?;
        let order_id = order.id;
        let metadata = json!({
            "pair": order.pair,
            "side": order.side,
            "order_type": order.order_type,
            "leverage": order.leverage,
            "position_id": position.id,
        });
        Ledger::atomic(self.ledger(), |tx| async move {
            tx.put_record(order_record, Expect::Absent)?;
            tx.put_record(position_record, Expect::Absent)?;
            tx.lock(&key, margin, Reference::perp_order(order_id), metadata)?;
            Ok::<_, Error>(())
        })
        .await?;

        counter!("kassa.positions.opened", "side" => position.side.as_str()).increment(1);
        info!(
            position_id = %position.id,
            order_id = %position.order_id,
            user_id = %position.user_id,
            pair = %position.pair,
            side = position.side.as_str(),
            leverage = position.leverage,
            margin = %position.margin,
            liquidation_price = %position.liquidation_price,
            "position opened"
        );
        Ok(position)
    }

    /// Close an open position and release its margin. `exit_price` falls
    /// back to the price book and is recorded as metadata only.
    pub async fn close_position(
        &self,
        user_id: Uuid,
        position_id: Uuid,
        exit_price: Option<Decimal>,
    ) -> Result<PerpPosition, Error> {
        let position = self
            .fetch::<PerpPosition>(&position_id.to_string())
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| Error::not_found("position", position_id))?;

        self.close_with_reason(position, exit_price, CloseReason::Manual)
            .await
    }

    pub(crate) async fn close_with_reason(
        &self,
        position: PerpPosition,
        exit_price: Option<Decimal>,
        reason: CloseReason,
    ) -> Result<PerpPosition, Error> {
        if position.status != PositionStatus::Open {
            debug!(position_id = %position.id, status = %position.status, "close rejected");
            return Err(Error::invalid_state(PerpPosition::KIND, position.id, "open"));
        }

        let exit_price = match exit_price.filter(|p| *p > Decimal::ZERO) {
            Some(price) => Some(price),
            None => match TradingPair::parse(&position.pair) {
                Ok(pair) => self.prices().get(&pair).await,
                Err(_) => None,
            },
        };

        let now = Utc::now();
        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        closed.exit_price = exit_price;
        closed.close_reason = Some(reason);
        closed.closed_at = Some(now);
        closed.updated_at = now;

        let record = closed.to_record()?;
        let key = BalanceKey::perp(position.user_id, &position.margin_asset);
        let (position_id, margin) = (position.id, position.margin);
        let metadata = json!({
            "exit_price": exit_price,
            "reason": reason,
            "order_id": position.order_id,
        });
        Ledger::atomic(self.ledger(), |tx| async move {
            tx.put_record(record, Expect::Status(PositionStatus::Open.as_str().to_string()))?;
            tx.unlock(&key, margin, Reference::perp_position(position_id), metadata)?;
            Ok::<_, Error>(())
        })
        .await?;

        counter!("kassa.positions.closed", "reason" => reason.as_str()).increment(1);
        info!(
            position_id = %closed.id,
            user_id = %closed.user_id,
            reason = reason.as_str(),
            exit_price = ?closed.exit_price,
            unlocked = %closed.margin,
            "position closed"
        );
        Ok(closed)
    }

    pub async fn position(&self, position_id: Uuid) -> Result<Option<PerpPosition>, Error> {
        self.fetch::<PerpPosition>(&position_id.to_string()).await
    }

    /// Newest first.
    pub async fn positions(
        &self,
        user_id: Uuid,
        status: Option<PositionStatus>,
    ) -> Result<Vec<PerpPosition>, Error> {
        let mut query = RecordQuery::kind(PerpPosition::KIND).owner(user_id);
        if let Some(status) = status {
            query = query.status(status.as_str());
        }
        self.query::<PerpPosition>(&query).await
    }

    pub async fn perp_orders(&self, user_id: Uuid) -> Result<Vec<PerpOrder>, Error> {
        self.query::<PerpOrder>(&RecordQuery::kind(PerpOrder::KIND).owner(user_id))
            .await
    }
}

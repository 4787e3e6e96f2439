//! Spot orders: funds are locked on placement and released on cancel.
//! There is no matching; an order stays open until it is canceled.

use chrono::{DateTime, Utc};
use ledger::{BalanceKey, Expect, Ledger, RecordQuery, Reference};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Engine, Error, Record, pair::TradingPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl FromStr for OrderSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(Error::validation(format!("unknown order side: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub locked_asset: String,
    pub locked_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for Order {
    const KIND: &'static str = "order";

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

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: Uuid,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Required for limit orders. For market orders it is the caller's
    /// reference price and is used ahead of the price book.
    #[serde(default)]
    pub price: Option<Decimal>,
    pub amount: Decimal,
    #[serde(default)]
    pub base_asset: Option<String>,
    #[serde(default)]
    pub quote_asset: Option<String>,
}

impl PlaceOrderRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::validation("amount must be positive"));
        }
        if let Some(price) = self.price {
            if price <= Decimal::ZERO {
                return Err(Error::validation("price must be positive"));
            }
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err(Error::validation("limit orders require a price"));
        }
        Ok(())
    }
}

/// Asset and amount an order reserves: quote for buys, base for sells.
pub fn locked_funds(
    pair: &TradingPair,
    side: OrderSide,
    amount: Decimal,
    price: Option<Decimal>,
) -> Result<(String, Decimal), Error> {
    match side {
        OrderSide::Buy => {
            let price = price.ok_or_else(|| Error::validation("no usable price for buy order"))?;
            let cost = amount
                .checked_mul(price)
                .ok_or_else(|| Error::validation("amount * price out of range"))?;
            Ok((pair.quote.clone(), cost))
        }
        OrderSide::Sell => Ok((pair.base.clone(), amount)),
    }
}

impl Engine {
    pub async fn place_order(&self, req: PlaceOrderRequest) -> Result<Order, Error> {
        req.validate()?;
        let pair = TradingPair::resolve(
            &req.pair,
            req.base_asset.as_deref(),
            req.quote_asset.as_deref(),
        )?;

        let price = match (req.order_type, req.price) {
            (_, Some(price)) => Some(price),
            (OrderType::Market, None) => self.prices().get(&pair).await,
            (OrderType::Limit, None) => None,
        };

        let (locked_asset, locked_amount) = locked_funds(&pair, req.side, req.amount, price)?;
        if locked_amount <= Decimal::ZERO {
            return Err(Error::validation("order locks nothing"));
        }

        let key = BalanceKey::spot(req.user_id, &locked_asset);
        let available = self.ledger().adapter().get_balance(&key).await?.available;
        if available < locked_amount {
            debug!(user_id = %req.user_id, asset = %key.asset, %available, required = %locked_amount, "order rejected");
            return Err(Error::InsufficientFunds);
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::now_v7(),
            user_id: req.user_id,
            pair: pair.symbol(),
            base_asset: pair.base.clone(),
            quote_asset: pair.quote.clone(),
            side: req.side,
            order_type: req.order_type,
            price,
            amount: req.amount,
            locked_asset: key.asset.clone(),
            locked_amount,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        };

        let record = order.to_record()?;
        let metadata = json!({
            "pair": order.pair,
            "side": order.side,
            "order_type": order.order_type,
        });
        let order_id = order.id;
        Ledger::atomic(self.ledger(), |tx| async move {
            tx.put_record(record, Expect::Absent)?;
            tx.lock(&key, locked_amount, Reference::order(order_id), metadata)?;
            Ok::<_, Error>(())
        })
        .await?;

        counter!("kassa.orders.placed", "side" => order.side.as_str()).increment(1);
        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            pair = %order.pair,
            side = order.side.as_str(),
            locked_asset = %order.locked_asset,
            locked_amount = %order.locked_amount,
            "order placed"
        );
        Ok(order)
    }

    /// Cancel an open order and release its lock. A second cancel of the
    /// same order fails with `InvalidState` and unlocks nothing.
    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid) -> Result<Order, Error> {
        let order = self
            .fetch::<Order>(&order_id.to_string())
            .await?
            .filter(|o| o.user_id == user_id)
            .ok_or_else(|| Error::not_found("order", order_id))?;

        if order.status != OrderStatus::Open {
            debug!(order_id = %order.id, status = %order.status, "cancel rejected");
            return Err(Error::invalid_state(Order::KIND, order.id, "open"));
        }

        let mut canceled = order.clone();
        canceled.status = OrderStatus::Canceled;
        canceled.updated_at = Utc::now();

        let record = canceled.to_record()?;
        let key = BalanceKey::spot(order.user_id, &order.locked_asset);
        let metadata = json!({ "pair": order.pair, "side": order.side });
        Ledger::atomic(self.ledger(), |tx| async move {
            tx.put_record(record, Expect::Status(OrderStatus::Open.as_str().to_string()))?;
            tx.unlock(&key, order.locked_amount, Reference::order(order.id), metadata)?;
            Ok::<_, Error>(())
        })
        .await?;

        counter!("kassa.orders.canceled").increment(1);
        info!(
            order_id = %canceled.id,
            user_id = %canceled.user_id,
            unlocked = %canceled.locked_amount,
            asset = %canceled.locked_asset,
            "order canceled"
        );
        Ok(canceled)
    }

    pub async fn order(&self, order_id: Uuid) -> Result<Option<Order>, Error> {
        self.fetch::<Order>(&order_id.to_string()).await
    }

    /// Newest first.
    pub async fn orders(
        &self,
        user_id: Uuid,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, Error> {
        let mut query = RecordQuery::kind(Order::KIND).owner(user_id);
        if let Some(status) = status {
            query = query.status(status.as_str());
        }
        self.query::<Order>(&query).await
    }
}

mod common;

use async_trait::async_trait;
use common::{available, config, engine, locked, seed};
use kassa::ledger::{
    AccountType, Balance, BalanceKey, EntryFilter, EntryType, ExecutionPlan, LedgerAdapter,
    LedgerEntry, LedgerError, MemoryAdapter, ObjectRecord, Operation, PlanReceipt, RecordQuery,
    Reference,
};
use kassa::{
    AdjustBalanceRequest, Engine, Error, OrderSide, OrderStatus, OrderType, PlaceOrderRequest,
    TradingPair, TransferRequest,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

fn limit_buy(user_id: Uuid, amount: Decimal, price: Decimal) -> PlaceOrderRequest {
    PlaceOrderRequest {
        user_id,
        pair: "BTC/USDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        price: Some(price),
        amount,
        base_asset: None,
        quote_asset: None,
    }
}

#[tokio::test]
async fn test_spot_place_and_cancel() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let order = engine
        .place_order(limit_buy(user, dec!(0.01), dec!(50000)))
        .await
        .unwrap();
    assert_eq!(order.locked_amount, dec!(500));
    assert_eq!(order.locked_asset, "USDT");
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(500));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, dec!(500));

    let canceled = engine.cancel_order(user, order.id).await.unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(1000));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, Decimal::ZERO);

    let entries = engine
        .ledger_entries(&EntryFilter::for_reference(&Reference::order(order.id)))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    // newest first
    assert_eq!(entries[0].entry_type, EntryType::Unlock);
    assert_eq!(entries[1].entry_type, EntryType::Lock);
    assert!(entries.iter().all(|e| e.amount == dec!(500) && e.asset == "USDT"));
}

#[tokio::test]
async fn test_sell_order_locks_base() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "BTC", AccountType::Spot, dec!(1)).await;

    let order = engine
        .place_order(PlaceOrderRequest {
            user_id: user,
            pair: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            price: Some(dec!(60000)),
            amount: dec!(0.25),
            base_asset: None,
            quote_asset: None,
        })
        .await
        .unwrap();

    assert_eq!(order.locked_asset, "BTC");
    assert_eq!(order.locked_amount, dec!(0.25));
    assert_eq!(available(&engine, user, "BTC", AccountType::Spot).await, dec!(0.75));
}

#[tokio::test]
async fn test_order_rejected_without_funds() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(100)).await;

    let err = engine
        .place_order(limit_buy(user, dec!(0.01), dec!(50000)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds));
    assert!(engine.orders(user, None).await.unwrap().is_empty());
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(100));
}

#[tokio::test]
async fn test_market_order_uses_price_book() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let mut req = limit_buy(user, dec!(0.01), dec!(1));
    req.order_type = OrderType::Market;
    req.price = None;

    // no price, no order
    let err = engine.place_order(req.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    engine
        .prices()
        .set(TradingPair::new("BTC", "USDT"), dec!(40000))
        .await;
    let order = engine.place_order(req).await.unwrap();
    assert_eq!(order.locked_amount, dec!(400));
}

#[tokio::test]
async fn test_double_cancel_is_invalid_state() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let order = engine
        .place_order(limit_buy(user, dec!(0.01), dec!(50000)))
        .await
        .unwrap();
    engine.cancel_order(user, order.id).await.unwrap();

    let err = engine.cancel_order(user, order.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(1000));

    let unlocks = engine
        .ledger_entries(
            &EntryFilter::for_reference(&Reference::order(order.id)).entry_type(EntryType::Unlock),
        )
        .await
        .unwrap();
    assert_eq!(unlocks.len(), 1);
}

#[tokio::test]
async fn test_cancel_other_users_order_is_not_found() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;
    let order = engine
        .place_order(limit_buy(user, dec!(0.01), dec!(50000)))
        .await
        .unwrap();

    let err = engine.cancel_order(Uuid::now_v7(), order.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancels_unlock_once() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;
    let order = engine
        .place_order(limit_buy(user, dec!(0.01), dec!(50000)))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cancel_order(user, order.id).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::InvalidState { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(1000));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_transfer_conserves_funds() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Funding, dec!(300)).await;

    let transfer = engine
        .transfer(TransferRequest {
            user_id: user,
            asset: "usdt".to_string(),
            from: AccountType::Funding,
            to: AccountType::Spot,
            amount: dec!(120),
        })
        .await
        .unwrap();

    assert_eq!(available(&engine, user, "USDT", AccountType::Funding).await, dec!(180));
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(120));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Funding).await, Decimal::ZERO);
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, Decimal::ZERO);

    let entries = engine
        .ledger_entries(&EntryFilter::for_reference(&Reference::transfer(transfer.id)))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.entry_type == EntryType::Debit));
    assert!(entries.iter().any(|e| e.entry_type == EntryType::Credit));
}

#[tokio::test]
async fn test_transfer_rejections() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Funding, dec!(50)).await;

    let over = engine
        .transfer(TransferRequest {
            user_id: user,
            asset: "USDT".to_string(),
            from: AccountType::Funding,
            to: AccountType::Perp,
            amount: dec!(51),
        })
        .await
        .unwrap_err();
    assert!(matches!(over, Error::InsufficientFunds));

    let same = engine
        .transfer(TransferRequest {
            user_id: user,
            asset: "USDT".to_string(),
            from: AccountType::Funding,
            to: AccountType::Funding,
            amount: dec!(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(same, Error::Validation(_)));
    assert_eq!(available(&engine, user, "USDT", AccountType::Funding).await, dec!(50));
}

#[tokio::test]
async fn test_adjust_balance_records_adjustment() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "ETH", AccountType::Funding, dec!(2)).await;

    let adjustment = engine
        .adjust_balance(AdjustBalanceRequest {
            user_id: user,
            asset: "ETH".to_string(),
            account_type: AccountType::Funding,
            available: dec!(1.5),
            locked: dec!(0.2),
            reason: Some("support ticket".to_string()),
            admin_id: Some("ops-7".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(adjustment.delta, dec!(-0.3));

    let balance = engine.balance(user, "ETH", AccountType::Funding).await.unwrap();
    assert_eq!(balance.available, dec!(1.5));
    assert_eq!(balance.locked, dec!(0.2));

    let entries = engine
        .ledger_entries(&EntryFilter::for_reference(&Reference::admin("ops-7")))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, EntryType::Adjustment);
    assert_eq!(entries[0].amount, dec!(-0.3));
}

#[tokio::test]
async fn test_balances_by_account() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Funding, dec!(10)).await;
    seed(&engine, user, "USDT", AccountType::Spot, dec!(20)).await;
    seed(&engine, user, "BTC", AccountType::Spot, dec!(1)).await;

    assert_eq!(engine.balances(user, None).await.unwrap().len(), 3);
    assert_eq!(
        engine
            .balances(user, Some(AccountType::Spot))
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_order_cost_out_of_range_is_rejected() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let err = engine
        .place_order(limit_buy(user, Decimal::MAX, dec!(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.orders(user, None).await.unwrap().is_empty());
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(1000));
}

#[tokio::test]
async fn test_overflowing_transfer_leaves_engine_usable() {
    let engine = engine();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Funding, dec!(5)).await;
    seed(&engine, user, "USDT", AccountType::Spot, Decimal::MAX).await;

    let err = engine
        .transfer(TransferRequest {
            user_id: user,
            asset: "USDT".to_string(),
            from: AccountType::Funding,
            to: AccountType::Spot,
            amount: dec!(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert_eq!(available(&engine, user, "USDT", AccountType::Funding).await, dec!(5));
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, Decimal::MAX);
    engine
        .transfer(TransferRequest {
            user_id: user,
            asset: "USDT".to_string(),
            from: AccountType::Funding,
            to: AccountType::Perp,
            amount: dec!(1),
        })
        .await
        .unwrap();
    assert_eq!(available(&engine, user, "USDT", AccountType::Perp).await, dec!(1));
}

/// Memory store that, once armed, commits a lock on the row right after the
/// next balance read, as a concurrent order would.
struct LockAfterRead {
    inner: MemoryAdapter,
    armed: Arc<AtomicBool>,
    amount: Decimal,
}

#[async_trait]
impl LedgerAdapter for LockAfterRead {
    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<PlanReceipt, LedgerError> {
        self.inner.execute_plan(plan).await
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Balance, LedgerError> {
        let balance = self.inner.get_balance(key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut plan = ExecutionPlan::new();
            plan.add(Operation::Lock {
                key: key.clone(),
                amount: self.amount,
            });
            self.inner.execute_plan(&plan).await?;
        }
        Ok(balance)
    }

    async fn get_balances(
        &self,
        user_id: Uuid,
        account_type: Option<AccountType>,
    ) -> Result<Vec<Balance>, LedgerError> {
        self.inner.get_balances(user_id, account_type).await
    }

    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.get_entries(filter).await
    }

    async fn get_record(&self, kind: &str, id: &str) -> Result<Option<ObjectRecord>, LedgerError> {
        self.inner.get_record(kind, id).await
    }

    async fn find_record_by_key(
        &self,
        kind: &str,
        key: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError> {
        self.inner.find_record_by_key(kind, key).await
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ObjectRecord>, LedgerError> {
        self.inner.query_records(query).await
    }
}

#[tokio::test]
async fn test_adjust_balance_rejects_moved_row() {
    let armed = Arc::new(AtomicBool::new(false));
    let adapter = LockAfterRead {
        inner: MemoryAdapter::new(),
        armed: armed.clone(),
        amount: dec!(500),
    };
    let engine = Engine::new(Box::new(adapter), config()).unwrap();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let request = AdjustBalanceRequest {
        user_id: user,
        asset: "USDT".to_string(),
        account_type: AccountType::Spot,
        available: dec!(1200),
        locked: Decimal::ZERO,
        reason: Some("bonus".to_string()),
        admin_id: Some("ops-9".to_string()),
    };

    armed.store(true, Ordering::SeqCst);
    let err = engine.adjust_balance(request.clone()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    // the lock that landed in between survives
    assert_eq!(available(&engine, user, "USDT", AccountType::Spot).await, dec!(500));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, dec!(500));
    let by_admin = EntryFilter::for_reference(&Reference::admin("ops-9"));
    assert!(engine.ledger_entries(&by_admin).await.unwrap().is_empty());

    let adjustment = engine.adjust_balance(request).await.unwrap();
    assert_eq!(adjustment.previous_locked, dec!(500));
    assert_eq!(adjustment.delta, dec!(200));
    let entries = engine.ledger_entries(&by_admin).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, dec!(200));
    assert_eq!(locked(&engine, user, "USDT", AccountType::Spot).await, Decimal::ZERO);
}

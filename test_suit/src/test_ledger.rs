use ledger::{
    BalanceKey, EntryFilter, EntryType, Expect, Ledger, LedgerAdapter, LedgerContext,
    LedgerError, ObjectRecord, Reference,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::setup_adapter;

fn record(kind: &str, id: &str, owner: Uuid, status: &str, keys: &[&str]) -> ObjectRecord {
    let now = chrono::Utc::now();
    ObjectRecord {
        kind: kind.to_string(),
        id: id.to_string(),
        owner,
        status: status.to_string(),
        partition: String::new(),
        data: json!({ "status": status }),
        unique_keys: keys.iter().map(|k| k.to_string()).collect(),
        created_at: now,
        updated_at: now,
    }
}

async fn seed(ctx: &LedgerContext, key: &BalanceKey, amount: Decimal) {
    let key = key.clone();
    Ledger::atomic(ctx, |tx| async move {
        tx.credit(&key, amount, Reference::admin("seed"), Value::Null)
    })
    .await
    .unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_lock_unlock_roundtrip() {
    let (_resource, adapter) = setup_adapter().await;
    let ctx = LedgerContext::new(Arc::new(adapter));
    let user = Uuid::now_v7();
    let key = BalanceKey::spot(user, "USDT");
    seed(&ctx, &key, dec!(1000)).await;

    let order = Uuid::now_v7();
    let k = key.clone();
    Ledger::atomic(&ctx, |tx| async move {
        tx.lock(&k, dec!(500), Reference::order(order), Value::Null)
    })
    .await
    .unwrap();

    let balance = ctx.adapter().get_balance(&key).await.unwrap();
    assert_eq!(balance.available, dec!(500));
    assert_eq!(balance.locked, dec!(500));

    let k = key.clone();
    Ledger::atomic(&ctx, |tx| async move {
        tx.unlock(&k, dec!(500), Reference::order(order), Value::Null)
    })
    .await
    .unwrap();

    let balance = ctx.adapter().get_balance(&key).await.unwrap();
    assert_eq!(balance.available, dec!(1000));
    assert_eq!(balance.locked, Decimal::ZERO);

    let entries = ctx
        .adapter()
        .get_entries(&EntryFilter::for_reference(&Reference::order(order)))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entry_type, EntryType::Unlock);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_failed_plan_rolls_back() {
    let (_resource, adapter) = setup_adapter().await;
    let ctx = LedgerContext::new(Arc::new(adapter));
    let user = Uuid::now_v7();
    let funding = BalanceKey::funding(user, "ETH");
    let spot = BalanceKey::spot(user, "ETH");
    seed(&ctx, &funding, dec!(1)).await;

    let (f, s) = (funding.clone(), spot.clone());
    let id = Uuid::now_v7();
    let err = Ledger::atomic(&ctx, |tx| async move {
        tx.credit(&s, dec!(5), Reference::transfer(id), Value::Null)?;
        tx.debit(&f, dec!(5), Reference::transfer(id), Value::Null)
    })
    .await
    .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds));

    assert_eq!(ctx.adapter().get_balance(&spot).await.unwrap().available, Decimal::ZERO);
    assert_eq!(ctx.adapter().get_balance(&funding).await.unwrap().available, dec!(1));
    let entries = ctx
        .adapter()
        .get_entries(&EntryFilter::for_reference(&Reference::transfer(id)))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_deposit_credit_once() {
    let (_resource, adapter) = setup_adapter().await;
    let ctx = LedgerContext::new(Arc::new(adapter));
    let key = BalanceKey::funding(Uuid::now_v7(), "ETH");

    for _ in 0..2 {
        let k = key.clone();
        Ledger::atomic(&ctx, |tx| async move {
            tx.credit_deposit_once(&k, dec!(2.5), "0xabc", Value::Null)
        })
        .await
        .unwrap();
    }

    let balance = ctx.adapter().get_balance(&key).await.unwrap();
    assert_eq!(balance.available, dec!(2.5));
    let credits = ctx
        .adapter()
        .get_entries(&EntryFilter::for_reference(&Reference::deposit("0xabc")))
        .await
        .unwrap();
    assert_eq!(credits.len(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_entries_are_append_only() {
    let (_resource, adapter) = setup_adapter().await;
    let pool = adapter.pool().clone();
    let ctx = LedgerContext::new(Arc::new(adapter));
    seed(&ctx, &BalanceKey::spot(Uuid::now_v7(), "BTC"), dec!(1)).await;

    let result = sqlx::query("UPDATE ledger_entries SET amount = 0")
        .execute(&pool)
        .await;
    assert!(result.is_err());
    let result = sqlx::query("DELETE FROM ledger_entries").execute(&pool).await;
    assert!(result.is_err());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_record_guard_and_unique_keys() {
    let (_resource, adapter) = setup_adapter().await;
    let ctx = LedgerContext::new(Arc::new(adapter));
    let owner = Uuid::now_v7();

    let first = record("deposit_address", "eth:1", owner, "active", &["eth:index:0"]);
    Ledger::atomic(&ctx, |tx| async move { tx.put_record(first, Expect::Absent) })
        .await
        .unwrap();

    let clash = record("deposit_address", "eth:2", Uuid::now_v7(), "active", &["eth:index:0"]);
    let err = Ledger::atomic(&ctx, |tx| async move { tx.put_record(clash, Expect::Absent) })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
    assert!(ctx.adapter().get_record("deposit_address", "eth:2").await.unwrap().is_none());

    let found = ctx
        .adapter()
        .find_record_by_key("deposit_address", "eth:index:0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "eth:1");

    let order = record("order", "o1", owner, "open", &[]);
    Ledger::atomic(&ctx, |tx| async move { tx.put_record(order, Expect::Absent) })
        .await
        .unwrap();
    for expected_ok in [true, false] {
        let canceled = record("order", "o1", owner, "canceled", &[]);
        let result = Ledger::atomic(&ctx, |tx| async move {
            tx.put_record(canceled, Expect::Status("open".to_string()))
        })
        .await;
        assert_eq!(result.is_ok(), expected_ok);
        if !expected_ok {
            assert!(matches!(result, Err(LedgerError::GuardFailed { .. })));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_concurrent_locks_never_overdraw() {
    let (_resource, adapter) = setup_adapter().await;
    let ctx = LedgerContext::new(Arc::new(adapter));
    let key = BalanceKey::perp(Uuid::now_v7(), "USDT");
    seed(&ctx, &key, dec!(100)).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let (ctx, key) = (ctx.clone(), key.clone());
            tokio::spawn(async move {
                Ledger::atomic(&ctx, |tx| async move {
                    tx.lock(&key, dec!(30), Reference::perp_order(Uuid::now_v7()), Value::Null)
                })
                .await
            })
        })
        .collect();

    let mut locked = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            locked += 1;
        }
    }

    assert_eq!(locked, 3);
    let balance = ctx.adapter().get_balance(&key).await.unwrap();
    assert_eq!(balance.available, dec!(10));
    assert_eq!(balance.locked, dec!(90));
}

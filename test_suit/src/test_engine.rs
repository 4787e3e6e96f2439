use async_trait::async_trait;
use kassa::ledger::AccountType;
use kassa::{
    AddressDeriver, AdjustBalanceRequest, ChainOracle, ChainTransfer, DepositReconciler,
    DepositStatus, Engine, EngineConfig, Error, OrderSide, OrderType, PlaceOrderRequest,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::setup_adapter;

struct Deriver;

impl AddressDeriver for Deriver {
    fn derive(&self, _chain: &str, index: u32) -> Result<String, Error> {
        Ok(format!("0x{index:040x}"))
    }
}

#[derive(Default)]
struct Oracle {
    transfers: Mutex<Vec<ChainTransfer>>,
}

#[async_trait]
impl ChainOracle for Oracle {
    fn chain(&self) -> &str {
        "ethereum"
    }

    async fn transfers_to(&self, address: &str) -> Result<Vec<ChainTransfer>, Error> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers
            .iter()
            .filter(|t| t.to_address == address)
            .cloned()
            .collect())
    }

    async fn transfer_by_hash(&self, tx_hash: &str) -> Result<Option<ChainTransfer>, Error> {
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers.iter().find(|t| t.tx_hash == tx_hash).cloned())
    }
}

async fn seed(engine: &Engine, user_id: Uuid, asset: &str, account: AccountType, amount: Decimal) {
    engine
        .adjust_balance(AdjustBalanceRequest {
            user_id,
            asset: asset.to_string(),
            account_type: account,
            available: amount,
            locked: Decimal::ZERO,
            reason: None,
            admin_id: None,
        })
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn test_spot_cancel_race() {
    let (_resource, adapter) = setup_adapter().await;
    let engine = Engine::new(Box::new(adapter), EngineConfig::default()).unwrap();
    let user = Uuid::now_v7();
    seed(&engine, user, "USDT", AccountType::Spot, dec!(1000)).await;

    let order = engine
        .place_order(PlaceOrderRequest {
            user_id: user,
            pair: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(50000)),
            amount: dec!(0.01),
            base_asset: None,
            quote_asset: None,
        })
        .await
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cancel_order(user, order.id).await })
        })
        .collect();
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 1);
    let balance = engine.balance(user, "USDT", AccountType::Spot).await.unwrap();
    assert_eq!(balance.available, dec!(1000));
    assert_eq!(balance.locked, Decimal::ZERO);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_deposit_lifecycle() {
    let (_resource, adapter) = setup_adapter().await;
    let oracle = Arc::new(Oracle::default());
    let engine = Engine::builder(Box::new(adapter))
        .deriver(Arc::new(Deriver))
        .chain_oracle(oracle.clone())
        .build()
        .unwrap();

    let user = Uuid::now_v7();
    let address = engine.allocate_deposit_address(user, "ethereum").await.unwrap();
    let reconciler = DepositReconciler::new(engine.clone());

    for confirmations in [3, 12, 15] {
        *oracle.transfers.lock().unwrap() = vec![ChainTransfer {
            tx_hash: "0xfeed".to_string(),
            asset: "ETH".to_string(),
            from_address: "0xsender".to_string(),
            to_address: address.address.clone(),
            amount: dec!(2.5),
            confirmations,
            finalized: false,
            destination_tag: None,
            failed: false,
            block_time: None,
        }];
        reconciler.poll_once().await;

        let funded = engine.balance(user, "ETH", AccountType::Funding).await.unwrap();
        let expected = if confirmations < 12 { Decimal::ZERO } else { dec!(2.5) };
        assert_eq!(funded.available, expected);
    }

    let deposit = engine.deposit("ethereum", "0xfeed").await.unwrap().unwrap();
    assert_eq!(deposit.status, DepositStatus::Credited);
    assert_eq!(deposit.confirmations, 15);
}

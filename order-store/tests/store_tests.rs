use std::sync::Arc;

use chrono::{Duration, Utc};
use common::decimal::dec;
use common::error::Error;
use common::model::order::{Side, Status};
use order_store::{
    AdvisoryLocks, InMemoryLockRegistry, InMemoryOrderRepository, LockClass, OrderLifecycle,
    OrderRepository,
};
use uuid::Uuid;
use wallet_ledger::repository::WalletRepository;
use wallet_ledger::InMemoryWalletRepository;

struct Fixture {
    wallets: Arc<InMemoryWalletRepository>,
    repo: Arc<InMemoryOrderRepository>,
    lifecycle: OrderLifecycle,
    pair_id: i32,
    primary: i32,
    secondary: i32,
}

async fn fixture() -> Fixture {
    let wallets = Arc::new(InMemoryWalletRepository::new());
    let repo = Arc::new(InMemoryOrderRepository::new(wallets.clone()));
    let btc = repo.create_currency("BTC", "Bitcoin").await.unwrap();
    let usd = repo.create_currency("USD", "US Dollar").await.unwrap();
    let pair = repo.create_pair(btc.id, usd.id).await.unwrap();
    let lifecycle = OrderLifecycle::new(repo.clone());
    Fixture {
        wallets,
        repo,
        lifecycle,
        pair_id: pair.id,
        primary: btc.id,
        secondary: usd.id,
    }
}

async fn fund(f: &Fixture, owner: Uuid, currency: i32, amount: common::decimal::Amount) {
    f.wallets.credit(owner, currency, amount).await.unwrap();
}

#[tokio::test]
async fn submit_buy_reserves_secondary_currency() {
    let f = fixture().await;
    let buyer = Uuid::new_v4();
    fund(&f, buyer, f.secondary, dec!(1000)).await;

    let order = f
        .lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(2), dec!(100))
        .await
        .unwrap();

    assert_eq!(order.status, Status::Open);
    let wallet = f.wallets.wallet(buyer, f.secondary).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(800));
}

#[tokio::test]
async fn submit_sell_reserves_primary_currency() {
    let f = fixture().await;
    let seller = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(1000)).await;

    f.lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(2), dec!(100))
        .await
        .unwrap();

    let wallet = f.wallets.wallet(seller, f.primary).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(998));
}

#[tokio::test]
async fn insufficient_funds_leaves_no_order() {
    let f = fixture().await;
    let buyer = Uuid::new_v4();
    fund(&f, buyer, f.secondary, dec!(100)).await;

    let result = f
        .lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(2), dec!(100))
        .await;
    assert!(matches!(result, Err(Error::InsufficientFunds(_))));

    assert!(f.lifecycle.orders_for(buyer).await.unwrap().is_empty());
    let wallet = f.wallets.wallet(buyer, f.secondary).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(100));
}

#[tokio::test]
async fn invalid_quantity_and_price_are_rejected() {
    let f = fixture().await;
    let owner = Uuid::new_v4();

    assert!(matches!(
        f.lifecycle
            .submit(owner, f.pair_id, Side::Buy, dec!(0), dec!(100))
            .await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        f.lifecycle
            .submit(owner, f.pair_id, Side::Sell, dec!(1), dec!(-5))
            .await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_pair_is_rejected() {
    let f = fixture().await;
    let result = f
        .lifecycle
        .submit(Uuid::new_v4(), 999, Side::Buy, dec!(1), dec!(1))
        .await;
    assert!(matches!(result, Err(Error::PairNotFound(_))));
}

#[tokio::test]
async fn cancel_refunds_exactly_the_unfilled_reservation() {
    let f = fixture().await;
    let buyer = Uuid::new_v4();
    fund(&f, buyer, f.secondary, dec!(1000)).await;

    // Reserve 5 * 101 = 505
    let order = f
        .lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(5), dec!(101))
        .await
        .unwrap();
    let wallet = f.wallets.wallet(buyer, f.secondary).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(495));

    // Fill 2 through a settlement against a matching sell
    let seller = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(10)).await;
    let sell = f
        .lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(2), dec!(101))
        .await
        .unwrap();
    f.repo
        .execute_settlement(order_store::Settlement {
            pair: order.pair,
            sell_order_id: sell.id,
            buy_order_id: order.id,
            seller,
            buyer,
            fill_quantity: dec!(2),
            price: dec!(101),
            overpayment_amount: dec!(0),
            trade_at: Utc::now(),
        })
        .await
        .unwrap();

    // Cancel refunds (5 - 2) * 101 = 303
    let cancelled = f.lifecycle.cancel(buyer, order.id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);

    let wallet = f.wallets.wallet(buyer, f.secondary).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(1000) - dec!(505) + dec!(303));
}

#[tokio::test]
async fn cancel_is_rejected_for_non_owner_and_unknown_orders() {
    let f = fixture().await;
    let owner = Uuid::new_v4();
    fund(&f, owner, f.secondary, dec!(100)).await;

    let order = f
        .lifecycle
        .submit(owner, f.pair_id, Side::Buy, dec!(1), dec!(100))
        .await
        .unwrap();

    assert!(matches!(
        f.lifecycle.cancel(Uuid::new_v4(), order.id).await,
        Err(Error::NotOwner(_))
    ));
    assert!(matches!(
        f.lifecycle.cancel(owner, Uuid::new_v4()).await,
        Err(Error::OrderNotFound(_))
    ));
}

#[tokio::test]
async fn double_cancel_has_no_second_refund() {
    let f = fixture().await;
    let owner = Uuid::new_v4();
    fund(&f, owner, f.secondary, dec!(500)).await;

    let order = f
        .lifecycle
        .submit(owner, f.pair_id, Side::Buy, dec!(2), dec!(100))
        .await
        .unwrap();

    f.lifecycle.cancel(owner, order.id).await.unwrap();
    let balance_after_first = f
        .wallets
        .wallet(owner, f.secondary)
        .await
        .unwrap()
        .unwrap()
        .balance;
    assert_eq!(balance_after_first, dec!(500));

    let second = f.lifecycle.cancel(owner, order.id).await;
    assert!(matches!(second, Err(Error::InvalidTransition(_))));

    let balance_after_second = f
        .wallets
        .wallet(owner, f.secondary)
        .await
        .unwrap()
        .unwrap()
        .balance;
    assert_eq!(balance_after_second, dec!(500));
}

#[tokio::test]
async fn creation_time_is_forward_adjusted_past_the_trade_clock() {
    let f = fixture().await;
    let owner = Uuid::new_v4();
    fund(&f, owner, f.secondary, dec!(1000)).await;

    // Engine holds the lock with a trade clock in the near future
    let trade_at = Utc::now() + Duration::seconds(30);
    f.repo.acquire_engine_lock(Utc::now(), false).await.unwrap();
    f.repo.stamp_trade_at(trade_at).await.unwrap();

    let order = f
        .lifecycle
        .submit(owner, f.pair_id, Side::Buy, dec!(1), dec!(100))
        .await
        .unwrap();

    assert_eq!(order.created_at, trade_at + Duration::microseconds(1));
}

#[tokio::test]
async fn creation_time_is_untouched_after_the_trade_clock() {
    let f = fixture().await;
    let owner = Uuid::new_v4();
    fund(&f, owner, f.secondary, dec!(1000)).await;

    let trade_at = Utc::now() - Duration::seconds(30);
    f.repo.acquire_engine_lock(Utc::now(), false).await.unwrap();
    f.repo.stamp_trade_at(trade_at).await.unwrap();

    let before = Utc::now();
    let order = f
        .lifecycle
        .submit(owner, f.pair_id, Side::Buy, dec!(1), dec!(100))
        .await
        .unwrap();
    assert!(order.created_at >= before);
}

#[tokio::test]
async fn candidates_require_a_crossing_opposite_order() {
    let f = fixture().await;
    let registry = InMemoryLockRegistry::new();
    let locks = registry.session();

    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(100)).await;
    fund(&f, buyer, f.secondary, dec!(10000)).await;

    // Sell at 10 vs buy at 9: no cross, no candidates
    f.lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(10))
        .await
        .unwrap();
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(9))
        .await
        .unwrap();

    let candidates = f.repo.candidates(Utc::now(), &locks).await.unwrap();
    assert!(candidates.is_empty());

    // A buy at 10 crosses: all three active orders become candidates
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(10))
        .await
        .unwrap();
    let candidates = f.repo.candidates(Utc::now(), &locks).await.unwrap();
    assert_eq!(candidates.len(), 3);
}

#[tokio::test]
async fn candidates_are_sorted_for_the_two_cursor_walk() {
    let f = fixture().await;
    let registry = InMemoryLockRegistry::new();
    let locks = registry.session();

    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(100)).await;
    fund(&f, buyer, f.secondary, dec!(10000)).await;

    let s10 = f
        .lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(10))
        .await
        .unwrap();
    let s8 = f
        .lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(8))
        .await
        .unwrap();
    let b11 = f
        .lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(11))
        .await
        .unwrap();
    let b10 = f
        .lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(10))
        .await
        .unwrap();

    let candidates = f.repo.candidates(Utc::now(), &locks).await.unwrap();
    let ids: Vec<_> = candidates.iter().map(|o| o.id).collect();
    // Sells ascend by price from the head; buys ascend by price toward the
    // tail, so the backward-walking buy cursor meets the best buy first
    assert_eq!(ids, vec![s8.id, s10.id, b10.id, b11.id]);
}

#[tokio::test]
async fn candidates_skip_orders_locked_by_another_session() {
    let f = fixture().await;
    let registry = InMemoryLockRegistry::new();
    let mine = registry.session();
    let other = registry.session();

    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(100)).await;
    fund(&f, buyer, f.secondary, dec!(10000)).await;

    let sell = f
        .lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(10))
        .await
        .unwrap();
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(10))
        .await
        .unwrap();

    // Another session already holds the sell order
    assert!(other.try_lock(LockClass::Order, sell.seq).await.unwrap());

    let candidates = f.repo.candidates(Utc::now(), &mine).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].side, Side::Buy);
}

#[tokio::test]
async fn candidates_exclude_orders_created_after_the_cutoff() {
    let f = fixture().await;
    let registry = InMemoryLockRegistry::new();
    let locks = registry.session();

    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(100)).await;
    fund(&f, buyer, f.secondary, dec!(10000)).await;

    f.lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(10))
        .await
        .unwrap();
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(10))
        .await
        .unwrap();

    // A cutoff before both orders yields nothing
    let candidates = f
        .repo
        .candidates(Utc::now() - Duration::seconds(60), &locks)
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn engine_lock_excludes_second_instance_until_forced() {
    let f = fixture().await;

    f.repo.acquire_engine_lock(Utc::now(), false).await.unwrap();

    let second = f.repo.acquire_engine_lock(Utc::now(), false).await;
    assert!(matches!(second, Err(Error::EngineAlreadyRunning(_))));

    // Force steals the stuck lock
    f.repo.acquire_engine_lock(Utc::now(), true).await.unwrap();

    // Release frees it for a clean acquire
    f.repo.release_engine_lock().await.unwrap();
    f.repo.acquire_engine_lock(Utc::now(), false).await.unwrap();
}

#[tokio::test]
async fn book_snapshot_sorts_both_sides_best_first() {
    let f = fixture().await;
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();
    fund(&f, seller, f.primary, dec!(100)).await;
    fund(&f, buyer, f.secondary, dec!(10000)).await;

    f.lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(102))
        .await
        .unwrap();
    f.lifecycle
        .submit(seller, f.pair_id, Side::Sell, dec!(1), dec!(101))
        .await
        .unwrap();
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(99))
        .await
        .unwrap();
    f.lifecycle
        .submit(buyer, f.pair_id, Side::Buy, dec!(1), dec!(100))
        .await
        .unwrap();

    let snapshot = f.lifecycle.book_snapshot(f.pair_id).await.unwrap();
    assert_eq!(snapshot.sells[0].price, dec!(101));
    assert_eq!(snapshot.sells[1].price, dec!(102));
    assert_eq!(snapshot.buys[0].price, dec!(100));
    assert_eq!(snapshot.buys[1].price, dec!(99));
}

use common::decimal::{dec, Amount};
use common::error::Error;
use uuid::Uuid;
use wallet_ledger::LedgerService;

#[tokio::test]
async fn credit_creates_wallet_lazily() {
    let service = LedgerService::new();
    let owner = Uuid::new_v4();

    assert!(service.balance(owner, 1).await.unwrap().is_none());

    let wallet = service.credit(owner, 1, dec!(10)).await.unwrap();
    assert_eq!(wallet.balance, dec!(10));

    let fetched = service.balance(owner, 1).await.unwrap().unwrap();
    assert_eq!(fetched.balance, dec!(10));
}

#[tokio::test]
async fn debit_rejects_overdraft_without_mutation() {
    let service = LedgerService::new();
    let owner = Uuid::new_v4();

    service.credit(owner, 1, dec!(5)).await.unwrap();

    let result = service.debit(owner, 1, dec!(6)).await;
    match result {
        Err(Error::InsufficientFunds(_)) => (),
        other => panic!("expected InsufficientFunds, got {:?}", other),
    }

    // No partial debit happened
    let wallet = service.balance(owner, 1).await.unwrap().unwrap();
    assert_eq!(wallet.balance, dec!(5));
}

#[tokio::test]
async fn debit_missing_wallet_is_insufficient_funds() {
    let service = LedgerService::new();
    let result = service.debit(Uuid::new_v4(), 7, dec!(1)).await;
    assert!(matches!(result, Err(Error::InsufficientFunds(_))));
}

#[tokio::test]
async fn zero_and_negative_amounts_are_rejected() {
    let service = LedgerService::new();
    let owner = Uuid::new_v4();

    assert!(matches!(
        service.credit(owner, 1, Amount::ZERO).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        service.debit(owner, 1, dec!(-2)).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn balances_lists_all_currencies_for_owner() {
    let service = LedgerService::new();
    let owner = Uuid::new_v4();
    let other = Uuid::new_v4();

    service.credit(owner, 1, dec!(1)).await.unwrap();
    service.credit(owner, 2, dec!(2)).await.unwrap();
    service.credit(other, 1, dec!(9)).await.unwrap();

    let mut wallets = service.balances(owner).await.unwrap();
    wallets.sort_by_key(|w| w.currency_id);
    assert_eq!(wallets.len(), 2);
    assert_eq!(wallets[0].balance, dec!(1));
    assert_eq!(wallets[1].balance, dec!(2));
}

#[tokio::test]
async fn mutations_emit_wallet_events() {
    let service = LedgerService::new();
    let owner = Uuid::new_v4();
    let mut events = service.events().subscribe();

    service.deposit(owner, 3, dec!(100)).await.unwrap();
    service.withdraw(owner, 3, dec!(40)).await.unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.owner, owner);
    assert_eq!(first.balance, dec!(100));

    let second = events.recv().await.unwrap();
    assert_eq!(second.balance, dec!(60));
}

#[tokio::test]
async fn concurrent_debits_never_overdraw() {
    let service = std::sync::Arc::new(LedgerService::new());
    let owner = Uuid::new_v4();
    service.credit(owner, 1, dec!(10)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.debit(owner, 1, dec!(1)).await.is_ok()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 10);
    let wallet = service.balance(owner, 1).await.unwrap().unwrap();
    assert_eq!(wallet.balance, Amount::ZERO);
}

mod common;

use anyhow::Result;
use common::{account, days, test_ledger, HOLDING, OWNER};
use subledger::LedgerError;
use subledger::domain::EventKind;

#[tokio::test]
async fn test_first_payment_splits_fee() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;

    t.ledger.create_subscription(&account("alice")).await?;

    assert_eq!(t.balance("alice").await?, 90);
    assert_eq!(t.balance(OWNER).await?, 2);
    assert_eq!(t.balance(HOLDING).await?, 8);
    assert_eq!(t.ledger.holding_balance().await?, 8);

    Ok(())
}

#[tokio::test]
async fn test_renewal_after_due_date() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let created = t.ledger.create_subscription(&account("alice")).await?;

    t.advance(days(31));
    let receipt = t.ledger.process_payment(created.id).await?;

    assert_eq!(receipt.split.platform, 2);
    assert_eq!(receipt.split.retained, 8);
    assert_eq!(receipt.collected_at, t.now());
    assert_eq!(receipt.subscription.next_payment_due, t.now() + days(30));

    assert_eq!(t.balance("alice").await?, 80);
    assert_eq!(t.balance(OWNER).await?, 4);
    assert_eq!(t.balance(HOLDING).await?, 16);

    let stored = t.ledger.get_subscription(created.id).await?;
    assert_eq!(stored.next_payment_due, t.now() + days(30));
    assert_eq!(stored.created_at, created.created_at);
    assert!(stored.active);

    let payments = t
        .ledger
        .list_events(0, Some(EventKind::PaymentProcessed))
        .await?;
    assert_eq!(payments.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_payment_before_due_is_rejected() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let created = t.ledger.create_subscription(&account("alice")).await?;

    t.advance(days(29));
    let result = t.ledger.process_payment(created.id).await;
    match result {
        Err(LedgerError::PaymentNotDue { id, next_due }) => {
            assert_eq!(id, created.id);
            assert_eq!(next_due, created.next_payment_due);
        }
        other => panic!("expected PaymentNotDue, got {other:?}"),
    }

    // Nothing changed
    assert_eq!(t.ledger.get_subscription(created.id).await?, created);
    assert_eq!(t.balance("alice").await?, 90);
    assert_eq!(t.balance(HOLDING).await?, 8);

    Ok(())
}

#[tokio::test]
async fn test_payment_due_at_exact_boundary() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let created = t.ledger.create_subscription(&account("alice")).await?;

    t.clock.set(created.next_payment_due);
    let receipt = t.ledger.process_payment(created.id).await?;

    assert_eq!(
        receipt.subscription.next_payment_due,
        created.next_payment_due + days(30)
    );

    Ok(())
}

#[tokio::test]
async fn test_late_payment_counts_from_collection() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let created = t.ledger.create_subscription(&account("alice")).await?;

    // Ninety days late: a single payment, next due is a period from now
    t.advance(days(120));
    let receipt = t.ledger.process_payment(created.id).await?;
    assert_eq!(receipt.subscription.next_payment_due, t.now() + days(30));

    let again = t.ledger.process_payment(created.id).await;
    assert!(matches!(again, Err(LedgerError::PaymentNotDue { .. })));
    assert_eq!(t.balance("alice").await?, 80);

    Ok(())
}

#[tokio::test]
async fn test_anyone_can_trigger_payment() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    t.fund("bob", 100).await?;
    let alice = t.ledger.create_subscription(&account("alice")).await?;
    t.ledger.create_subscription(&account("bob")).await?;

    t.advance(days(30));
    // Collecting alice's payment only ever debits alice
    t.ledger.process_payment(alice.id).await?;

    assert_eq!(t.balance("alice").await?, 80);
    assert_eq!(t.balance("bob").await?, 90);

    Ok(())
}

#[tokio::test]
async fn test_payment_of_unknown_subscription() -> Result<()> {
    let t = test_ledger().await?;

    let result = t.ledger.process_payment(3).await;
    assert!(matches!(result, Err(LedgerError::SubscriptionNotFound(3))));

    Ok(())
}

#[tokio::test]
async fn test_failed_renewal_keeps_subscription_due() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 15).await?;
    let created = t.ledger.create_subscription(&account("alice")).await?;

    t.advance(days(30));
    let result = t.ledger.process_payment(created.id).await;
    assert!(matches!(result, Err(LedgerError::TransferFailed(_))));

    let stored = t.ledger.get_subscription(created.id).await?;
    assert_eq!(stored.next_payment_due, created.next_payment_due);
    assert!(stored.active);
    assert_eq!(t.balance("alice").await?, 5);
    assert_eq!(t.balance(OWNER).await?, 2);
    assert_eq!(t.balance(HOLDING).await?, 8);

    // Topping up makes the same payment collectable
    t.fund("alice", 10).await?;
    t.ledger.process_payment(created.id).await?;
    assert_eq!(t.balance("alice").await?, 5);

    Ok(())
}

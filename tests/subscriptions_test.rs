mod common;

use anyhow::Result;
use common::{account, days, test_ledger};
use subledger::LedgerError;
use subledger::domain::{EventKind, SubscriptionStatus};

#[tokio::test]
async fn test_create_subscription() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;

    let sub = t.ledger.create_subscription(&account("alice")).await?;

    assert_eq!(sub.id, 1);
    assert_eq!(sub.subscriber, account("alice"));
    assert!(sub.active);
    assert_eq!(sub.created_at, t.now());
    assert_eq!(sub.next_payment_due, t.now() + days(30));

    let stored = t.ledger.get_subscription(1).await?;
    assert_eq!(stored, sub);

    Ok(())
}

#[tokio::test]
async fn test_ids_are_sequential_across_subscribers() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    t.fund("bob", 100).await?;

    let mut ids = Vec::new();
    for who in ["alice", "bob", "alice", "bob", "alice"] {
        ids.push(t.ledger.create_subscription(&account(who)).await?.id);
    }

    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let stats = t.ledger.stats().await?;
    assert_eq!(stats.counters.subscription_count, 5);
    assert_eq!(stats.counters.subscriber_count, 5);
    assert_eq!(stats.active_subscriptions, 5);

    Ok(())
}

#[tokio::test]
async fn test_insufficient_balance_leaves_no_trace() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 5).await?;

    let result = t.ledger.create_subscription(&account("alice")).await;
    assert!(matches!(result, Err(LedgerError::TransferFailed(_))));

    // Nothing was recorded
    assert!(!t.ledger.get_subscription(1).await?.exists());
    assert!(t.ledger.get_subscriber_subscriptions(&account("alice")).await?.is_empty());
    assert!(t.ledger.list_events(0, None).await?.is_empty());
    let stats = t.ledger.stats().await?;
    assert_eq!(stats.counters.subscription_count, 0);
    assert_eq!(stats.counters.subscriber_count, 0);

    // No funds moved
    assert_eq!(t.balance("alice").await?, 5);
    assert_eq!(t.balance(common::HOLDING).await?, 0);
    assert_eq!(t.balance(common::OWNER).await?, 0);

    // The id was not burned
    t.fund("alice", 100).await?;
    let sub = t.ledger.create_subscription(&account("alice")).await?;
    assert_eq!(sub.id, 1);

    Ok(())
}

#[tokio::test]
async fn test_missing_allowance_fails_creation() -> Result<()> {
    let t = test_ledger().await?;
    t.token().mint(&account("alice"), 100).await?;

    let result = t.ledger.create_subscription(&account("alice")).await;
    assert!(matches!(result, Err(LedgerError::TransferFailed(_))));
    assert_eq!(t.balance("alice").await?, 100);
    assert!(!t.ledger.get_subscription(1).await?.exists());

    Ok(())
}

#[tokio::test]
async fn test_unset_caller_cannot_subscribe() -> Result<()> {
    let t = test_ledger().await?;

    let result = t.ledger.create_subscription(&account("")).await;
    assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));

    Ok(())
}

#[tokio::test]
async fn test_get_unknown_subscription_returns_default() -> Result<()> {
    let t = test_ledger().await?;

    let sub = t.ledger.get_subscription(42).await?;
    assert!(!sub.exists());
    assert!(sub.subscriber.is_unset());
    assert!(!sub.active);
    assert_eq!(sub.id, 0);

    assert!(t.ledger.find_subscription(42).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_subscriber_index_keeps_cancelled_in_creation_order() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    t.fund("bob", 100).await?;

    t.ledger.create_subscription(&account("alice")).await?; // 1
    t.ledger.create_subscription(&account("bob")).await?; // 2
    t.ledger.create_subscription(&account("alice")).await?; // 3
    t.ledger
        .cancel_subscription(1, &account("alice"))
        .await?;

    let alice = t.ledger.get_subscriber_subscriptions(&account("alice")).await?;
    assert_eq!(alice, vec![1, 3]);

    let bob = t.ledger.get_subscriber_subscriptions(&account("bob")).await?;
    assert_eq!(bob, vec![2]);

    let nobody = t.ledger.get_subscriber_subscriptions(&account("carol")).await?;
    assert!(nobody.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_cancel_by_subscriber() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let sub = t.ledger.create_subscription(&account("alice")).await?;

    let cancelled = t
        .ledger
        .cancel_subscription(sub.id, &account("alice"))
        .await?;

    assert!(!cancelled.active);
    assert_eq!(cancelled.status(), SubscriptionStatus::Cancelled);

    let stored = t.ledger.get_subscription(sub.id).await?;
    assert!(!stored.active);
    // Identity and timing are untouched
    assert_eq!(stored.subscriber, sub.subscriber);
    assert_eq!(stored.created_at, sub.created_at);
    assert_eq!(stored.next_payment_due, sub.next_payment_due);

    // No funds moved on cancellation
    assert_eq!(t.balance("alice").await?, 90);

    Ok(())
}

#[tokio::test]
async fn test_cancel_by_stranger_is_unauthorized() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let sub = t.ledger.create_subscription(&account("alice")).await?;

    let result = t
        .ledger
        .cancel_subscription(sub.id, &account("mallory"))
        .await;
    assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));

    // The owner of the ledger has no say either
    let result = t
        .ledger
        .cancel_subscription(sub.id, &common::owner())
        .await;
    assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));

    assert!(t.ledger.get_subscription(sub.id).await?.active);

    Ok(())
}

#[tokio::test]
async fn test_cancel_unknown_subscription() -> Result<()> {
    let t = test_ledger().await?;

    let result = t.ledger.cancel_subscription(7, &account("alice")).await;
    assert!(matches!(result, Err(LedgerError::SubscriptionNotFound(7))));

    Ok(())
}

#[tokio::test]
async fn test_cancelled_subscription_cannot_be_paid() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let sub = t.ledger.create_subscription(&account("alice")).await?;
    t.ledger
        .cancel_subscription(sub.id, &account("alice"))
        .await?;

    for elapsed in [1, 30, 365] {
        t.advance(days(elapsed));
        let result = t.ledger.process_payment(sub.id).await;
        assert!(matches!(result, Err(LedgerError::SubscriptionNotActive(1))));
    }
    assert_eq!(t.balance("alice").await?, 90);

    Ok(())
}

#[tokio::test]
async fn test_cancelling_twice_announces_again() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    let sub = t.ledger.create_subscription(&account("alice")).await?;

    t.ledger
        .cancel_subscription(sub.id, &account("alice"))
        .await?;
    let again = t
        .ledger
        .cancel_subscription(sub.id, &account("alice"))
        .await?;
    assert!(!again.active);

    let cancellations = t
        .ledger
        .list_events(0, Some(EventKind::SubscriptionCancelled))
        .await?;
    assert_eq!(cancellations.len(), 2);
    assert!(cancellations.iter().all(|e| e.subscription_id == sub.id));

    Ok(())
}

#[tokio::test]
async fn test_creation_events() -> Result<()> {
    let t = test_ledger().await?;
    t.fund("alice", 100).await?;
    t.ledger.create_subscription(&account("alice")).await?;

    let events = t.ledger.list_events(0, None).await?;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::PaymentProcessed, EventKind::SubscriptionCreated]
    );
    assert!(events.iter().all(|e| e.subscription_id == 1));
    assert!(events.iter().all(|e| e.subscriber == account("alice")));
    assert!(events[0].sequence < events[1].sequence);

    // Cursor skips what was already seen
    let later = t.ledger.list_events(events[1].sequence, None).await?;
    assert!(later.is_empty());

    Ok(())
}

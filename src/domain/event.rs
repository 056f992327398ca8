use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Subscription, SubscriptionId};

/// Kind of notification emitted by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SubscriptionCreated,
    PaymentProcessed,
    SubscriptionCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated => "SubscriptionCreated",
            EventKind::PaymentProcessed => "PaymentProcessed",
            EventKind::SubscriptionCancelled => "SubscriptionCancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SubscriptionCreated" => Some(EventKind::SubscriptionCreated),
            "PaymentProcessed" => Some(EventKind::PaymentProcessed),
            "SubscriptionCancelled" => Some(EventKind::SubscriptionCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification persisted alongside the state change it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Position in the event log; assigned by the repository (0 until persisted)
    pub sequence: i64,
    pub kind: EventKind,
    pub subscription_id: SubscriptionId,
    pub subscriber: AccountId,
    pub emitted_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(kind: EventKind, subscription: &Subscription, emitted_at: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            kind,
            subscription_id: subscription.id,
            subscriber: subscription.subscriber.clone(),
            emitted_at,
        }
    }

    pub fn created(subscription: &Subscription, at: DateTime<Utc>) -> Self {
        Self::new(EventKind::SubscriptionCreated, subscription, at)
    }

    pub fn payment_processed(subscription: &Subscription, at: DateTime<Utc>) -> Self {
        Self::new(EventKind::PaymentProcessed, subscription, at)
    }

    pub fn cancelled(subscription: &Subscription, at: DateTime<Utc>) -> Self {
        Self::new(EventKind::SubscriptionCancelled, subscription, at)
    }
}

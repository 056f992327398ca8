use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Units};

pub type SubscriptionId = i64;

/// Fixed price collected per billing period.
pub const SUBSCRIPTION_PRICE: Units = 10;

/// Length of one billing period in days.
pub const BILLING_PERIOD_DAYS: i64 = 30;

/// Share of each payment routed to the owner, in basis points (20%).
pub const PLATFORM_FEE_BPS: Units = 2000;

pub fn billing_period() -> Duration {
    Duration::days(BILLING_PERIOD_DAYS)
}

/// Lifecycle status of a subscription, derived from its `active` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A billing record tying one subscriber to the fixed-price, fixed-period plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Paying account, never changes after creation
    pub subscriber: AccountId,
    pub created_at: DateTime<Utc>,
    /// Earliest time at which the next payment may be collected
    pub next_payment_due: DateTime<Utc>,
    pub active: bool,
}

impl Default for Subscription {
    /// The record returned for ids that were never assigned.
    fn default() -> Self {
        Self {
            id: 0,
            subscriber: AccountId::unset(),
            created_at: DateTime::UNIX_EPOCH,
            next_payment_due: DateTime::UNIX_EPOCH,
            active: false,
        }
    }
}

impl Subscription {
    /// Create a new active subscription. The first period is considered paid,
    /// so the next payment falls one period from `now`.
    pub fn new(id: SubscriptionId, subscriber: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            subscriber,
            created_at: now,
            next_payment_due: now + billing_period(),
            active: true,
        }
    }

    /// False for the default record of an unassigned id.
    pub fn exists(&self) -> bool {
        !self.subscriber.is_unset()
    }

    pub fn status(&self) -> SubscriptionStatus {
        if self.active {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Cancelled
        }
    }

    pub fn is_owned_by(&self, account: &AccountId) -> bool {
        self.exists() && &self.subscriber == account
    }

    /// Check if a payment can be collected at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && now >= self.next_payment_due
    }

    /// Due date after a payment collected at `now`. Counted from the payment
    /// time, so a late payment never leaves a backlog of owed periods.
    pub fn due_after_payment(now: DateTime<Utc>) -> DateTime<Utc> {
        now + billing_period()
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::domain::{
    build_integrity_report, split_fee, AccountId, EventKind, FeeSplit, IntegrityReport,
    LedgerContents, LedgerCounters, LedgerEvent, Subscription, SubscriptionId, Units,
    PLATFORM_FEE_BPS, SUBSCRIPTION_PRICE,
};
use crate::storage::Repository;
use crate::token::{SqliteToken, ValueTransferService};

use super::guard::CallGate;
use super::{Clock, LedgerConfig, LedgerError};

/// The subscription ledger: creates, bills, cancels and reports on
/// subscriptions, and lets the owner sweep accumulated funds.
///
/// Every public operation runs under the instance's call gate, so calls are
/// serialized and nested calls from inside the token are rejected.
///
/// State changes are all-or-nothing. A creation is checked, paid for, and
/// only then committed to storage in one transaction. A renewal first claims
/// its payment cycle in storage, so no other writer on the same database can
/// collect it too, then moves the funds, and releases the claim if they could
/// not be moved. Failed collections are reversed in full, allowance included.
pub struct SubscriptionLedger<T = SqliteToken> {
    repo: Repository,
    token: T,
    owner: AccountId,
    clock: Arc<dyn Clock>,
    gate: CallGate,
}

/// Counters and a live count of active subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub counters: LedgerCounters,
    pub active_subscriptions: i64,
}

/// Result of a successful payment collection.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub subscription: Subscription,
    pub split: FeeSplit,
    pub collected_at: DateTime<Utc>,
}

impl SubscriptionLedger<SqliteToken> {
    /// Initialize a new database (or migrate an existing one) and open a ledger on it.
    pub async fn init(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::init(&config.database_url(true)).await?;
        Ok(Self::open(repo, config))
    }

    /// Connect to an existing database.
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::connect(&config.database_url(false)).await?;
        Ok(Self::open(repo, config))
    }

    fn open(repo: Repository, config: &LedgerConfig) -> Self {
        let token = SqliteToken::for_repository(&repo, config.holding_account.clone());
        Self::new(repo, token, config.owner.clone(), config.clock())
    }
}

impl<T: ValueTransferService> SubscriptionLedger<T> {
    pub fn new(repo: Repository, token: T, owner: AccountId, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            token,
            owner,
            clock,
            gate: CallGate::default(),
        }
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    pub fn owner(&self) -> &AccountId {
        &self.owner
    }

    /// The ledger's own token account.
    pub fn holding_account(&self) -> &AccountId {
        self.token.operator()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========================
    // Lifecycle operations
    // ========================

    /// Create a subscription for `caller` and collect its first payment.
    ///
    /// Nothing is persisted unless the payment went through, so a failed
    /// creation leaves no record behind and does not consume an id.
    pub async fn create_subscription(&self, caller: &AccountId) -> Result<Subscription, LedgerError> {
        self.gate
            .run("create_subscription", async {
                if caller.is_unset() {
                    return Err(LedgerError::unauthorized(caller, "create a subscription"));
                }

                let now = self.clock.now();
                let counters = self.repo.counters().await?;
                let planned = Subscription::new(counters.next_subscription_id(), caller.clone(), now);

                self.collect_payment(&planned).await?;
                let events = [
                    LedgerEvent::payment_processed(&planned, now),
                    LedgerEvent::created(&planned, now),
                ];

                let (subscription, events) =
                    match self.repo.commit_creation(&planned, &events).await {
                        Ok(committed) => committed,
                        Err(err) => {
                            error!(
                                subscriber = %caller,
                                error = %err,
                                "failed to record new subscription, refunding subscriber"
                            );
                            self.refund(caller, SUBSCRIPTION_PRICE).await;
                            return Err(err.into());
                        }
                    };
                self.emit(&events);

                Ok(subscription)
            })
            .await
    }

    /// Collect the next payment of a subscription that has come due.
    pub async fn process_payment(&self, id: SubscriptionId) -> Result<PaymentReceipt, LedgerError> {
        self.gate
            .run("process_payment", async {
                let now = self.clock.now();
                let subscription = self.payable_subscription(id, now).await?;

                let mut renewed = subscription.clone();
                renewed.next_payment_due = Subscription::due_after_payment(now);
                let events = [LedgerEvent::payment_processed(&renewed, now)];

                let due = subscription.next_payment_due;
                let Some(events) = self.repo.claim_payment(&renewed, due, &events).await? else {
                    // Another writer got to this cycle first
                    let current = self.repo.get_subscription(id).await?;
                    return Err(match current {
                        Some(current) => payment_refusal(&current, now),
                        None => LedgerError::SubscriptionNotFound(id),
                    });
                };

                let split = match self.collect_payment(&renewed).await {
                    Ok(split) => split,
                    Err(err) => {
                        if let Err(release_err) =
                            self.repo.release_payment(&renewed, due, &events).await
                        {
                            error!(
                                id,
                                error = %release_err,
                                "failed to release payment claim, subscription skips a cycle"
                            );
                        }
                        return Err(err);
                    }
                };
                self.emit(&events);

                Ok(PaymentReceipt {
                    subscription: renewed,
                    split,
                    collected_at: now,
                })
            })
            .await
    }

    async fn payable_subscription(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<Subscription, LedgerError> {
        let subscription = self
            .repo
            .get_subscription(id)
            .await?
            .ok_or(LedgerError::SubscriptionNotFound(id))?;

        if !subscription.is_due(now) {
            return Err(payment_refusal(&subscription, now));
        }
        Ok(subscription)
    }

    /// Cancel a subscription. Only its subscriber may do so.
    ///
    /// Cancelling an already cancelled subscription is accepted and announced
    /// again; it has no other effect.
    pub async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        caller: &AccountId,
    ) -> Result<Subscription, LedgerError> {
        self.gate
            .run("cancel_subscription", async {
                let mut subscription = self
                    .repo
                    .get_subscription(id)
                    .await?
                    .ok_or(LedgerError::SubscriptionNotFound(id))?;

                if !subscription.is_owned_by(caller) {
                    return Err(LedgerError::unauthorized(caller, "cancel this subscription"));
                }

                subscription.active = false;
                let events = [LedgerEvent::cancelled(&subscription, self.clock.now())];
                let events = self.repo.commit_cancellation(id, &events).await?;
                self.emit(&events);

                Ok(subscription)
            })
            .await
    }

    /// Sweep the whole holding balance to the owner. Returns the amount moved.
    pub async fn withdraw_accumulated(&self, caller: &AccountId) -> Result<Units, LedgerError> {
        self.gate
            .run("withdraw_accumulated", async {
                if caller != &self.owner {
                    return Err(LedgerError::unauthorized(caller, "withdraw accumulated funds"));
                }

                let balance = self.token.balance_of(self.holding_account()).await?;
                if balance > 0 {
                    self.token.transfer(&self.owner, balance).await?;
                }

                info!(owner = %self.owner, amount = balance, "withdrew accumulated funds");
                Ok(balance)
            })
            .await
    }

    // ========================
    // Queries
    // ========================

    /// The record for `id`, or the default record when `id` was never assigned.
    pub async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, LedgerError> {
        Ok(self.find_subscription(id).await?.unwrap_or_default())
    }

    pub async fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, LedgerError> {
        self.gate
            .run("get_subscription", async {
                Ok(self.repo.get_subscription(id).await?)
            })
            .await
    }

    /// Every id `subscriber` ever created, cancelled ones included, in creation order.
    pub async fn get_subscriber_subscriptions(
        &self,
        subscriber: &AccountId,
    ) -> Result<Vec<SubscriptionId>, LedgerError> {
        self.gate
            .run("get_subscriber_subscriptions", async {
                Ok(self.repo.subscriber_subscriptions(subscriber).await?)
            })
            .await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, LedgerError> {
        self.gate
            .run("list_subscriptions", async {
                Ok(self.repo.list_subscriptions().await?)
            })
            .await
    }

    /// Events emitted after `after_sequence`, optionally of one kind.
    pub async fn list_events(
        &self,
        after_sequence: i64,
        kind: Option<EventKind>,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.gate
            .run("list_events", async {
                Ok(self.repo.list_events(after_sequence, kind).await?)
            })
            .await
    }

    pub async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.gate
            .run("stats", async {
                Ok(LedgerStats {
                    counters: self.repo.counters().await?,
                    active_subscriptions: self.repo.count_active().await?,
                })
            })
            .await
    }

    pub async fn holding_balance(&self) -> Result<Units, LedgerError> {
        self.gate
            .run("holding_balance", async {
                Ok(self.token.balance_of(self.holding_account()).await?)
            })
            .await
    }

    /// Counters, every record and the whole event log as of one instant.
    pub async fn snapshot(&self) -> Result<LedgerContents, LedgerError> {
        self.gate
            .run("snapshot", async { Ok(self.repo.snapshot().await?) })
            .await
    }

    /// Verify persisted state against the ledger invariants.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        self.gate
            .run("check_integrity", async {
                let records = self.repo.list_subscriptions().await?;
                let index = self.repo.list_index().await?;
                let counters = self.repo.counters().await?;
                let created: Vec<SubscriptionId> = self
                    .repo
                    .list_events(0, Some(EventKind::SubscriptionCreated))
                    .await?
                    .into_iter()
                    .map(|e| e.subscription_id)
                    .collect();

                Ok(build_integrity_report(&records, &index, counters, &created))
            })
            .await
    }

    // ========================
    // Payment collection
    // ========================

    /// Pull the price from the subscriber into the holding account and
    /// forward the platform share to the owner.
    ///
    /// If the platform transfer fails the collection is reversed, balance and
    /// allowance alike, before the error is returned.
    async fn collect_payment(&self, subscription: &Subscription) -> Result<FeeSplit, LedgerError> {
        let split = split_fee(SUBSCRIPTION_PRICE, PLATFORM_FEE_BPS);

        if let Err(err) = self
            .token
            .transfer_from(
                &subscription.subscriber,
                self.holding_account(),
                SUBSCRIPTION_PRICE,
            )
            .await
        {
            warn!(
                id = subscription.id,
                subscriber = %subscription.subscriber,
                error = %err,
                "payment collection failed"
            );
            return Err(err.into());
        }

        if split.platform > 0 {
            if let Err(err) = self.token.transfer(&self.owner, split.platform).await {
                warn!(
                    id = subscription.id,
                    error = %err,
                    "platform fee transfer failed, refunding subscriber"
                );
                self.refund(&subscription.subscriber, SUBSCRIPTION_PRICE).await;
                return Err(err.into());
            }
        }

        Ok(split)
    }

    async fn refund(&self, subscriber: &AccountId, amount: Units) {
        if let Err(err) = self.token.refund_from(subscriber, amount).await {
            error!(
                subscriber = %subscriber,
                amount,
                error = %err,
                "refund failed, ledger and token are out of sync"
            );
        }
    }

    fn emit(&self, events: &[LedgerEvent]) {
        for event in events {
            info!(
                sequence = event.sequence,
                kind = %event.kind,
                id = event.subscription_id,
                subscriber = %event.subscriber,
                "ledger event"
            );
        }
    }
}

/// Why `subscription` cannot be paid at `now`.
fn payment_refusal(subscription: &Subscription, now: DateTime<Utc>) -> LedgerError {
    if !subscription.active {
        LedgerError::SubscriptionNotActive(subscription.id)
    } else if now < subscription.next_payment_due {
        LedgerError::PaymentNotDue {
            id: subscription.id,
            next_due: subscription.next_payment_due,
        }
    } else {
        LedgerError::Database(anyhow::anyhow!(
            "Subscription {} changed while its payment was being claimed",
            subscription.id
        ))
    }
}

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{EventKind, SubscriptionId};
use crate::token::ValueTransferService;

use super::{LedgerError, SubscriptionLedger};

/// Outcome of one keeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Subscriptions discovered from creation events during this pass
    pub added_subscriptions: Vec<SubscriptionId>,
    /// Subscriptions whose due payment was collected during this pass
    pub processed_payments: Vec<SubscriptionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeeperStatus {
    pub known_subscriptions: usize,
    pub last_scanned_sequence: i64,
}

/// Drives due payments.
///
/// The keeper learns about subscriptions by following `SubscriptionCreated`
/// events and, on every pass, calls `process_payment` for each known
/// subscription that is active and due. Failures are logged and left for the
/// next pass; cancelled subscriptions are forgotten.
pub struct Keeper<'a, T> {
    ledger: &'a SubscriptionLedger<T>,
    known: BTreeSet<SubscriptionId>,
    last_scanned_sequence: i64,
}

impl<'a, T: ValueTransferService> Keeper<'a, T> {
    pub fn new(ledger: &'a SubscriptionLedger<T>) -> Self {
        Self::starting_after(ledger, 0)
    }

    /// Keeper that ignores events up to and including `sequence`.
    pub fn starting_after(ledger: &'a SubscriptionLedger<T>, sequence: i64) -> Self {
        Self {
            ledger,
            known: BTreeSet::new(),
            last_scanned_sequence: sequence,
        }
    }

    pub fn status(&self) -> KeeperStatus {
        KeeperStatus {
            known_subscriptions: self.known.len(),
            last_scanned_sequence: self.last_scanned_sequence,
        }
    }

    /// Pick up subscriptions created since the last scan.
    pub async fn discover(&mut self) -> Result<Vec<SubscriptionId>, LedgerError> {
        let events = self
            .ledger
            .list_events(self.last_scanned_sequence, Some(EventKind::SubscriptionCreated))
            .await?;

        let mut added = Vec::new();
        for event in events {
            self.last_scanned_sequence = self.last_scanned_sequence.max(event.sequence);
            if self.known.insert(event.subscription_id) {
                added.push(event.subscription_id);
            }
        }
        Ok(added)
    }

    /// One full pass: discover, then collect every payment that is due now.
    pub async fn scan_and_process(&mut self) -> Result<ScanResult, LedgerError> {
        let added_subscriptions = self.discover().await?;
        let now = self.ledger.now();

        let mut processed_payments = Vec::new();
        let mut cancelled = Vec::new();

        for &id in &self.known {
            let subscription = match self.ledger.get_subscription(id).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(id, error = %err, "failed to read subscription");
                    continue;
                }
            };

            if !subscription.active {
                cancelled.push(id);
                continue;
            }
            if !subscription.is_due(now) {
                continue;
            }

            match self.ledger.process_payment(id).await {
                Ok(receipt) => {
                    debug!(id, next_due = %receipt.subscription.next_payment_due, "collected payment");
                    processed_payments.push(id);
                }
                Err(err) => warn!(id, error = %err, "failed to process due payment"),
            }
        }

        for id in cancelled {
            self.known.remove(&id);
        }

        info!(
            added = added_subscriptions.len(),
            processed = processed_payments.len(),
            known = self.known.len(),
            "keeper scan complete"
        );

        Ok(ScanResult {
            added_subscriptions,
            processed_payments,
        })
    }

    /// Scan every `interval` until `shutdown` resolves. The first scan runs
    /// immediately. Failed passes are logged and retried on the next tick.
    ///
    /// A zero interval disables the schedule: one scan runs and `run` returns.
    pub async fn run<S>(&mut self, interval: Duration, shutdown: S) -> Result<(), LedgerError>
    where
        S: Future<Output = ()>,
    {
        if interval.is_zero() {
            info!("keeper schedule disabled, running a single scan");
            self.scan_and_process().await?;
            return Ok(());
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "keeper started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("keeper stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.scan_and_process().await {
                        warn!(error = %err, "keeper scan failed");
                    }
                }
            }
        }
    }
}

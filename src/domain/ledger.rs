use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{AccountId, LedgerEvent, Subscription, SubscriptionId};

/// The two monotonically increasing counters kept by the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounters {
    /// Number of subscriptions ever created, which is also the last assigned id
    pub subscription_count: i64,
    /// Number of successful creations (not distinct subscribers)
    pub subscriber_count: i64,
}

impl LedgerCounters {
    pub fn next_subscription_id(&self) -> SubscriptionId {
        self.subscription_count + 1
    }
}

/// Everything the ledger has persisted, read at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerContents {
    pub counters: LedgerCounters,
    pub subscriptions: Vec<Subscription>,
    pub events: Vec<LedgerEvent>,
}

/// One row of the subscriber -> ids index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub subscriber: AccountId,
    /// Zero-based position within the subscriber's list
    pub position: i64,
    pub subscription_id: SubscriptionId,
}

/// Result of verifying the persisted ledger against its invariants.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub subscription_count: i64,
    pub active_count: i64,
    pub counters: LedgerCounters,
    pub index_entries: i64,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check ledger invariants over a full dump of persisted state.
///
/// `records` must be ordered by id and `index` by subscriber then position.
pub fn build_integrity_report(
    records: &[Subscription],
    index: &[IndexEntry],
    counters: LedgerCounters,
    created_event_ids: &[SubscriptionId],
) -> IntegrityReport {
    let mut issues = Vec::new();

    for (expected, sub) in (1..).zip(records) {
        if sub.id != expected {
            issues.push(format!(
                "Subscription ids are not dense: expected {}, found {}",
                expected, sub.id
            ));
            break;
        }
    }

    let record_count = records.len() as i64;
    if counters.subscription_count != record_count {
        issues.push(format!(
            "Subscription counter is {} but {} records exist",
            counters.subscription_count, record_count
        ));
    }

    if counters.subscriber_count != index.len() as i64 {
        issues.push(format!(
            "Subscriber counter is {} but the index holds {} entries",
            counters.subscriber_count,
            index.len()
        ));
    }

    let by_id: HashMap<SubscriptionId, &Subscription> =
        records.iter().map(|s| (s.id, s)).collect();
    let mut indexed: HashMap<SubscriptionId, usize> = HashMap::new();
    let mut expected_position: HashMap<&AccountId, i64> = HashMap::new();

    for entry in index {
        let position = expected_position.entry(&entry.subscriber).or_insert(0);
        if entry.position != *position {
            issues.push(format!(
                "Index for {} has a gap at position {}",
                entry.subscriber, position
            ));
        }
        *position = entry.position + 1;

        match by_id.get(&entry.subscription_id) {
            Some(sub) if sub.subscriber == entry.subscriber => {}
            Some(sub) => issues.push(format!(
                "Index lists subscription {} under {} but it belongs to {}",
                entry.subscription_id, entry.subscriber, sub.subscriber
            )),
            None => issues.push(format!(
                "Index for {} references missing subscription {}",
                entry.subscriber, entry.subscription_id
            )),
        }
        *indexed.entry(entry.subscription_id).or_insert(0) += 1;
    }

    for sub in records {
        match indexed.get(&sub.id).copied().unwrap_or(0) {
            1 => {}
            0 => issues.push(format!(
                "Subscription {} is missing from its subscriber's index",
                sub.id
            )),
            n => issues.push(format!(
                "Subscription {} appears {} times in the index",
                sub.id, n
            )),
        }
    }

    let mut seen_events = HashSet::new();
    for id in created_event_ids {
        if !seen_events.insert(*id) {
            issues.push(format!("Subscription {} was announced more than once", id));
        } else if !by_id.contains_key(id) {
            issues.push(format!(
                "Creation event references missing subscription {}",
                id
            ));
        }
    }
    for sub in records {
        if !seen_events.contains(&sub.id) {
            issues.push(format!("Subscription {} has no creation event", sub.id));
        }
    }

    IntegrityReport {
        subscription_count: record_count,
        active_count: records.iter().filter(|s| s.active).count() as i64,
        counters,
        index_entries: index.len() as i64,
        issues,
    }
}

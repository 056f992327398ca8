use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::SubscriptionLedger;
use crate::domain::{LedgerCounters, LedgerEvent, Subscription};
use crate::token::ValueTransferService;

/// Ledger snapshot for full export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub counters: LedgerCounters,
    pub subscriptions: Vec<Subscription>,
    pub events: Vec<LedgerEvent>,
}

/// Exporter for converting ledger data to various formats
pub struct Exporter<'a, T> {
    ledger: &'a SubscriptionLedger<T>,
}

impl<'a, T: ValueTransferService> Exporter<'a, T> {
    pub fn new(ledger: &'a SubscriptionLedger<T>) -> Self {
        Self { ledger }
    }

    /// Export subscriptions to CSV format
    pub async fn export_subscriptions_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let subscriptions = self.ledger.list_subscriptions().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "subscriber",
            "status",
            "created_at",
            "next_payment_due",
        ])?;

        for sub in &subscriptions {
            csv_writer.write_record([
                sub.id.to_string(),
                sub.subscriber.to_string(),
                sub.status().to_string(),
                sub.created_at.to_rfc3339(),
                sub.next_payment_due.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(subscriptions.len())
    }

    /// Export events to CSV format
    pub async fn export_events_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let events = self.ledger.list_events(0, None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["sequence", "kind", "subscription_id", "subscriber", "emitted_at"])?;

        for event in &events {
            csv_writer.write_record([
                event.sequence.to_string(),
                event.kind.to_string(),
                event.subscription_id.to_string(),
                event.subscriber.to_string(),
                event.emitted_at.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(events.len())
    }

    /// Export the full ledger as a JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<LedgerSnapshot> {
        let contents = self.ledger.snapshot().await?;

        let snapshot = LedgerSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: self.ledger.now(),
            counters: contents.counters,
            subscriptions: contents.subscriptions,
            events: contents.events,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};

use crate::domain::{
    AccountId, EventKind, IndexEntry, LedgerContents, LedgerCounters, LedgerEvent, Subscription,
    SubscriptionId,
};

use super::{MIGRATION_001_LEDGER, MIGRATION_002_TOKEN};

const SUBSCRIPTION_COUNTER: &str = "subscription_count";
const SUBSCRIBER_COUNTER: &str = "subscriber_count";

/// Repository for persisting and querying ledger state.
///
/// Reads go straight to the pool. Every state change is written through one
/// of the `commit_*`, `claim_*` or `release_*` methods, each of which applies
/// all of its rows in a single transaction.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_LEDGER)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;

        sqlx::query(MIGRATION_002_TOKEN)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 002")?;

        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// The underlying pool, shared with the reference token.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================
    // Counters
    // ========================

    pub async fn counters(&self) -> Result<LedgerCounters> {
        Self::fetch_counters(&self.pool).await
    }

    async fn fetch_counters<'e>(executor: impl SqliteExecutor<'e>) -> Result<LedgerCounters> {
        let rows = sqlx::query("SELECT name, value FROM counters")
            .fetch_all(executor)
            .await
            .context("Failed to read counters")?;

        let mut counters = LedgerCounters::default();
        for row in rows {
            let name: String = row.get("name");
            let value: i64 = row.get("value");
            match name.as_str() {
                SUBSCRIPTION_COUNTER => counters.subscription_count = value,
                SUBSCRIBER_COUNTER => counters.subscriber_count = value,
                _ => {}
            }
        }
        Ok(counters)
    }

    async fn increment_counter(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE counters
            SET value = value + 1
            WHERE name = ?
            RETURNING value
            "#,
        )
        .bind(name)
        .fetch_one(&mut **tx)
        .await
        .with_context(|| format!("Failed to increment counter {}", name))?;

        Ok(row.get("value"))
    }

    // ========================
    // Subscription queries
    // ========================

    /// Get a subscription by ID.
    pub async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            r#"
            SELECT id, subscriber, created_at, next_payment_due, active
            FROM subscriptions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch subscription")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_subscription(&row)?)),
            None => Ok(None),
        }
    }

    /// List all subscriptions, ordered by id.
    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Self::fetch_subscriptions(&self.pool).await
    }

    async fn fetch_subscriptions<'e>(
        executor: impl SqliteExecutor<'e>,
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscriber, created_at, next_payment_due, active
            FROM subscriptions
            ORDER BY id
            "#,
        )
        .fetch_all(executor)
        .await
        .context("Failed to list subscriptions")?;

        rows.iter().map(Self::row_to_subscription).collect()
    }

    pub async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM subscriptions WHERE active = 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count active subscriptions")?;
        Ok(row.get("count"))
    }

    /// Ids created by `subscriber`, in creation order.
    pub async fn subscriber_subscriptions(
        &self,
        subscriber: &AccountId,
    ) -> Result<Vec<SubscriptionId>> {
        let rows = sqlx::query(
            r#"
            SELECT subscription_id
            FROM subscriber_subscriptions
            WHERE subscriber = ?
            ORDER BY position
            "#,
        )
        .bind(subscriber.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list subscriber subscriptions")?;

        Ok(rows.iter().map(|row| row.get("subscription_id")).collect())
    }

    /// The whole subscriber index, ordered by subscriber then position.
    pub async fn list_index(&self) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT subscriber, position, subscription_id
            FROM subscriber_subscriptions
            ORDER BY subscriber, position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list subscriber index")?;

        Ok(rows
            .iter()
            .map(|row| IndexEntry {
                subscriber: AccountId::new(row.get::<String, _>("subscriber")),
                position: row.get("position"),
                subscription_id: row.get("subscription_id"),
            })
            .collect())
    }

    // ========================
    // Events
    // ========================

    /// Events with a sequence greater than `after`, in emission order.
    pub async fn list_events(
        &self,
        after: i64,
        kind: Option<EventKind>,
    ) -> Result<Vec<LedgerEvent>> {
        Self::fetch_events(&self.pool, after, kind).await
    }

    async fn fetch_events<'e>(
        executor: impl SqliteExecutor<'e>,
        after: i64,
        kind: Option<EventKind>,
    ) -> Result<Vec<LedgerEvent>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r#"
                    SELECT sequence, kind, subscription_id, subscriber, emitted_at
                    FROM ledger_events
                    WHERE sequence > ? AND kind = ?
                    ORDER BY sequence
                    "#,
                )
                .bind(after)
                .bind(kind.as_str())
                .fetch_all(executor)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT sequence, kind, subscription_id, subscriber, emitted_at
                    FROM ledger_events
                    WHERE sequence > ?
                    ORDER BY sequence
                    "#,
                )
                .bind(after)
                .fetch_all(executor)
                .await
            }
        }
        .context("Failed to list events")?;

        rows.iter().map(Self::row_to_event).collect()
    }

    /// Counters, records and the event log read in one transaction, so they
    /// always describe the same state.
    pub async fn snapshot(&self) -> Result<LedgerContents> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let counters = Self::fetch_counters(&mut *tx).await?;
        let subscriptions = Self::fetch_subscriptions(&mut *tx).await?;
        let events = Self::fetch_events(&mut *tx, 0, None).await?;

        tx.commit().await.context("Failed to finish snapshot")?;
        Ok(LedgerContents {
            counters,
            subscriptions,
            events,
        })
    }

    async fn insert_events(
        tx: &mut Transaction<'_, Sqlite>,
        events: &[LedgerEvent],
    ) -> Result<Vec<LedgerEvent>> {
        let mut persisted = Vec::with_capacity(events.len());
        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO ledger_events (kind, subscription_id, subscriber, emitted_at)
                VALUES (?, ?, ?, ?)
                RETURNING sequence
                "#,
            )
            .bind(event.kind.as_str())
            .bind(event.subscription_id)
            .bind(event.subscriber.as_str())
            .bind(event.emitted_at.to_rfc3339())
            .fetch_one(&mut **tx)
            .await
            .context("Failed to record event")?;

            let mut event = event.clone();
            event.sequence = row.get("sequence");
            persisted.push(event);
        }
        Ok(persisted)
    }

    // ========================
    // State changes
    // ========================

    /// Persist a newly created subscription: record, index entry, both
    /// counters and its events.
    ///
    /// The id is taken from the subscription counter inside the transaction,
    /// so concurrent writers can never collide and a creation that is never
    /// committed never consumes an id. Returns the subscription and events as
    /// stored.
    pub async fn commit_creation(
        &self,
        subscription: &Subscription,
        events: &[LedgerEvent],
    ) -> Result<(Subscription, Vec<LedgerEvent>)> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut subscription = subscription.clone();
        subscription.id = Self::increment_counter(&mut tx, SUBSCRIPTION_COUNTER).await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, subscriber, created_at, next_payment_due, active)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.subscriber.as_str())
        .bind(subscription.created_at.to_rfc3339())
        .bind(subscription.next_payment_due.to_rfc3339())
        .bind(subscription.active)
        .execute(&mut *tx)
        .await
        .context("Failed to save subscription")?;

        sqlx::query(
            r#"
            INSERT INTO subscriber_subscriptions (subscriber, position, subscription_id)
            SELECT ?, COUNT(*), ?
            FROM subscriber_subscriptions
            WHERE subscriber = ?
            "#,
        )
        .bind(subscription.subscriber.as_str())
        .bind(subscription.id)
        .bind(subscription.subscriber.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to index subscription")?;

        Self::increment_counter(&mut tx, SUBSCRIBER_COUNTER).await?;

        let events: Vec<LedgerEvent> = events
            .iter()
            .map(|event| LedgerEvent {
                subscription_id: subscription.id,
                ..event.clone()
            })
            .collect();
        let events = Self::insert_events(&mut tx, &events).await?;

        tx.commit().await.context("Failed to commit subscription")?;
        Ok((subscription, events))
    }

    /// Claim the payment cycle that is due at `due`: move the due date to
    /// `renewed.next_payment_due` and record the payment events.
    ///
    /// Only one writer can claim a given cycle. Returns `None` when the
    /// subscription is no longer active or its due date is no longer `due`.
    pub async fn claim_payment(
        &self,
        renewed: &Subscription,
        due: DateTime<Utc>,
        events: &[LedgerEvent],
    ) -> Result<Option<Vec<LedgerEvent>>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET next_payment_due = ?
            WHERE id = ? AND active = 1 AND next_payment_due = ?
            "#,
        )
        .bind(renewed.next_payment_due.to_rfc3339())
        .bind(renewed.id)
        .bind(due.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to claim payment cycle")?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back payment claim")?;
            return Ok(None);
        }

        let events = Self::insert_events(&mut tx, events).await?;

        tx.commit().await.context("Failed to commit payment claim")?;
        Ok(Some(events))
    }

    /// Undo a claim whose payment could not be collected: put the due date
    /// back to `due` and drop the claim's events.
    pub async fn release_payment(
        &self,
        renewed: &Subscription,
        due: DateTime<Utc>,
        events: &[LedgerEvent],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET next_payment_due = ?
            WHERE id = ? AND next_payment_due = ?
            "#,
        )
        .bind(due.to_rfc3339())
        .bind(renewed.id)
        .bind(renewed.next_payment_due.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to release payment claim")?;

        for event in events {
            sqlx::query("DELETE FROM ledger_events WHERE sequence = ?")
                .bind(event.sequence)
                .execute(&mut *tx)
                .await
                .context("Failed to drop claimed event")?;
        }

        tx.commit().await.context("Failed to commit payment release")?;
        Ok(())
    }

    /// Persist a cancellation and its events.
    pub async fn commit_cancellation(
        &self,
        id: SubscriptionId,
        events: &[LedgerEvent],
    ) -> Result<Vec<LedgerEvent>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("UPDATE subscriptions SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to cancel subscription")?;

        let events = Self::insert_events(&mut tx, events).await?;

        tx.commit().await.context("Failed to commit cancellation")?;
        Ok(events)
    }

    fn row_to_subscription(row: &sqlx::sqlite::SqliteRow) -> Result<Subscription> {
        let created_at_str: String = row.get("created_at");
        let next_payment_due_str: String = row.get("next_payment_due");

        Ok(Subscription {
            id: row.get("id"),
            subscriber: AccountId::new(row.get::<String, _>("subscriber")),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
            next_payment_due: parse_timestamp(&next_payment_due_str)
                .context("Invalid next_payment_due timestamp")?,
            active: row.get::<i32, _>("active") != 0,
        })
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEvent> {
        let kind_str: String = row.get("kind");
        let emitted_at_str: String = row.get("emitted_at");

        Ok(LedgerEvent {
            sequence: row.get("sequence"),
            kind: EventKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid event kind: {}", kind_str))?,
            subscription_id: row.get("subscription_id"),
            subscriber: AccountId::new(row.get::<String, _>("subscriber")),
            emitted_at: parse_timestamp(&emitted_at_str).context("Invalid emitted_at timestamp")?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

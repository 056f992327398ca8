// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use subledger::application::{Clock, ManualClock, SubscriptionLedger};
use subledger::domain::{AccountId, Units};
use subledger::storage::Repository;
use subledger::token::SqliteToken;
use tempfile::TempDir;

pub const OWNER: &str = "owner";
pub const HOLDING: &str = "subledger";

pub fn owner() -> AccountId {
    AccountId::new(OWNER)
}

pub fn holding() -> AccountId {
    AccountId::new(HOLDING)
}

pub fn account(name: &str) -> AccountId {
    AccountId::new(name)
}

/// Helper to parse a date string into DateTime<Utc>
pub fn parse_date(date_str: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}

/// A fresh repository on a temporary database
pub async fn test_repo() -> Result<(Repository, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let url = format!("sqlite:{}?mode=rwc", db_path.to_str().unwrap());
    let repo = Repository::init(&url).await?;
    Ok((repo, temp_dir))
}

/// A ledger on a temporary database
pub struct TestLedger {
    pub ledger: SubscriptionLedger,
    pub clock: Arc<ManualClock>,
    _temp: TempDir,
}

impl TestLedger {
    pub fn token(&self) -> &SqliteToken {
        self.ledger.token()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Mint `amount` to `who` and let the ledger collect all of it
    pub async fn fund(&self, who: &str, amount: Units) -> Result<()> {
        let who = account(who);
        self.token().mint(&who, amount).await?;
        let allowance = self.token().allowance(&who, &holding()).await?;
        self.token()
            .approve(&who, &holding(), allowance + amount)
            .await?;
        Ok(())
    }

    pub async fn balance(&self, who: &str) -> Result<Units> {
        use subledger::token::ValueTransferService;
        Ok(self.token().balance_of(&account(who)).await?)
    }
}

/// Helper to create a test ledger with its clock pinned to 2025-01-01
pub async fn test_ledger() -> Result<TestLedger> {
    let (repo, temp) = test_repo().await?;
    let clock = Arc::new(ManualClock::new(parse_date("2025-01-01")));
    let token = SqliteToken::for_repository(&repo, holding());
    let ledger = SubscriptionLedger::new(repo, token, owner(), clock.clone() as Arc<dyn Clock>);

    Ok(TestLedger {
        ledger,
        clock,
        _temp: temp,
    })
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::AccountId;

use super::{Clock, ManualClock, SystemClock};

pub const DEFAULT_DATABASE: &str = "subledger.db";
pub const DEFAULT_OWNER: &str = "owner";
pub const DEFAULT_HOLDING_ACCOUNT: &str = "subledger";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Deployment-time settings for a ledger instance.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// SQLite database file
    pub database: String,
    /// Administrator, and recipient of the platform share
    pub owner: AccountId,
    /// The ledger's own token account
    pub holding_account: AccountId,
    /// Pin the clock to a fixed instant instead of wall-clock time
    pub at: Option<DateTime<Utc>>,
    /// How often the keeper scans for due payments
    pub poll_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE)
    }
}

impl LedgerConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            owner: AccountId::new(DEFAULT_OWNER),
            holding_account: AccountId::new(DEFAULT_HOLDING_ACCOUNT),
            at: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<AccountId>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_holding_account(mut self, account: impl Into<AccountId>) -> Self {
        self.holding_account = account.into();
        self
    }

    pub fn with_fixed_time(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// SQLite URL; `create` allows the file to be created.
    pub fn database_url(&self, create: bool) -> String {
        if create {
            format!("sqlite:{}?mode=rwc", self.database)
        } else {
            format!("sqlite:{}", self.database)
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        match self.at {
            Some(at) => Arc::new(ManualClock::new(at)),
            None => Arc::new(SystemClock),
        }
    }
}

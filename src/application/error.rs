use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{AccountId, SubscriptionId};
use crate::token::TransferError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Subscription is not active: {0}")]
    SubscriptionNotActive(SubscriptionId),

    #[error("Payment for subscription {id} is not due yet (next payment: {next_due})")]
    PaymentNotDue {
        id: SubscriptionId,
        next_due: DateTime<Utc>,
    },

    #[error("{caller} is not authorized to {action}")]
    Unauthorized {
        caller: AccountId,
        action: &'static str,
    },

    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] TransferError),

    #[error("Reentrant call into the ledger rejected")]
    Reentrant,

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl LedgerError {
    pub(crate) fn unauthorized(caller: &AccountId, action: &'static str) -> Self {
        LedgerError::Unauthorized {
            caller: caller.clone(),
            action,
        }
    }
}

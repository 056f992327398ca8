//! The token the ledger collects payments in.
//!
//! The ledger only depends on [`ValueTransferService`]; [`SqliteToken`] is the
//! reference implementation used by the CLI and the test-suite.

mod sqlite;

pub use sqlite::*;

use thiserror::Error;

use crate::domain::{AccountId, Units};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Insufficient balance in {account}: balance {balance}, required {required}")]
    InsufficientBalance {
        account: AccountId,
        balance: Units,
        required: Units,
    },

    #[error(
        "Insufficient allowance from {owner} to {spender}: allowance {allowance}, required {required}"
    )]
    InsufficientAllowance {
        owner: AccountId,
        spender: AccountId,
        allowance: Units,
        required: Units,
    },

    #[error("Invalid transfer amount: {0}")]
    InvalidAmount(Units),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Token backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Moves funds between accounts on behalf of a single operator account.
///
/// The operator is the ledger's holding account: `transfer` debits it and
/// `transfer_from` spends allowances granted to it.
#[allow(async_fn_in_trait)]
pub trait ValueTransferService {
    /// The account this service acts as.
    fn operator(&self) -> &AccountId;

    /// Move `amount` from `from` to `to` using the allowance `from` granted
    /// to the operator.
    async fn transfer_from(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Units,
    ) -> Result<(), TransferError>;

    /// Move `amount` from the operator's own balance to `to`.
    async fn transfer(&self, to: &AccountId, amount: Units) -> Result<(), TransferError>;

    /// Undo a `transfer_from(from, operator, amount)`: move `amount` back from
    /// the operator to `from` and give back the allowance it consumed.
    async fn refund_from(&self, from: &AccountId, amount: Units) -> Result<(), TransferError>;

    async fn balance_of(&self, account: &AccountId) -> Result<Units, TransferError>;
}

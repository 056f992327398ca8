pub mod application;
pub mod cli;
pub mod domain;
pub mod io;
pub mod storage;
pub mod token;

pub use application::{LedgerConfig, LedgerError, SubscriptionLedger};
pub use domain::*;
pub use storage::Repository;

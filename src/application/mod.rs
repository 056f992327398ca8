// Application layer - the subscription ledger service and what drives it

mod clock;
mod config;
pub mod error;
mod guard;
mod keeper;
mod service;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use keeper::*;
pub use service::*;

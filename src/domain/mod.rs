mod account;
mod event;
mod fees;
mod ledger;
mod subscription;

pub use account::*;
pub use event::*;
pub use fees::*;
pub use ledger::*;
pub use subscription::*;

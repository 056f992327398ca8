use std::future::Future;

use tokio::sync::Mutex;
use tracing::warn;

use super::LedgerError;

tokio::task_local! {
    /// Address of the gate whose call is running on this task.
    static ACTIVE_GATE: usize;
}

/// Serializes every call into one ledger instance.
///
/// Callers on other tasks wait for the lock. A call made from inside a
/// running call on the same task (for example a token callback) can never
/// acquire it, so it is rejected with [`LedgerError::Reentrant`] instead of
/// deadlocking or seeing half-applied state.
#[derive(Debug, Default)]
pub(crate) struct CallGate {
    lock: Mutex<()>,
}

impl CallGate {
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) async fn run<F, T>(&self, operation: &'static str, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        let id = self.id();
        if ACTIVE_GATE.try_with(|active| *active == id).unwrap_or(false) {
            warn!(operation, "rejected reentrant ledger call");
            return Err(LedgerError::Reentrant);
        }

        let _held = self.lock.lock().await;
        ACTIVE_GATE.scope(id, call).await
    }
}

use std::sync::Arc;

use crate::{
    base::VaultResult,
    txn::{Outcome, TxnId, TxnManager},
};

/// Completes a transaction exactly once. If the guard goes out of scope before
/// [`CompletionGuard::commit`] or [`CompletionGuard::abort`] was called, the transaction is
/// aborted.
#[must_use = "dropping the guard aborts the transaction"]
#[derive(Debug)]
pub struct CompletionGuard {
    txns: Arc<TxnManager>,
    id: TxnId,
    completed: bool,
}

impl CompletionGuard {
    /// Begins a new transaction guarded by the returned value.
    pub fn begin(txns: Arc<TxnManager>) -> VaultResult<Self> {
        let id = txns.begin()?;
        Ok(Self::new(txns, id))
    }

    /// Guards an already begun transaction.
    pub fn new(txns: Arc<TxnManager>, id: TxnId) -> Self {
        Self {
            txns,
            id,
            completed: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit(mut self) -> VaultResult<()> {
        self.completed = true;
        self.txns.complete(self.id, Outcome::Commit)
    }

    pub fn abort(mut self) -> VaultResult<()> {
        self.completed = true;
        self.txns.complete(self.id, Outcome::Abort)
    }

    /// Marks the transaction as completed by someone else.
    pub(crate) fn disarm(mut self) {
        self.completed = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        match self.txns.complete(self.id, Outcome::Abort) {
            Ok(()) => debug!(id = %self.id, "aborted transaction of dropped guard"),
            Err(e) => warn!(id = %self.id, "failed to abort transaction of dropped guard: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{base::VaultError, txn::TxnState};

    #[test]
    fn test_drop_aborts() {
        let txns = Arc::new(TxnManager::new());
        let id = {
            let guard = CompletionGuard::begin(txns.clone()).unwrap();
            guard.id()
        };
        assert_eq!(txns.state(id), Some(TxnState::Aborted));
        assert_eq!(txns.frontier(), id);
    }

    #[test]
    fn test_explicit_completion() {
        let txns = Arc::new(TxnManager::new());
        let committed = CompletionGuard::begin(txns.clone()).unwrap();
        let committed_id = committed.id();
        committed.commit().unwrap();
        assert_eq!(txns.state(committed_id), Some(TxnState::Committed));

        let aborted = CompletionGuard::begin(txns.clone()).unwrap();
        let aborted_id = aborted.id();
        aborted.abort().unwrap();
        assert_eq!(txns.state(aborted_id), Some(TxnState::Aborted));
    }

    #[test]
    fn test_drop_after_external_completion() {
        crate::tests::setup_tracing();
        let txns = Arc::new(TxnManager::new());
        let guard = CompletionGuard::begin(txns.clone()).unwrap();
        let id = guard.id();
        txns.complete(id, Outcome::Commit).unwrap();

        // Drop only logs, the committed state stays
        drop(guard);
        assert_eq!(txns.state(id), Some(TxnState::Committed));

        let guard = CompletionGuard::new(txns.clone(), id);
        assert!(matches!(guard.commit(), Err(VaultError::AlreadyCompleted(_))));
    }
}

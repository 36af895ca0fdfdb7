use crate::{
    base::VaultResult,
    fio::FioFS,
    index::{TileFormat, TileHeader},
    quadtree::TileAddress,
    txn::{CompletionGuard, Outcome, TxnId},
    vault::TileVault,
};

/// A transaction bound to a scope. Dropping it before [`commit`](Self::commit) aborts it.
#[must_use = "dropping the transaction aborts it"]
#[derive(Debug)]
pub struct WriteTxn<'a, F: FioFS> {
    vault: &'a TileVault<F>,
    guard: CompletionGuard,
}

impl<'a, F: FioFS> WriteTxn<'a, F> {
    pub(super) fn new(vault: &'a TileVault<F>, guard: CompletionGuard) -> Self {
        Self { vault, guard }
    }

    pub fn id(&self) -> TxnId {
        self.guard.id()
    }

    pub async fn write(
        &self,
        address: TileAddress,
        data: &[u8],
        format: TileFormat,
    ) -> VaultResult<TileHeader> {
        self.vault
            .write_tile(self.id(), address, data, format)
            .await
    }

    /// Journals the transaction and makes its tiles visible. If the commit fails before the
    /// transaction was sealed it is aborted. Past that point the vault is poisoned and the
    /// next open decides.
    pub async fn commit(self) -> VaultResult<()> {
        let result = self
            .vault
            .complete_transaction(self.id(), Outcome::Commit)
            .await;
        match self.vault.txn_state(self.id()) {
            // Nothing left to abort
            Some(state) if state.is_terminal() => self.guard.disarm(),
            _ if self.vault.is_poisoned() => self.guard.disarm(),
            _ => drop(self.guard),
        }
        result
    }

    pub fn abort(self) -> VaultResult<()> {
        self.guard.abort()
    }
}

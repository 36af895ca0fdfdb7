//! The tile vault ties the transaction manager, tile index, blob store and journal together.
//!
//! Files below the vault root:
//!
//! - `journal/JOURNAL-{n}`: transaction id limits, commit records and prune watermarks.
//! - `blobs/{id}.blob`: append-only segments holding the tile payloads.
//!
//! A commit is durable once its record is in the journal. The journal lock is held while the
//! visibility of the transaction flips, so the journal order equals the visibility order.
//!
//! If a commit fails or is cancelled after its transaction was sealed, the journal may or may
//! not hold its record. The vault then stops accepting operations and the next [`open`]
//! decides the outcome from the journal.
//!
//! [`open`]: TileVault::open

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use itertools::Itertools;
use tracing::instrument;

use crate::{
    base::{VaultError, VaultResult},
    blob::{BlobStats, BlobStore, ReclaimStats},
    config::VaultConfig,
    fio::FioFS,
    index::{History, IndexStats, PayloadDescriptor, TileFormat, TileHeader, TileIndex},
    journal::{CommitRecord, Journal},
    quadtree::{Materialize, TileAddress, TileRegion, materialize},
    txn::{CompletionGuard, Outcome, TxnId, TxnManager, TxnRange, TxnState, TxnStats},
};

mod txn;

pub use txn::WriteTxn;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VaultStats {
    pub txns: TxnStats,
    pub index: IndexStats,
    pub blobs: BlobStats,
}

/// The outcome of one [`TileVault::collect_garbage`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Aborted transactions whose entries were purged and whose records were retired.
    pub aborted_retired: usize,
    /// Index entries of aborted transactions.
    pub entries_purged: usize,
    /// Committed entries shadowed by a newer version at or below the watermark.
    pub entries_pruned: usize,
    /// The watermark that was journaled, if any.
    pub watermark: Option<TxnId>,
    pub reclaim: ReclaimStats,
}

#[derive(Debug)]
pub struct TileVault<F: FioFS> {
    root: PathBuf,

    txns: Arc<TxnManager>,
    index: TileIndex,
    blobs: BlobStore<F>,
    journal: tokio::sync::Mutex<Journal<F>>,

    /// Shared by reads that resolve a header and fetch its payload, exclusive while garbage
    /// collection releases regions.
    gc_gate: tokio::sync::RwLock<()>,

    /// This is `true`, when [`shutdown`] has been called.
    ///
    /// [`shutdown`]: Self::shutdown
    is_shutdown: AtomicBool,

    /// Set when a sealed commit failed or was cancelled. Its outcome is unknown until the
    /// vault is reopened.
    is_poisoned: AtomicBool,
}

impl<F: FioFS> TileVault<F> {
    /// Opens the vault in `root`, recovering every committed transaction from the journal.
    /// Transactions that were still open when the vault went down are aborted.
    #[instrument(skip_all, level = "info")]
    pub async fn open(fs: F, root: impl Into<PathBuf>, config: VaultConfig) -> VaultResult<Self> {
        let root = root.into();
        info!(?root, "opening tile vault");

        let (mut journal, edits) =
            Journal::open(fs.clone(), root.join("journal"), config.journal.clone()).await?;
        let txns = Arc::new(TxnManager::resume(journal.txn_limit()));
        let index = TileIndex::new(txns.clone(), &config.index);

        let mut restored = 0;
        for edit in edits {
            for commit in edit.commits.into_iter().flatten() {
                let record = txns.restore_committed(commit.id)?;
                for header in commit.headers {
                    if header.txn != commit.id {
                        return Err(VaultError::Corruption(format!(
                            "commit record of transaction {} holds header {header}",
                            commit.id
                        )));
                    }
                    index.restore(header, &record)?;
                }
                restored += 1;
            }
            if let Some(watermark) = edit.prune_watermark {
                index.prune(watermark);
            }
        }

        let blobs = BlobStore::open(fs, root.join("blobs"), config.blob.clone()).await?;
        blobs.restore_live(index.committed_locations())?;
        blobs.sweep_unreferenced().await?;

        if journal.should_rotate() {
            journal.rotate(Self::commit_snapshot(&txns)).await?;
        }

        info!(
            restored,
            next = %txns.next_id(),
            frontier = %txns.frontier(),
            "tile vault opened"
        );
        Ok(Self {
            root,
            txns,
            index,
            blobs,
            journal: tokio::sync::Mutex::new(journal),
            gc_gate: tokio::sync::RwLock::new(()),
            is_shutdown: AtomicBool::new(false),
            is_poisoned: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_running(&self) -> VaultResult<()> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(VaultError::LogicError("the tile vault has been shut down"));
        }
        if self.is_poisoned() {
            return Err(VaultError::LogicError(
                "a commit failed to reach the journal, the tile vault must be reopened",
            ));
        }
        Ok(())
    }

    /// Locks the journal, failing if the vault was shut down while waiting for it.
    async fn lock_journal(&self) -> VaultResult<tokio::sync::MutexGuard<'_, Journal<F>>> {
        let journal = self.journal.lock().await;
        self.check_running()?;
        Ok(journal)
    }

    /// Every committed record, for a journal snapshot. Must be called under the journal lock.
    fn commit_snapshot(txns: &TxnManager) -> Vec<CommitRecord> {
        txns.committed_records()
            .into_iter()
            .map(|record| CommitRecord {
                id: record.id(),
                headers: record.headers(),
            })
            .collect_vec()
    }

    async fn maybe_rotate(&self, journal: &mut Journal<F>) {
        if !journal.should_rotate() {
            return;
        }
        if let Err(e) = journal.rotate(Self::commit_snapshot(&self.txns)).await {
            warn!("failed to rotate journal, retrying after the next edit: {e}");
        }
    }

    /// Begins a new transaction. The caller completes it with
    /// [`complete_transaction`](Self::complete_transaction).
    pub async fn begin_transaction(&self) -> VaultResult<TxnId> {
        let mut journal = self.lock_journal().await?;
        journal.reserve_txn_ids(self.txns.next_id()).await?;
        let id = self.txns.begin()?;
        self.maybe_rotate(&mut journal).await;
        Ok(id)
    }

    /// Begins a new transaction that aborts unless it is committed.
    pub async fn transaction(&self) -> VaultResult<WriteTxn<'_, F>> {
        let id = self.begin_transaction().await?;
        Ok(WriteTxn::new(
            self,
            CompletionGuard::new(self.txns.clone(), id),
        ))
    }

    /// Stores `data` as the version of `address` written by the open transaction `id`.
    #[instrument(skip(self, data), level = "trace", fields(len = data.len()))]
    pub async fn write_tile(
        &self,
        id: TxnId,
        address: TileAddress,
        data: &[u8],
        format: TileFormat,
    ) -> VaultResult<TileHeader> {
        self.check_running()?;
        match self.txns.state(id) {
            Some(TxnState::Open) => {}
            Some(state) => return Err(VaultError::InvalidState { id, state }),
            None => return Err(VaultError::NotFound(format!("transaction {id}"))),
        }

        let location = self.blobs.append(data).await?;
        let payload = PayloadDescriptor { location, format };
        match self.index.record(address, id, payload) {
            Ok(header) => Ok(header),
            Err(e) => {
                if let Err(reclaim_err) = self.blobs.reclaim([location]).await {
                    warn!(%location, "failed to reclaim rejected tile payload: {reclaim_err}");
                }
                Err(e)
            }
        }
    }

    /// Commits or aborts transaction `id`. A commit is journaled before its tiles become
    /// visible. If journaling fails the error is returned, the transaction stays sealed and
    /// the vault rejects every further operation until it is reopened.
    #[instrument(skip(self), level = "debug")]
    pub async fn complete_transaction(&self, id: TxnId, outcome: Outcome) -> VaultResult<()> {
        self.check_running()?;
        if outcome == Outcome::Abort {
            return self.txns.complete(id, outcome);
        }

        let mut journal = self.lock_journal().await?;
        let Some(record) = self.txns.get(id) else {
            return Err(match self.txns.state(id) {
                Some(_) => VaultError::AlreadyCompleted(id),
                None => VaultError::NotFound(format!("transaction {id}")),
            });
        };
        let headers = record.seal()?;
        let commit = CommitGuard {
            poisoned: &self.is_poisoned,
            id,
            armed: true,
        };

        let durable: VaultResult<()> = async {
            self.blobs.sync().await?;
            journal
                .append_commit(CommitRecord { id, headers })
                .await
        }
        .await;
        commit.disarm();
        if let Err(e) = durable {
            error!(%id, "failed to journal commit, refusing further operations: {e}");
            self.is_poisoned.store(true, Ordering::Release);
            return Err(e);
        }

        self.txns.complete(id, Outcome::Commit)?;
        self.maybe_rotate(&mut journal).await;
        Ok(())
    }

    /// The newest id below which every transaction is terminal.
    pub fn query_frontier(&self) -> TxnId {
        self.txns.frontier()
    }

    pub fn txn_state(&self, id: TxnId) -> Option<TxnState> {
        self.txns.state(id)
    }

    /// The newest committed header of `address` within `range`.
    pub fn lookup(&self, address: &TileAddress, range: &TxnRange) -> Option<TileHeader> {
        self.index.lookup(address, range)
    }

    /// Reads the payload a header refers to. Fails with [`VaultError::NotFound`] once garbage
    /// collection released it.
    pub async fn read(&self, header: &TileHeader) -> VaultResult<Bytes> {
        self.blobs.read(&header.payload.location).await
    }

    /// Resolves `address` in `range` and reads its payload. Garbage collection can't release
    /// the payload in between.
    pub async fn read_tile(
        &self,
        address: &TileAddress,
        range: &TxnRange,
    ) -> VaultResult<Option<(TileHeader, Bytes)>> {
        let _gate = self.gc_gate.read().await;
        let Some(header) = self.index.lookup(address, range) else {
            return Ok(None);
        };
        let data = self.blobs.read(&header.payload.location).await?;
        Ok(Some((header, data)))
    }

    pub fn history(&self, address: &TileAddress) -> History {
        self.index.history(address)
    }

    /// Tile addresses at `target_level` and their ancestors that intersect `region`, in
    /// traversal order.
    pub fn materialize(
        &self,
        region: TileRegion,
        range: TxnRange,
        target_level: u8,
    ) -> VaultResult<Materialize> {
        materialize(region, range, target_level)
    }

    /// The newest committed header in `range` of every tile at `target_level` inside `region`.
    pub fn lookup_region(
        &self,
        region: TileRegion,
        range: TxnRange,
        target_level: u8,
    ) -> VaultResult<Vec<TileHeader>> {
        let nodes = materialize(region, range, target_level)?;
        Ok(nodes
            .filter(|address| address.level() == target_level)
            .filter_map(|address| self.index.lookup(&address, &range))
            .collect_vec())
    }

    /// Releases what no reader can observe anymore: entries of aborted transactions and, with
    /// `prune_below` set, committed versions shadowed by a newer version at or below
    /// `min(prune_below, frontier)`. Reads pinned below that watermark lose those versions.
    #[instrument(skip(self), level = "debug")]
    pub async fn collect_garbage(&self, prune_below: Option<TxnId>) -> VaultResult<GcStats> {
        self.check_running()?;
        let _gate = self.gc_gate.write().await;
        let mut stats = GcStats::default();
        let mut released = Vec::new();

        let aborted = self.txns.aborted_records();
        for record in &aborted {
            let purged = self.index.purge(record);
            stats.entries_purged += purged.len();
            released.extend(purged.into_iter().map(|header| header.payload.location));
        }

        if let Some(below) = prune_below {
            let watermark = below.min(self.txns.frontier());
            if watermark > TxnId::ZERO {
                let mut journal = self.lock_journal().await?;
                journal.append_prune(watermark).await?;
                let pruned = self.index.prune(watermark);
                stats.entries_pruned = pruned.len();
                stats.watermark = Some(watermark);
                released.extend(pruned.into_iter().map(|header| header.payload.location));
                self.maybe_rotate(&mut journal).await;
            }
        }

        stats.reclaim = self.blobs.reclaim(released).await?;
        for record in aborted {
            if self.txns.retire(record.id()) {
                stats.aborted_retired += 1;
            }
        }
        info!(
            aborted = stats.aborted_retired,
            purged = stats.entries_purged,
            pruned = stats.entries_pruned,
            segments_removed = stats.reclaim.segments_removed,
            "collected garbage"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> VaultStats {
        VaultStats {
            txns: self.txns.stats(),
            index: self.index.stats(),
            blobs: self.blobs.stats(),
        }
    }

    /// Tightens the journaled id limit and syncs the blob store. Transactions that are still
    /// open are aborted on the next open.
    ///
    /// A poisoned vault writes nothing and fails with [`VaultError::LogicError`], but it is
    /// marked as shut down all the same.
    #[instrument(skip_all, level = "info")]
    pub async fn shutdown(&self) -> VaultResult<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(VaultError::LogicError("the tile vault has been shut down"));
        }
        let mut journal = self.journal.lock().await;
        if self.is_poisoned() {
            warn!("shutting down a poisoned tile vault without touching the journal");
            return Err(VaultError::LogicError(
                "a commit failed to reach the journal, the tile vault must be reopened",
            ));
        }
        let open = self.txns.open_transactions();
        if !open.is_empty() {
            warn!(count = open.len(), "shutting down with open transactions");
        }
        self.blobs.shutdown().await?;
        journal.shutdown(self.txns.next_id()).await?;
        info!("tile vault shut down");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Whether a failed or cancelled commit left the vault unusable until it is reopened.
    pub fn is_poisoned(&self) -> bool {
        self.is_poisoned.load(Ordering::Acquire)
    }
}

impl<F: FioFS> Drop for TileVault<F> {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            error!(root = ?self.root, "tile vault dropped without shutdown");
        }
    }
}

/// Poisons the vault if a commit future is dropped while its record may be partially written.
struct CommitGuard<'a> {
    poisoned: &'a AtomicBool,
    id: TxnId,
    armed: bool,
}

impl CommitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.poisoned.store(true, Ordering::Release);
        error!(id = %self.id, "commit was cancelled, refusing further operations");
    }
}

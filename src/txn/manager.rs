use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use crate::{
    base::{VaultError, VaultResult},
    index::TileHeader,
    quadtree::TileAddress,
    txn::TxnId,
};

/// Lifecycle state of a transaction. Every transaction starts `Open` and makes exactly one
/// transition into a terminal state.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u8)]
pub enum TxnState {
    Open = 0,
    Committed = 1,
    Aborted = 2,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// How a transaction is finished.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort,
}

impl Outcome {
    fn state(self) -> TxnState {
        match self {
            Self::Commit => TxnState::Committed,
            Self::Abort => TxnState::Aborted,
        }
    }
}

#[derive(Debug, Default)]
struct WriteSet {
    headers: Vec<TileHeader>,
    /// Set once a commit has taken its snapshot of `headers`, no further writes are accepted.
    sealed: bool,
}

/// The shared record of one transaction.
///
/// Index entries hold an `Arc` to the record of the transaction that wrote them, so flipping
/// `state` once changes the visibility of every entry the transaction wrote.
#[derive(Debug)]
pub struct TxnRecord {
    id: TxnId,
    state: AtomicU8,
    writes: Mutex<WriteSet>,
}

impl TxnRecord {
    fn new(id: TxnId, state: TxnState) -> Self {
        Self {
            id,
            state: AtomicU8::new(state.into()),
            writes: Mutex::new(WriteSet::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        TxnState::try_from(self.state.load(Ordering::Acquire))
            .expect("transaction record should always hold a valid state")
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.state() == TxnState::Committed
    }

    /// The headers this transaction wrote, in write order.
    pub fn headers(&self) -> Vec<TileHeader> {
        self.writes.lock().headers.clone()
    }

    pub fn addresses(&self) -> Vec<TileAddress> {
        self.writes
            .lock()
            .headers
            .iter()
            .map(|header| header.address)
            .collect()
    }

    /// Runs `insert` and tracks `header` as written by this transaction, provided the
    /// transaction still accepts writes. Completion waits for this to finish, so a write never
    /// races the commit of its own transaction. Writes after [`seal`](Self::seal) fail with
    /// [`VaultError::AlreadyCompleted`].
    pub(crate) fn track_write(
        &self,
        header: TileHeader,
        insert: impl FnOnce() -> VaultResult<()>,
    ) -> VaultResult<()> {
        let mut writes = self.writes.lock();
        match self.state() {
            TxnState::Open if !writes.sealed => {}
            TxnState::Open => return Err(VaultError::AlreadyCompleted(self.id)),
            state => return Err(VaultError::InvalidState { id: self.id, state }),
        }
        insert()?;
        writes.headers.push(header);
        Ok(())
    }

    /// Stops accepting writes and returns the final write set for the commit record.
    pub(crate) fn seal(&self) -> VaultResult<Vec<TileHeader>> {
        let mut writes = self.writes.lock();
        if self.state() != TxnState::Open || writes.sealed {
            return Err(VaultError::AlreadyCompleted(self.id));
        }
        writes.sealed = true;
        Ok(writes.headers.clone())
    }

    /// Performs the single terminal transition. A sealed transaction is being committed and
    /// can't be aborted anymore.
    fn finish(&self, outcome: Outcome) -> VaultResult<()> {
        let writes = self.writes.lock();
        if outcome == Outcome::Abort && writes.sealed {
            return Err(VaultError::AlreadyCompleted(self.id));
        }
        self.state
            .compare_exchange(
                TxnState::Open.into(),
                outcome.state().into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| VaultError::AlreadyCompleted(self.id))
    }

    /// Drops the header written at `address` once the index pruned it.
    pub(crate) fn forget(&self, address: &TileAddress) {
        self.writes
            .lock()
            .headers
            .retain(|header| header.address != *address);
    }

    /// Restores a header from the journal into a committed record.
    pub(crate) fn restore_write(&self, header: TileHeader) {
        self.writes.lock().headers.push(header);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxnStats {
    pub next: u32,
    pub frontier: u32,
    pub open: usize,
    pub committed: usize,
    pub aborted: usize,
}

#[derive(Debug)]
struct TxnTable {
    /// The next id to hand out.
    next: u32,
    open: BTreeSet<TxnId>,
    /// Every record that is not yet retired. Retired ids report `Aborted`.
    records: BTreeMap<TxnId, Arc<TxnRecord>>,
}

/// Allocates transaction ids and drives their lifecycle.
///
/// The frontier is the largest id `F` such that every id `<= F` is terminal. It is published
/// through an atomic, so readers never touch the table lock.
#[derive(Debug)]
pub struct TxnManager {
    table: Mutex<TxnTable>,
    frontier: AtomicU32,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    pub fn new() -> Self {
        Self::resume(TxnId::FIRST)
    }

    /// Creates a manager that hands out ids starting at `next`. Every id below it is terminal.
    pub fn resume(next: TxnId) -> Self {
        let next = next.max(TxnId::FIRST);
        Self {
            table: Mutex::new(TxnTable {
                next: next.get(),
                open: BTreeSet::new(),
                records: BTreeMap::new(),
            }),
            frontier: AtomicU32::new(next.get() - 1),
        }
    }

    /// Allocates the next id in state `Open`.
    pub fn begin(&self) -> VaultResult<TxnId> {
        let mut table = self.table.lock();
        // SAFETY: `next` only grows up to `TxnId::MAX`, checked below before every increment
        let id = unsafe { TxnId::new_unchecked(table.next) };
        if id >= TxnId::MAX {
            return Err(VaultError::CapacityExceeded(id));
        }
        table.next += 1;
        table.open.insert(id);
        table
            .records
            .insert(id, Arc::new(TxnRecord::new(id, TxnState::Open)));
        trace!(%id, "began transaction");
        Ok(id)
    }

    /// Moves `id` into its terminal state. A second completion of the same id fails with
    /// [`VaultError::AlreadyCompleted`], whatever the requested outcome.
    pub fn complete(&self, id: TxnId, outcome: Outcome) -> VaultResult<()> {
        let mut table = self.table.lock();
        let Some(record) = table.records.get(&id).cloned() else {
            return Err(Self::missing(&table, id));
        };
        record.finish(outcome)?;
        table.open.remove(&id);

        let frontier = match table.open.first() {
            Some(oldest) => oldest.get() - 1,
            None => table.next - 1,
        };
        self.frontier.store(frontier, Ordering::Release);
        debug!(%id, %outcome, frontier, "completed transaction");
        Ok(())
    }

    fn missing(table: &TxnTable, id: TxnId) -> VaultError {
        if id > TxnId::ZERO && id.get() < table.next {
            VaultError::AlreadyCompleted(id)
        } else {
            VaultError::NotFound(format!("transaction {id}"))
        }
    }

    /// The largest id such that it and every lower id are terminal.
    #[inline]
    pub fn frontier(&self) -> TxnId {
        let frontier = self.frontier.load(Ordering::Acquire);
        // SAFETY: only ever stored from ids below `next`, which never exceeds `TxnId::MAX`
        unsafe { TxnId::new_unchecked(frontier) }
    }

    /// The id the next [`Self::begin`] would hand out.
    pub fn next_id(&self) -> TxnId {
        let next = self.table.lock().next;
        // SAFETY: `next` never exceeds `TxnId::MAX`
        unsafe { TxnId::new_unchecked(next) }
    }

    /// Returns the state of `id`, or `None` if it was never allocated. Ids without a record
    /// (retired by garbage collection, or open when the vault crashed) are `Aborted`.
    pub fn state(&self, id: TxnId) -> Option<TxnState> {
        let table = self.table.lock();
        match table.records.get(&id) {
            Some(record) => Some(record.state()),
            None if id > TxnId::ZERO && id.get() < table.next => Some(TxnState::Aborted),
            None => None,
        }
    }

    pub fn get(&self, id: TxnId) -> Option<Arc<TxnRecord>> {
        self.table.lock().records.get(&id).cloned()
    }

    /// Registers a committed transaction recovered from the journal.
    pub(crate) fn restore_committed(&self, id: TxnId) -> VaultResult<Arc<TxnRecord>> {
        let mut table = self.table.lock();
        if id == TxnId::ZERO || id.get() >= table.next {
            return Err(VaultError::Corruption(format!(
                "recovered commit {id} lies outside the reserved id range (next {})",
                table.next
            )));
        }
        let record = table
            .records
            .entry(id)
            .or_insert_with(|| Arc::new(TxnRecord::new(id, TxnState::Committed)));
        Ok(record.clone())
    }

    pub fn open_transactions(&self) -> Vec<TxnId> {
        self.table.lock().open.iter().copied().collect()
    }

    pub(crate) fn committed_records(&self) -> Vec<Arc<TxnRecord>> {
        self.records_in(TxnState::Committed)
    }

    pub(crate) fn aborted_records(&self) -> Vec<Arc<TxnRecord>> {
        self.records_in(TxnState::Aborted)
    }

    fn records_in(&self, state: TxnState) -> Vec<Arc<TxnRecord>> {
        self.table
            .lock()
            .records
            .values()
            .filter(|record| record.state() == state)
            .cloned()
            .collect()
    }

    /// Forgets an aborted record once its entries are purged. Returns whether it was removed.
    pub(crate) fn retire(&self, id: TxnId) -> bool {
        let mut table = self.table.lock();
        match table.records.get(&id) {
            Some(record) if record.state() == TxnState::Aborted => {
                table.records.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> TxnStats {
        let table = self.table.lock();
        let mut stats = TxnStats {
            next: table.next,
            frontier: self.frontier.load(Ordering::Acquire),
            open: table.open.len(),
            ..Default::default()
        };
        for record in table.records.values() {
            match record.state() {
                TxnState::Open => {}
                TxnState::Committed => stats.committed += 1,
                TxnState::Aborted => stats.aborted += 1,
            }
        }
        stats
    }
}

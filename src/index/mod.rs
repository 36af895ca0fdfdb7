//! # Tile index
//!
//! Maps every [`TileAddress`] to its history: the headers written for it, ordered by
//! increasing transaction id. Lookups resolve a [`TxnRange`] against the frontier and return
//! the newest committed header within it.
//!
//! The address map is split into shards by the xxh3 hash of the address, so writers to
//! different addresses rarely share a lock. Each history is published through an [`ArcSwap`],
//! readers never block on writers.

use std::{collections::HashMap, ops::Range, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    base::{VaultError, VaultResult},
    blob::LocationRef,
    config::IndexConfig,
    quadtree::TileAddress,
    txn::{TxnId, TxnManager, TxnRange, TxnRecord},
};

mod header;
mod history;

pub use header::*;
pub use history::*;

/// A header together with the record of the transaction that wrote it.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    header: TileHeader,
    txn: Arc<TxnRecord>,
}

impl IndexEntry {
    pub fn header(&self) -> &TileHeader {
        &self.header
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.header.txn
    }

    /// Only entries of committed transactions are ever returned to readers.
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.txn.is_committed()
    }
}

/// The ordered entries of one address. Writers copy the vector and swap it in.
#[derive(Debug, Default)]
pub(crate) struct AddressHistory {
    entries: ArcSwap<Vec<IndexEntry>>,
    write_lock: Mutex<()>,
}

impl AddressHistory {
    pub(crate) fn snapshot(&self) -> Arc<Vec<IndexEntry>> {
        self.entries.load_full()
    }

    fn insert(&self, entry: IndexEntry) -> VaultResult<()> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        let pos = match current.binary_search_by_key(&entry.id(), IndexEntry::id) {
            Ok(_) => {
                return Err(VaultError::DuplicateWrite {
                    address: entry.header.address,
                    id: entry.id(),
                });
            }
            Err(pos) => pos,
        };
        let mut entries = Vec::with_capacity(current.len() + 1);
        entries.extend_from_slice(&current[..pos]);
        entries.push(entry);
        entries.extend_from_slice(&current[pos..]);
        self.entries.store(Arc::new(entries));
        Ok(())
    }

    /// Removes every entry matching `remove`, returning the removed ones.
    fn remove_where(&self, mut remove: impl FnMut(&IndexEntry) -> bool) -> Vec<IndexEntry> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        let (removed, kept): (Vec<IndexEntry>, Vec<IndexEntry>) =
            current.iter().cloned().partition(|entry| remove(entry));
        if !removed.is_empty() {
            self.entries.store(Arc::new(kept));
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

type Shard = RwLock<HashMap<TileAddress, Arc<AddressHistory>>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub addresses: usize,
    pub entries: usize,
    pub visible_entries: usize,
}

/// Multi-version index from tile addresses to tile headers.
#[derive(Debug)]
pub struct TileIndex {
    txns: Arc<TxnManager>,
    shards: Box<[Shard]>,
}

impl TileIndex {
    pub fn new(txns: Arc<TxnManager>, config: &IndexConfig) -> Self {
        let shards = (0..config.shard_count.max(1))
            .map(|_| Shard::default())
            .collect();
        Self { txns, shards }
    }

    fn shard(&self, address: &TileAddress) -> &Shard {
        let mut key = [0u8; 9];
        key[0] = address.level();
        key[1..5].copy_from_slice(&address.col().to_le_bytes());
        key[5..9].copy_from_slice(&address.row().to_le_bytes());
        let idx = xxh3_64(&key) % self.shards.len() as u64;
        &self.shards[idx as usize]
    }

    /// Runs `f` on the history of `address`, creating it if missing. The shard stays read
    /// locked while `f` runs, so empty histories can't be dropped under a writer.
    fn with_history<T>(&self, address: TileAddress, f: impl FnOnce(&AddressHistory) -> T) -> T {
        let shard = self.shard(&address);
        {
            let map = shard.read();
            if let Some(history) = map.get(&address) {
                return f(history);
            }
        }
        let mut map = shard.write();
        let history = map.entry(address).or_default().clone();
        let map = parking_lot::RwLockWriteGuard::downgrade(map);
        let result = f(&history);
        drop(map);
        result
    }

    pub(crate) fn address_history(&self, address: &TileAddress) -> Option<Arc<AddressHistory>> {
        self.shard(address).read().get(address).cloned()
    }

    /// Records that transaction `id` wrote `payload` for `address`.
    ///
    /// Fails with [`VaultError::InvalidState`] if `id` is terminal, and with
    /// [`VaultError::DuplicateWrite`] if `id` already wrote `address`. A transaction whose
    /// commit is underway is still `Open`, but its write set is sealed. Writes into it fail
    /// with [`VaultError::AlreadyCompleted`], as its outcome is no longer up to the writer.
    pub fn record(
        &self,
        address: TileAddress,
        id: TxnId,
        payload: PayloadDescriptor,
    ) -> VaultResult<TileHeader> {
        let Some(record) = self.txns.get(id) else {
            return Err(match self.txns.state(id) {
                Some(state) => VaultError::InvalidState { id, state },
                None => VaultError::NotFound(format!("transaction {id}")),
            });
        };
        let header = TileHeader {
            address,
            txn: id,
            payload,
        };
        record.track_write(header, || {
            self.with_history(address, |history| {
                history.insert(IndexEntry {
                    header,
                    txn: record.clone(),
                })
            })
        })?;
        trace!(%header, "recorded tile");
        Ok(header)
    }

    /// Inserts a committed header recovered from the journal.
    pub(crate) fn restore(&self, header: TileHeader, record: &Arc<TxnRecord>) -> VaultResult<()> {
        self.with_history(header.address, |history| {
            history.insert(IndexEntry {
                header,
                txn: record.clone(),
            })
        })?;
        record.restore_write(header);
        Ok(())
    }

    /// The newest committed header for `address` with an id inside `range`.
    pub fn lookup(&self, address: &TileAddress, range: &TxnRange) -> Option<TileHeader> {
        let ids = range.resolve(self.txns.frontier());
        let history = self.address_history(address)?;
        let entries = history.entries.load();
        newest_visible(&entries, ids).map(|entry| entry.header)
    }

    /// Iterates the committed headers of `address`, oldest first.
    pub fn history(&self, address: &TileAddress) -> History {
        History::new(self.address_history(address), self.txns.next_id())
    }

    /// Removes the entries written by an aborted transaction. Returns the removed headers.
    pub(crate) fn purge(&self, record: &TxnRecord) -> Vec<TileHeader> {
        let id = record.id();
        let mut purged = Vec::new();
        for address in record.addresses() {
            let Some(history) = self.address_history(&address) else {
                continue;
            };
            let removed = history.remove_where(|entry| entry.id() == id);
            purged.extend(removed.into_iter().map(|entry| entry.header));
            self.drop_if_empty(&address);
        }
        purged
    }

    fn drop_if_empty(&self, address: &TileAddress) {
        let mut map = self.shard(address).write();
        if map.get(address).is_some_and(|history| history.is_empty()) {
            map.remove(address);
        }
    }

    /// Drops committed entries that are shadowed by a newer committed entry with an id
    /// `<= watermark`. Reads pinned below the watermark lose those versions, reads at or above
    /// it are unaffected. Returns the dropped headers.
    pub(crate) fn prune(&self, watermark: TxnId) -> Vec<TileHeader> {
        let mut pruned = Vec::new();
        for shard in self.shards.iter() {
            let histories: Vec<_> = shard.read().values().cloned().collect();
            for history in histories {
                let snapshot = history.snapshot();
                let newest_below = snapshot
                    .iter()
                    .rev()
                    .find(|entry| entry.id() <= watermark && entry.is_visible());
                let Some(cutoff) = newest_below.map(IndexEntry::id) else {
                    continue;
                };
                let removed =
                    history.remove_where(|entry| entry.id() < cutoff && entry.is_visible());
                for entry in removed {
                    entry.txn.forget(&entry.header.address);
                    pruned.push(entry.header);
                }
            }
        }
        if !pruned.is_empty() {
            debug!(%watermark, count = pruned.len(), "pruned shadowed tile versions");
        }
        pruned
    }

    /// Locations referenced by committed entries.
    pub(crate) fn committed_locations(&self) -> Vec<LocationRef> {
        let mut locations = Vec::new();
        for shard in self.shards.iter() {
            for history in shard.read().values() {
                let entries = history.entries.load();
                locations.extend(
                    entries
                        .iter()
                        .filter(|entry| entry.is_visible())
                        .map(|entry| entry.header.payload.location),
                );
            }
        }
        locations
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for shard in self.shards.iter() {
            let map = shard.read();
            stats.addresses += map.len();
            for history in map.values() {
                let entries = history.entries.load();
                stats.entries += entries.len();
                stats.visible_entries += entries.iter().filter(|e| e.is_visible()).count();
            }
        }
        stats
    }
}

/// The newest visible entry with an id in `ids`, entries being sorted by id.
fn newest_visible(entries: &[IndexEntry], ids: Range<TxnId>) -> Option<&IndexEntry> {
    let end = entries.partition_point(|entry| entry.id() < ids.end);
    entries[..end]
        .iter()
        .rev()
        .take_while(|entry| entry.id() >= ids.start)
        .find(|entry| entry.is_visible())
}

#[cfg(test)]
mod tests;

use std::{sync::Arc, thread};

use crate::{
    base::VaultError,
    blob::LocationRef,
    config::VaultConfig,
    index::{PayloadDescriptor, TileFormat, TileIndex},
    quadtree::TileAddress,
    txn::{Outcome, TxnId, TxnManager, TxnRange, TxnState},
};

fn setup() -> (Arc<TxnManager>, TileIndex) {
    let txns = Arc::new(TxnManager::new());
    let index = TileIndex::new(txns.clone(), &VaultConfig::for_testing().index);
    (txns, index)
}

fn payload(offset: u64) -> PayloadDescriptor {
    PayloadDescriptor {
        location: LocationRef {
            segment: 1,
            offset,
            len: 8,
        },
        format: TileFormat::Png,
    }
}

fn tile(col: u32, row: u32, level: u8) -> TileAddress {
    TileAddress::new(col, row, level).unwrap()
}

#[test]
fn test_uncommitted_writes_are_invisible() {
    let (txns, index) = setup();
    let a = tile(0, 0, 1);
    let t1 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();

    assert_eq!(index.lookup(&a, &TxnRange::latest()), None);
    assert_eq!(index.lookup(&a, &TxnRange::only(t1)), None);

    txns.complete(t1, Outcome::Commit).unwrap();
    let header = index.lookup(&a, &TxnRange::latest()).unwrap();
    assert_eq!(header.txn, t1);
    assert_eq!(header.payload, payload(0));
}

#[test]
fn test_latest_respects_frontier() {
    let (txns, index) = setup();
    let a = tile(1, 1, 1);
    let t1 = txns.begin().unwrap();
    let t2 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();
    index.record(a, t2, payload(100)).unwrap();

    // t2 commits first, but t1 still holds the frontier back
    txns.complete(t2, Outcome::Commit).unwrap();
    assert_eq!(index.lookup(&a, &TxnRange::latest()), None);
    assert_eq!(index.lookup(&a, &TxnRange::only(t2)).unwrap().txn, t2);

    txns.complete(t1, Outcome::Commit).unwrap();
    assert_eq!(index.lookup(&a, &TxnRange::latest()).unwrap().txn, t2);
    assert_eq!(index.lookup(&a, &TxnRange::only(t1)).unwrap().txn, t1);
    assert_eq!(
        index
            .lookup(&a, &TxnRange::new(TxnId::ZERO, t1).unwrap())
            .unwrap()
            .txn,
        t1
    );
}

#[test]
fn test_aborted_writes_never_surface() {
    let (txns, index) = setup();
    let a = tile(0, 1, 1);
    let t1 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();
    txns.complete(t1, Outcome::Commit).unwrap();

    let t2 = txns.begin().unwrap();
    index.record(a, t2, payload(50)).unwrap();
    txns.complete(t2, Outcome::Abort).unwrap();

    assert_eq!(index.lookup(&a, &TxnRange::latest()).unwrap().txn, t1);
    assert_eq!(index.lookup(&a, &TxnRange::only(t2)), None);
}

#[test]
fn test_record_errors() {
    let (txns, index) = setup();
    let a = tile(0, 0, 0);
    let t1 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();

    let err = index.record(a, t1, payload(1)).unwrap_err();
    assert!(matches!(err, VaultError::DuplicateWrite { id, .. } if id == t1));

    txns.complete(t1, Outcome::Commit).unwrap();
    let err = index.record(tile(0, 0, 1), t1, payload(2)).unwrap_err();
    assert!(matches!(
        err,
        VaultError::InvalidState {
            state: TxnState::Committed,
            ..
        }
    ));

    let unknown = TxnId::new(99).unwrap();
    let err = index.record(a, unknown, payload(3)).unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)));
}

#[test]
fn test_record_into_sealed_transaction() {
    let (txns, index) = setup();
    let a = tile(1, 0, 1);
    let t1 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();
    let record = txns.get(t1).unwrap();
    assert_eq!(record.seal().unwrap().len(), 1);

    let err = index.record(tile(0, 0, 1), t1, payload(1)).unwrap_err();
    assert!(matches!(err, VaultError::AlreadyCompleted(id) if id == t1));
    assert_eq!(txns.state(t1), Some(TxnState::Open));
    assert!(index.history(&tile(0, 0, 1)).next().is_none());

    txns.complete(t1, Outcome::Commit).unwrap();
    assert_eq!(record.headers().len(), 1);
}

#[test]
fn test_history_is_ordered_and_restartable() {
    let (txns, index) = setup();
    let a = tile(2, 3, 2);
    let mut ids = Vec::new();
    for i in 0..4 {
        let id = txns.begin().unwrap();
        index.record(a, id, payload(i * 10)).unwrap();
        let outcome = if i == 2 { Outcome::Abort } else { Outcome::Commit };
        txns.complete(id, outcome).unwrap();
        ids.push(id);
    }

    let mut history = index.history(&a);
    let seen: Vec<_> = history.by_ref().map(|header| header.txn).collect();
    assert_eq!(seen, vec![ids[0], ids[1], ids[3]]);
    assert_eq!(history.next(), None);

    // Transactions allocated after creation are outside of the iteration
    let late = txns.begin().unwrap();
    index.record(a, late, payload(99)).unwrap();
    txns.complete(late, Outcome::Commit).unwrap();

    history.restart();
    assert_eq!(history.count(), 3);
    assert_eq!(index.history(&tile(0, 0, 2)).next(), None);
}

#[test]
fn test_purge_and_prune() {
    let (txns, index) = setup();
    let a = tile(1, 0, 1);
    let b = tile(0, 0, 1);

    let t1 = txns.begin().unwrap();
    index.record(a, t1, payload(0)).unwrap();
    index.record(b, t1, payload(10)).unwrap();
    txns.complete(t1, Outcome::Commit).unwrap();

    let t2 = txns.begin().unwrap();
    index.record(a, t2, payload(20)).unwrap();
    txns.complete(t2, Outcome::Commit).unwrap();

    let t3 = txns.begin().unwrap();
    index.record(a, t3, payload(30)).unwrap();
    txns.complete(t3, Outcome::Abort).unwrap();

    let aborted = txns.get(t3).unwrap();
    let purged = index.purge(&aborted);
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].txn, t3);
    assert_eq!(index.stats().entries, 3);

    // Nothing below t1 shadows anything
    assert!(index.prune(TxnId::ZERO).is_empty());

    let pruned = index.prune(t2);
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].txn, t1);
    assert_eq!(pruned[0].address, a);
    assert_eq!(index.lookup(&a, &TxnRange::only(t1)), None);
    assert_eq!(index.lookup(&b, &TxnRange::only(t1)).unwrap().txn, t1);
    assert_eq!(index.lookup(&a, &TxnRange::latest()).unwrap().txn, t2);

    // The transaction record no longer carries the pruned header
    assert_eq!(txns.get(t1).unwrap().addresses(), vec![b]);

    let stats = index.stats();
    assert_eq!(stats.addresses, 2);
    assert_eq!(stats.entries, 2);
    assert_eq!(index.committed_locations().len(), 2);
}

#[test]
fn test_purge_drops_empty_addresses() {
    let (txns, index) = setup();
    let t1 = txns.begin().unwrap();
    index.record(tile(0, 0, 3), t1, payload(0)).unwrap();
    txns.complete(t1, Outcome::Abort).unwrap();
    assert_eq!(index.stats().addresses, 1);

    index.purge(&txns.get(t1).unwrap());
    assert_eq!(index.stats().addresses, 0);
    assert!(txns.retire(t1));
}

#[test]
fn test_concurrent_writers_and_readers() {
    let (txns, index) = setup();
    let index = Arc::new(index);
    let shared = tile(0, 0, 0);

    let writers: Vec<_> = (0..4u32)
        .map(|w| {
            let (txns, index) = (txns.clone(), index.clone());
            thread::spawn(move || {
                for i in 0..50u32 {
                    let id = txns.begin().unwrap();
                    index.record(shared, id, payload(u64::from(i))).unwrap();
                    index.record(tile(w, i % 8, 3), id, payload(0)).unwrap();
                    txns.complete(id, Outcome::Commit).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let index = index.clone();
        thread::spawn(move || {
            let mut last = TxnId::ZERO;
            for _ in 0..500 {
                if let Some(header) = index.lookup(&shared, &TxnRange::latest()) {
                    // Latest only ever moves forward
                    assert!(header.txn >= last);
                    last = header.txn;
                }
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(index.history(&shared).count(), 200);
    assert_eq!(
        index.lookup(&shared, &TxnRange::latest()).unwrap().txn,
        txns.frontier()
    );
}

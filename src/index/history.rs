use std::sync::Arc;

use crate::{
    index::{AddressHistory, TileHeader},
    txn::TxnId,
};

/// Lazy iterator over the committed headers of one address, in increasing id order.
///
/// Only ids below the allocation cursor at creation are visited, so the iterator ends even
/// while writers keep committing. Every step reads the latest published entries, a transaction
/// committing while the iteration is underway shows up if its id was not passed yet.
#[derive(Debug, Clone)]
pub struct History {
    history: Option<Arc<AddressHistory>>,
    until: TxnId,
    cursor: Option<TxnId>,
}

impl History {
    pub(crate) fn new(history: Option<Arc<AddressHistory>>, until: TxnId) -> Self {
        Self {
            history,
            until,
            cursor: None,
        }
    }

    /// Starts over from the oldest header.
    pub fn restart(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for History {
    type Item = TileHeader;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.history.as_ref()?.snapshot();
        let start = match self.cursor {
            Some(cursor) => entries.partition_point(|entry| entry.id() <= cursor),
            None => 0,
        };
        let entry = entries[start..]
            .iter()
            .take_while(|entry| entry.id() < self.until)
            .find(|entry| entry.is_visible())?;
        self.cursor = Some(entry.id());
        Some(*entry.header())
    }
}

//! # tilevault
//!
//! A versioned, multi-resolution tile store for very large raster mosaics.
//!
//! Producers write tiles under transactions and commit them atomically. Consumers read a
//! consistent snapshot as of some point in the write history, or whatever is newest, and never
//! observe a partially written update.
//!
//! ```text
//! TileVault ── TxnManager   (ids, lifecycle, frontier)
//!           ├─ TileIndex    (address -> ordered headers)
//!           ├─ BlobStore    (append-only payload segments)
//!           └─ Journal      (durable commits, id reservation)
//! ```
//!
//! Tiles are addressed by `(col, row, level)` in a quadtree, see [`quadtree`].

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod blob;
pub mod config;
pub mod fio;
pub mod index;
mod journal;
pub mod quadtree;
pub mod txn;
mod vault;

pub use base::{VaultError, VaultResult};
pub use config::VaultConfig;
pub use index::{TileFormat, TileHeader};
pub use quadtree::{TileAddress, TileRegion};
pub use txn::{Outcome, TxnId, TxnOrLatest, TxnRange};
pub use vault::{GcStats, TileVault, VaultStats, WriteTxn};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static TRACING: Once = Once::new();

    /// Installs a test subscriber once per process. Filter with `RUST_LOG`.
    pub fn setup_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

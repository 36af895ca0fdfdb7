//! # Transactions
//!
//! Transaction identity ([`TxnId`], [`TxnOrLatest`], [`TxnRange`]) and lifecycle
//! ([`TxnManager`], [`CompletionGuard`]).
//!
//! Writers begin a transaction, write tiles under it and then commit or abort it. Readers only
//! ever observe committed transactions, resolving a [`TxnRange`] against the frontier of the
//! [`TxnManager`].

mod guard;
mod id;
mod manager;

pub use guard::*;
pub use id::*;
pub use manager::*;

use crate::{
    quadtree::TileAddress,
    txn::{TxnId, TxnState},
};

#[derive(Debug, Display, Error, From)]
pub enum VaultError {
    // -- Misuse by the caller --
    #[from(skip)]
    #[display("Argument error: {_0}")]
    ArgumentError(#[error(not(source))] String),

    #[from(skip)]
    #[display("Logic error: {_0}")]
    LogicError(#[error(not(source))] &'static str),

    #[from(skip)]
    #[display("Transaction {_0} was already completed")]
    AlreadyCompleted(#[error(not(source))] TxnId),

    #[from(skip)]
    #[display("Transaction {id} is {state}, but writes require an open transaction")]
    InvalidState { id: TxnId, state: TxnState },

    #[from(skip)]
    #[display("Tile {address} already has a header for transaction {id}")]
    DuplicateWrite { address: TileAddress, id: TxnId },

    // -- Operational conditions --
    #[from(skip)]
    #[display("Transaction id space exhausted: {_0} reached the maximum ({}).", TxnId::MAX)]
    CapacityExceeded(#[error(not(source))] TxnId),

    #[from(skip)]
    #[display("Not found: {_0}")]
    NotFound(#[error(not(source))] String),

    #[from(skip)]
    #[display("Corrupted data: {_0}")]
    Corruption(#[error(not(source))] String),

    #[display("I/O error: {}", _0)]
    IoError(std::io::Error),

    #[display("Failed to encode: {}", _0)]
    BincodeError(bincode::Error),
}

pub type VaultResult<T> = Result<T, VaultError>;

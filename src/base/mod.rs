//! This module contains base items that are used across the vault.
//!
//! - [`VaultError`]: The single error type returned by every fallible operation.
//! - Magic numbers for the on-disk files and the crate wide [`bincode`] options.
//! - Formatting helpers for structured logging, like [`ByteSize`] and [`HexU64`].

use bincode::Options as BincodeOptions;

pub mod error;
pub mod utils;

pub use error::*;
pub use utils::*;

/// Magic number for journal files, as a first check for file validation.
/// Stored in the header, at the start of a `JOURNAL-*` file.
pub const JOURNAL_MAGICNUM: &[u8; 8] = b"TVLT_JNL";

/// Magic number for blob segment files, as a first check for file validation.
/// Stored in the header, at the start of a `*.blob` file.
pub const SEGMENT_MAGICNUM: &[u8; 8] = b"TVLT_SEG";

/// The crate wide used [`bincode`] encoding options.
#[doc(hidden)]
pub fn bincode_options() -> impl BincodeOptions {
    bincode::options()
        .with_fixint_encoding() // Important: no variable length ints
        .with_little_endian() // Ensure consistency across platforms
        .allow_trailing_bytes()
}

use std::ops::Range;

use nonmax::NonMaxU32;
use serde::{Deserialize, Serialize};

use crate::base::{VaultError, VaultResult};

/// A transaction id. Ids are handed out in increasing order starting at [`TxnId::FIRST`] and
/// are never reused.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct TxnId(NonMaxU32);

impl TxnId {
    /// Never allocated. A frontier of zero means no transaction has finished yet.
    pub const ZERO: Self = unsafe { Self::new_unchecked(0) };
    /// The first id a fresh vault hands out.
    pub const FIRST: Self = unsafe { Self::new_unchecked(1) };
    /// Exclusive end of the id space, never allocated.
    pub const MAX: Self = unsafe { Self::new_unchecked(i32::MAX as u32) };

    pub fn new(val: u32) -> Option<Self> {
        if val > Self::MAX.get() {
            return None;
        }
        // SAFETY: Just checked that `val` is never greater than i32::MAX
        Some(unsafe { Self::new_unchecked(val) })
    }

    pub(crate) const unsafe fn new_unchecked(val: u32) -> Self {
        // SAFETY: Caller has to ensure that `val <= Self::MAX`
        Self(unsafe { NonMaxU32::new_unchecked(val) })
    }

    /// Returns the value as a u32 primitive type.
    #[inline]
    pub const fn get(&self) -> u32 {
        self.0.get()
    }

    /// The following id, stopping at [`TxnId::MAX`].
    pub fn saturating_next(self) -> Self {
        let next = self.get().saturating_add(1).min(Self::MAX.get());
        // SAFETY: clamped to `Self::MAX` above
        unsafe { Self::new_unchecked(next) }
    }

    /// The preceding id, stopping at [`TxnId::ZERO`].
    pub fn saturating_prev(self) -> Self {
        // SAFETY: decreasing a valid id keeps it below `Self::MAX`
        unsafe { Self::new_unchecked(self.get().saturating_sub(1)) }
    }
}

impl TryFrom<u32> for TxnId {
    type Error = VaultError;

    fn try_from(val: u32) -> VaultResult<Self> {
        Self::new(val).ok_or_else(|| {
            VaultError::ArgumentError(format!(
                "Transaction id greater than max: {val} > {}",
                Self::MAX
            ))
        })
    }
}

impl From<TxnId> for u32 {
    fn from(id: TxnId) -> Self {
        id.get()
    }
}

/// Either a concrete transaction id or the sentinel meaning "newest".
///
/// `Latest` compares greater than every concrete id.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxnOrLatest {
    Id(TxnId),
    #[display("latest")]
    Latest,
}

impl TxnOrLatest {
    /// Builds a value from a raw signed id. Negative values and values above [`TxnId::MAX`]
    /// are read as `Latest` rather than rejected.
    pub fn from_raw(raw: i64) -> Self {
        match u32::try_from(raw).ok().and_then(TxnId::new) {
            Some(id) => Self::Id(id),
            None => Self::Latest,
        }
    }

    /// Converts into a concrete id, failing on `Latest`.
    pub fn promote(self) -> VaultResult<TxnId> {
        match self {
            Self::Id(id) => Ok(id),
            Self::Latest => Err(VaultError::LogicError(
                "Cannot promote the latest sentinel to a transaction id",
            )),
        }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }
}

impl From<TxnId> for TxnOrLatest {
    fn from(id: TxnId) -> Self {
        Self::Id(id)
    }
}

/// An inclusive range `[first, last]` of transactions a read may observe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("[{first}, {last}]")]
pub struct TxnRange {
    first: TxnOrLatest,
    last: TxnOrLatest,
}

impl TxnRange {
    pub fn new(first: impl Into<TxnOrLatest>, last: impl Into<TxnOrLatest>) -> VaultResult<Self> {
        let (first, last) = (first.into(), last.into());
        if first > last {
            return Err(VaultError::ArgumentError(format!(
                "Transaction range must satisfy first <= last, got [{first}, {last}]"
            )));
        }
        Ok(Self { first, last })
    }

    /// The range containing only `id`.
    pub fn only(id: impl Into<TxnOrLatest>) -> Self {
        let id = id.into();
        Self {
            first: id,
            last: id,
        }
    }

    /// Whatever is newest at the time of the read.
    pub fn latest() -> Self {
        Self::only(TxnOrLatest::Latest)
    }

    /// Everything from `first` up to the newest transaction.
    pub fn since(first: TxnId) -> Self {
        Self {
            first: TxnOrLatest::Id(first),
            last: TxnOrLatest::Latest,
        }
    }

    pub fn first(&self) -> TxnOrLatest {
        self.first
    }

    pub fn last(&self) -> TxnOrLatest {
        self.last
    }

    /// A range is repeatable when its result cannot change as new transactions commit.
    pub fn is_repeatable(&self) -> bool {
        !self.last.is_latest()
    }

    /// Resolves the range against the current frontier into a half-open `[lo, hi)` id range.
    pub fn resolve(&self, frontier: TxnId) -> Range<TxnId> {
        let lo = match self.first {
            TxnOrLatest::Id(id) => id,
            TxnOrLatest::Latest => TxnId::ZERO,
        };
        let hi = match self.last {
            TxnOrLatest::Id(id) => id.saturating_next(),
            TxnOrLatest::Latest => frontier.saturating_next(),
        };
        lo..hi.max(lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(val: u32) -> TxnId {
        TxnId::new(val).unwrap()
    }

    #[test]
    fn test_txn_id_bounds() {
        assert_eq!(TxnId::MAX.get(), i32::MAX as u32);
        assert!(TxnId::new(i32::MAX as u32 + 1).is_none());
        let err = TxnId::try_from(u32::MAX - 1).unwrap_err();
        assert!(matches!(err, VaultError::ArgumentError(_)));
        assert_eq!(TxnId::try_from(7).unwrap(), id(7));
        assert_eq!(TxnId::MAX.saturating_next(), TxnId::MAX);
        assert_eq!(TxnId::ZERO.saturating_prev(), TxnId::ZERO);
    }

    #[test]
    fn test_latest_ordering() {
        assert!(TxnOrLatest::Latest > TxnOrLatest::Id(TxnId::MAX));
        assert!(TxnOrLatest::Id(id(3)) < TxnOrLatest::Id(id(4)));
        assert_eq!(TxnOrLatest::Latest, TxnOrLatest::Latest);
    }

    #[test]
    fn test_from_raw_normalizes_to_latest() {
        assert_eq!(TxnOrLatest::from_raw(-1), TxnOrLatest::Latest);
        assert_eq!(TxnOrLatest::from_raw(i64::from(i32::MAX) + 1), TxnOrLatest::Latest);
        assert_eq!(TxnOrLatest::from_raw(12), TxnOrLatest::Id(id(12)));
        assert_eq!(TxnOrLatest::from_raw(0), TxnOrLatest::Id(TxnId::ZERO));
    }

    #[test]
    fn test_promote() {
        assert_eq!(TxnOrLatest::Id(id(5)).promote().unwrap(), id(5));
        let err = TxnOrLatest::Latest.promote().unwrap_err();
        assert!(matches!(err, VaultError::LogicError(_)));
    }

    #[test]
    fn test_range_construction() {
        assert!(TxnRange::new(id(5), id(5)).is_ok());
        assert!(TxnRange::new(id(2), TxnOrLatest::Latest).is_ok());
        let err = TxnRange::new(id(5), id(3)).unwrap_err();
        assert!(matches!(err, VaultError::ArgumentError(_)));
        let err = TxnRange::new(TxnOrLatest::Latest, id(3)).unwrap_err();
        assert!(matches!(err, VaultError::ArgumentError(_)));
    }

    #[test]
    fn test_range_resolution() {
        let frontier = id(10);

        // Concrete bounds ignore the frontier
        assert_eq!(TxnRange::new(id(2), id(4)).unwrap().resolve(frontier), id(2)..id(5));
        assert_eq!(TxnRange::only(id(20)).resolve(frontier), id(20)..id(21));

        // Latest resolves against the frontier
        assert_eq!(TxnRange::latest().resolve(frontier), TxnId::ZERO..id(11));
        assert_eq!(TxnRange::since(id(3)).resolve(frontier), id(3)..id(11));

        // The upper bound never drops below the lower bound
        assert_eq!(TxnRange::since(id(15)).resolve(frontier), id(15)..id(15));

        // Saturates at the end of the id space
        assert_eq!(
            TxnRange::only(TxnId::MAX).resolve(frontier),
            TxnId::MAX..TxnId::MAX
        );
    }

    #[test]
    fn test_repeatable() {
        assert!(TxnRange::only(id(3)).is_repeatable());
        assert!(!TxnRange::latest().is_repeatable());
        assert!(!TxnRange::since(id(1)).is_repeatable());
        assert_eq!(TxnRange::since(id(1)).to_string(), "[1, latest]");
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        use bincode::Options;

        use crate::base::bincode_options;

        let bytes = bincode_options().serialize(&id(42)).unwrap();
        assert_eq!(bytes, 42u32.to_le_bytes());
        assert_eq!(bincode_options().deserialize::<TxnId>(&bytes).unwrap(), id(42));
        let bad = bincode_options().serialize(&u32::MAX).unwrap();
        assert!(bincode_options().deserialize::<TxnId>(&bad).is_err());
    }
}

use std::{io, path::PathBuf};

use crc64::crc64;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64};

use crate::{
    base::{JOURNAL_MAGICNUM, PrettyBytes},
    index::TileHeader,
    txn::TxnId,
};

/// The durable trace of one committed transaction: its id and every header it wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub(crate) id: TxnId,
    pub(crate) headers: Vec<TileHeader>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[debug("JournalEditV1(txn_limit={} commits={} prune_watermark={})",
    txn_limit.map(|v| v.get()).unwrap_or(0),
    commits.as_ref().map(|v| v.len()).unwrap_or(0),
    prune_watermark.map(|v| v.get()).unwrap_or(0),
)]
pub(crate) struct JournalEditV1 {
    /// Every transaction id handed out is below this limit.
    pub(crate) txn_limit: Option<TxnId>,

    /// Transactions that committed, in commit order.
    pub(crate) commits: Option<Vec<CommitRecord>>,

    /// Committed versions shadowed by a newer committed version at or below this id were
    /// dropped from the index.
    pub(crate) prune_watermark: Option<TxnId>,
}

/// A versioned edit of the journal.
// These values are part of the file format and shall never be changed.
#[repr(u16)]
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum JournalEdit {
    #[debug("{:?}", _0)]
    V1(JournalEditV1) = 1,
}

impl JournalEdit {
    pub(super) fn into_latest(self) -> JournalEditV1 {
        match self {
            JournalEdit::V1(edit) => edit,
        }
    }
}

/// Total size of a [`JournalHeader`] after encoding.
pub(super) const JOURNAL_HEADER_SIZE: usize = size_of::<JournalHeader>();

/// The header at the start of every journal file.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(super) struct JournalHeader {
    magic: [u8; 8],
    filenum: U64<LittleEndian>,
    checksum: U64<LittleEndian>,
}

impl JournalHeader {
    pub(super) fn new(filenum: u64) -> Self {
        let mut header = Self {
            magic: *JOURNAL_MAGICNUM,
            filenum: filenum.into(),
            checksum: 0.into(),
        };
        header.checksum = crc64(0, &header.as_bytes()[..16]).into();
        header
    }

    #[inline]
    pub(super) fn filenum(&self) -> u64 {
        self.filenum.get()
    }

    pub(super) fn decode(buf: &[u8; JOURNAL_HEADER_SIZE]) -> io::Result<Self> {
        let header = Self::read_from_bytes(buf).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "journal header has an invalid size")
        })?;
        if &header.magic != JOURNAL_MAGICNUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid magic number: not a journal file. expected {:?} but got {:?}.",
                    PrettyBytes(JOURNAL_MAGICNUM),
                    PrettyBytes(&header.magic)
                ),
            ));
        }
        if crc64(0, &buf[..16]) != header.checksum.get() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "journal header checksum mismatch: potential corruption",
            ));
        }
        Ok(header)
    }
}

pub(super) fn journal_filename(filenum: u64) -> PathBuf {
    PathBuf::from(format!("JOURNAL-{filenum}"))
}

/// Total size of a record prefix in a journal file.
pub(super) const JOURNAL_RECORD_PREFIX_SIZE: usize = size_of::<JournalRecordPrefix>();

/// Frames every edit with its length and checksum.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(super) struct JournalRecordPrefix {
    data_len: U32<LittleEndian>,
    checksum: U64<LittleEndian>,
}

impl JournalRecordPrefix {
    /// Creates a new record prefix for some data, providing a frame with a checksum.
    pub(super) fn new(data: &[u8]) -> Self {
        assert!(
            data.len() <= u32::MAX as usize,
            "journal record size may not exceed 2^32 bytes."
        );
        Self {
            data_len: (data.len() as u32).into(),
            checksum: crc64(0, data).into(),
        }
    }

    #[inline]
    pub(super) fn data_len(&self) -> u32 {
        self.data_len.get()
    }

    #[inline]
    pub(super) fn checksum(&self) -> u64 {
        self.checksum.get()
    }

    /// Calculates the checksum of `data` and compares it with the stored checksum.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` is different from the stored length.
    #[inline]
    pub(super) fn is_valid_record(&self, data: &[u8]) -> bool {
        assert_eq!(data.len(), self.data_len() as usize);
        crc64(0, data) == self.checksum()
    }

    #[inline]
    pub(super) fn decode(buf: &[u8; JOURNAL_RECORD_PREFIX_SIZE]) -> Self {
        Self::read_from_bytes(buf).expect("buffer has exactly the prefix size")
    }
}

use std::{
    io,
    path::{Path, PathBuf},
};

use crc64::crc64;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64};

use crate::base::{PrettyBytes, SEGMENT_MAGICNUM};

/// Reference to one region of a blob segment.
///
/// `offset` points at the region prefix, the payload of `len` bytes follows it.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("{segment}:{offset}+{len}")]
pub struct LocationRef {
    pub segment: u64,
    pub offset: u64,
    pub len: u32,
}

impl LocationRef {
    /// Bytes the region occupies on disk, prefix included.
    #[inline]
    pub fn footprint(&self) -> u64 {
        REGION_PREFIX_SIZE as u64 + u64::from(self.len)
    }
}

/// Total size of a [`SegmentHeader`] after encoding.
pub(super) const SEGMENT_HEADER_SIZE: usize = size_of::<SegmentHeader>();

/// The header at the start of every segment file.
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(super) struct SegmentHeader {
    magic: [u8; 8],
    segment: U64<LittleEndian>,
    checksum: U64<LittleEndian>,
}

impl SegmentHeader {
    pub(super) fn new(segment: u64) -> Self {
        let mut header = Self {
            magic: *SEGMENT_MAGICNUM,
            segment: segment.into(),
            checksum: 0.into(),
        };
        header.checksum = header.compute_checksum().into();
        header
    }

    fn compute_checksum(&self) -> u64 {
        crc64(0, &self.as_bytes()[..16])
    }

    pub(super) fn segment(&self) -> u64 {
        self.segment.get()
    }

    pub(super) fn decode(buf: &[u8; SEGMENT_HEADER_SIZE]) -> io::Result<Self> {
        let header = Self::read_from_bytes(buf).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "segment header has an invalid size")
        })?;
        if &header.magic != SEGMENT_MAGICNUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid magic number: not a blob segment. expected {:?} but got {:?}.",
                    PrettyBytes(SEGMENT_MAGICNUM),
                    PrettyBytes(&header.magic)
                ),
            ));
        }
        if header.compute_checksum() != header.checksum.get() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment header checksum mismatch: potential corruption",
            ));
        }
        Ok(header)
    }
}

/// Total size of a [`RegionPrefix`] after encoding.
pub(super) const REGION_PREFIX_SIZE: usize = size_of::<RegionPrefix>();

/// Frames every region with its length and checksum.
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(super) struct RegionPrefix {
    len: U32<LittleEndian>,
    checksum: U64<LittleEndian>,
}

impl RegionPrefix {
    /// # Panics
    ///
    /// Panics if `data` is larger than `u32::MAX` bytes. Callers check the size upfront.
    pub(super) fn new(data: &[u8]) -> Self {
        let len = u32::try_from(data.len()).expect("region size was checked by the caller");
        Self {
            len: len.into(),
            checksum: crc64(0, data).into(),
        }
    }

    pub(super) fn len(&self) -> u32 {
        self.len.get()
    }

    #[inline]
    pub(super) fn is_valid_region(&self, data: &[u8]) -> bool {
        data.len() == self.len.get() as usize && crc64(0, data) == self.checksum.get()
    }

    pub(super) fn decode(buf: &[u8; REGION_PREFIX_SIZE]) -> Self {
        Self::read_from_bytes(buf).expect("buffer has exactly the prefix size")
    }
}

pub(super) fn segment_filename(segment: u64) -> PathBuf {
    PathBuf::from(format!("{segment:08}.blob"))
}

/// Parses the id out of a path produced by [`segment_filename`].
pub(super) fn parse_segment_filename(path: &Path) -> Option<u64> {
    if path.extension()? != "blob" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

use serde::{Deserialize, Serialize};
use strum::{EnumString, IntoStaticStr};

use crate::{blob::LocationRef, quadtree::TileAddress, txn::TxnId};

/// Codec tag of a stored tile. The vault never looks into the payload, the tag only travels
/// along with it.
// These values are part of the journal format and shall never be changed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum TileFormat {
    Raw = 0,
    Png = 1,
    #[strum(to_string = "jpg", serialize = "jpeg")]
    Jpeg = 2,
    #[strum(to_string = "tif", serialize = "tiff")]
    Tiff = 3,
}

impl TileFormat {
    /// The usual file extension of this format.
    pub fn extension(&self) -> &'static str {
        self.into()
    }
}

/// Where the payload of a tile lives and how it is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub location: LocationRef,
    pub format: TileFormat,
}

/// One version of one tile: written at `address` by transaction `txn`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("{address} (t_id = {txn})")]
pub struct TileHeader {
    pub address: TileAddress,
    pub txn: TxnId,
    pub payload: PayloadDescriptor,
}

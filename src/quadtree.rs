//! # Quadtree addressing
//!
//! Pure tile geometry. Level 0 is a single root tile, and every tile at level `L` splits into
//! four children at level `L + 1`. Nothing in here touches the store.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    base::{VaultError, VaultResult},
    txn::TxnRange,
};

/// The deepest level a tile address may have.
pub const MAX_LEVEL: u8 = 31;

/// Number of tiles per axis at `level`.
#[inline]
fn tiles_per_axis(level: u8) -> u64 {
    1u64 << level
}

/// Position of a tile in the pyramid. At level `L`, `col` and `row` lie in `[0, 2^L)`.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("{col},{row}@{level}")]
#[serde(try_from = "RawTileAddress")]
pub struct TileAddress {
    level: u8,
    col: u32,
    row: u32,
}

/// Unchecked wire form of a [`TileAddress`].
#[derive(Deserialize)]
struct RawTileAddress {
    level: u8,
    col: u32,
    row: u32,
}

impl TryFrom<RawTileAddress> for TileAddress {
    type Error = VaultError;

    fn try_from(raw: RawTileAddress) -> VaultResult<Self> {
        Self::new(raw.col, raw.row, raw.level)
    }
}

impl TileAddress {
    pub const ROOT: Self = Self {
        level: 0,
        col: 0,
        row: 0,
    };

    pub fn new(col: u32, row: u32, level: u8) -> VaultResult<Self> {
        if level > MAX_LEVEL {
            return Err(VaultError::ArgumentError(format!(
                "Tile level {level} exceeds the maximum level {MAX_LEVEL}"
            )));
        }
        let dim = tiles_per_axis(level);
        if u64::from(col) >= dim || u64::from(row) >= dim {
            return Err(VaultError::ArgumentError(format!(
                "Tile {col},{row} is outside of level {level} ({dim}x{dim} tiles)"
            )));
        }
        Ok(Self { level, col, row })
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    #[inline]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[inline]
    pub fn row(&self) -> u32 {
        self.row
    }

    /// The four tiles covering this one at the next level, in the order
    /// `(2c, 2r)`, `(2c+1, 2r)`, `(2c, 2r+1)`, `(2c+1, 2r+1)`.
    /// Returns `None` at [`MAX_LEVEL`].
    pub fn children(&self) -> Option<[Self; 4]> {
        if self.level >= MAX_LEVEL {
            return None;
        }
        let (level, col, row) = (self.level + 1, self.col * 2, self.row * 2);
        Some([
            Self { level, col, row },
            Self {
                level,
                col: col + 1,
                row,
            },
            Self {
                level,
                col,
                row: row + 1,
            },
            Self {
                level,
                col: col + 1,
                row: row + 1,
            },
        ])
    }

    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            return None;
        }
        Some(Self {
            level: self.level - 1,
            col: self.col / 2,
            row: self.row / 2,
        })
    }
}

/// A block of tiles `[cols) x [rows)` at a reference level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileRegion {
    level: u8,
    cols: Range<u32>,
    rows: Range<u32>,
}

impl TileRegion {
    pub fn new(level: u8, cols: Range<u32>, rows: Range<u32>) -> VaultResult<Self> {
        if level > MAX_LEVEL {
            return Err(VaultError::ArgumentError(format!(
                "Region level {level} exceeds the maximum level {MAX_LEVEL}"
            )));
        }
        let dim = tiles_per_axis(level);
        for (axis, range) in [("columns", &cols), ("rows", &rows)] {
            if range.start > range.end || u64::from(range.end) > dim {
                return Err(VaultError::ArgumentError(format!(
                    "Region {axis} {range:?} are invalid at level {level} ({dim} tiles per axis)"
                )));
            }
        }
        Ok(Self { level, cols, rows })
    }

    /// Every tile of `level`.
    pub fn whole(level: u8) -> VaultResult<Self> {
        let dim = u32::try_from(tiles_per_axis(level.min(MAX_LEVEL)))
            .map_err(|_| VaultError::LogicError("tiles per axis must fit into u32"))?;
        Self::new(level, 0..dim, 0..dim)
    }

    /// The footprint of a single tile.
    pub fn from_tile(address: TileAddress) -> Self {
        Self {
            level: address.level,
            cols: address.col..address.col + 1,
            rows: address.row..address.row + 1,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty() || self.rows.is_empty()
    }

    /// Whether the footprint of `address` overlaps the region. Both are compared at the finer
    /// of the two levels.
    pub fn intersects(&self, address: &TileAddress) -> bool {
        if self.is_empty() {
            return false;
        }
        let finer = self.level.max(address.level);
        let scale = |value: u32, level: u8| u64::from(value) << (finer - level);

        let tile_cols = scale(address.col, address.level)..scale(address.col + 1, address.level);
        let tile_rows = scale(address.row, address.level)..scale(address.row + 1, address.level);
        let cols = scale(self.cols.start, self.level)..scale(self.cols.end, self.level);
        let rows = scale(self.rows.start, self.level)..scale(self.rows.end, self.level);

        overlaps(&tile_cols, &cols) && overlaps(&tile_rows, &rows)
    }
}

#[inline]
fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Walks the pyramid top-down from the root to `target_level`, depth first and in child
/// order, yielding every tile whose footprint intersects `region`. Subtrees outside of the
/// region are never visited.
pub fn materialize(
    region: TileRegion,
    range: TxnRange,
    target_level: u8,
) -> VaultResult<Materialize> {
    if target_level > MAX_LEVEL {
        return Err(VaultError::ArgumentError(format!(
            "Target level {target_level} exceeds the maximum level {MAX_LEVEL}"
        )));
    }
    let mut stack = Vec::with_capacity(4 * (target_level as usize + 1));
    if region.intersects(&TileAddress::ROOT) {
        stack.push(TileAddress::ROOT);
    }
    Ok(Materialize {
        region,
        range,
        target_level,
        stack,
    })
}

/// Iterator returned by [`materialize`].
#[derive(Debug, Clone)]
pub struct Materialize {
    region: TileRegion,
    range: TxnRange,
    target_level: u8,
    stack: Vec<TileAddress>,
}

impl Materialize {
    /// The transaction range lookups for the yielded tiles should use.
    pub fn range(&self) -> TxnRange {
        self.range
    }

    pub fn target_level(&self) -> u8 {
        self.target_level
    }
}

impl Iterator for Materialize {
    type Item = TileAddress;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        if node.level < self.target_level {
            if let Some(children) = node.children() {
                // Reversed, so the first child is popped next
                for child in children.into_iter().rev() {
                    if self.region.intersects(&child) {
                        self.stack.push(child);
                    }
                }
            }
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(col: u32, row: u32, level: u8) -> TileAddress {
        TileAddress::new(col, row, level).unwrap()
    }

    #[test]
    fn test_address_bounds() {
        assert!(TileAddress::new(0, 0, 0).is_ok());
        assert!(TileAddress::new(1, 0, 0).is_err());
        assert!(TileAddress::new(3, 3, 2).is_ok());
        assert!(TileAddress::new(4, 0, 2).is_err());
        assert!(TileAddress::new(0, 0, MAX_LEVEL + 1).is_err());
        let deepest = tile(u32::MAX >> 1, 0, MAX_LEVEL);
        assert!(deepest.children().is_none());
        assert_eq!(tile(5, 6, 3).to_string(), "5,6@3");
    }

    #[test]
    fn test_children_and_parent() {
        let node = tile(1, 2, 2);
        let children = node.children().unwrap();
        assert_eq!(
            children,
            [tile(2, 4, 3), tile(3, 4, 3), tile(2, 5, 3), tile(3, 5, 3)]
        );
        for child in children {
            assert_eq!(child.parent(), Some(node));
        }
        assert_eq!(TileAddress::ROOT.parent(), None);
    }

    #[test]
    fn test_region_intersection_across_levels() {
        // The top-left quarter of level 2
        let region = TileRegion::new(2, 0..2, 0..2).unwrap();
        assert!(region.intersects(&TileAddress::ROOT));
        assert!(region.intersects(&tile(0, 0, 1)));
        assert!(!region.intersects(&tile(1, 0, 1)));
        assert!(region.intersects(&tile(3, 3, 3)));
        assert!(!region.intersects(&tile(4, 3, 3)));

        assert!(TileRegion::new(2, 0..5, 0..1).is_err());
        assert!(TileRegion::new(2, 3..1, 0..1).is_err());
        assert!(TileRegion::whole(MAX_LEVEL).is_ok());
        let empty = TileRegion::new(1, 1..1, 0..2).unwrap();
        assert!(empty.is_empty());
        assert!(!empty.intersects(&TileAddress::ROOT));
        assert!(!empty.intersects(&tile(1, 0, 1)));
        assert!(!empty.intersects(&tile(2, 1, 2)));
    }

    #[test]
    fn test_materialize_empty_region() {
        let empty = TileRegion::new(2, 0..4, 3..3).unwrap();
        let tiles: Vec<_> = materialize(empty, TxnRange::latest(), 3)
            .unwrap()
            .collect();
        assert!(tiles.is_empty());
    }

    #[test]
    fn test_deserialize_validates_bounds() {
        use bincode::Options;

        use crate::base::bincode_options;

        let bytes = bincode_options().serialize(&tile(5, 6, 3)).unwrap();
        let decoded: TileAddress = bincode_options().deserialize(&bytes).unwrap();
        assert_eq!(decoded, tile(5, 6, 3));

        // Same layout as an address, but the column lies outside of level 3
        let off_pyramid = bincode_options().serialize(&(3u8, u32::MAX, 0u32)).unwrap();
        assert!(
            bincode_options()
                .deserialize::<TileAddress>(&off_pyramid)
                .is_err()
        );
        let too_deep = bincode_options().serialize(&(40u8, 0u32, 0u32)).unwrap();
        assert!(
            bincode_options()
                .deserialize::<TileAddress>(&too_deep)
                .is_err()
        );
    }

    #[test]
    fn test_materialize_whole_pyramid_order() {
        let tiles: Vec<_> = materialize(TileRegion::whole(0).unwrap(), TxnRange::latest(), 2)
            .unwrap()
            .collect();
        assert_eq!(tiles.len(), 1 + 4 + 16);
        assert_eq!(tiles[0], TileAddress::ROOT);
        assert_eq!(tiles[1], tile(0, 0, 1));
        // Pre-order: the first child's subtree comes before its siblings
        assert_eq!(&tiles[2..6], &[tile(0, 0, 2), tile(1, 0, 2), tile(0, 1, 2), tile(1, 1, 2)]);
        assert_eq!(tiles[6], tile(1, 0, 1));
        assert!(tiles.iter().all(|t| t.level() <= 2));
    }

    #[test]
    fn test_materialize_prunes_outside_region() {
        let region = TileRegion::from_tile(tile(3, 0, 2));
        let tiles: Vec<_> = materialize(region, TxnRange::latest(), 3)
            .unwrap()
            .collect();
        assert_eq!(
            tiles,
            vec![
                TileAddress::ROOT,
                tile(1, 0, 1),
                tile(3, 0, 2),
                tile(6, 0, 3),
                tile(7, 0, 3),
                tile(6, 1, 3),
                tile(7, 1, 3),
            ]
        );
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let region = TileRegion::new(3, 2..5, 1..7).unwrap();
        let first: Vec<_> = materialize(region.clone(), TxnRange::latest(), 4)
            .unwrap()
            .collect();
        let second: Vec<_> = materialize(region.clone(), TxnRange::latest(), 4)
            .unwrap()
            .collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|t| region.intersects(t)));
        assert!(materialize(region, TxnRange::latest(), MAX_LEVEL + 1).is_err());
    }
}

use serde::{Deserialize, Serialize};

/// Samples along one edge of a tile.
pub const TILE_SIZE: usize = 32;
pub const TILE_AREA: usize = TILE_SIZE * TILE_SIZE; // 1024
/// Tiles along one edge of a group.
pub const GROUP_SIDE: usize = 3;
pub const GROUP_SLOTS: usize = GROUP_SIDE * GROUP_SIDE;
/// Pixels along one edge of a group composite.
pub const GROUP_PIXELS: usize = TILE_SIZE * GROUP_SIDE; // 96

/// One 32x32-sample tile, addressed in tile units.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub z: i32,
}

impl TileCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Tile containing the world block column `(wx, wz)`.
    pub fn from_block(wx: i32, wz: i32) -> Self {
        let ts = TILE_SIZE as i32;
        Self::new(wx.div_euclid(ts), wz.div_euclid(ts))
    }

    /// Owning group. Negative coordinates use floor division so every tile
    /// maps to exactly one group.
    pub fn group(self) -> GroupCoord {
        let gs = GROUP_SIDE as i32;
        GroupCoord::new(self.x.div_euclid(gs), self.z.div_euclid(gs))
    }

    /// Slot `(dx, dz)` of this tile inside its group, both in `[0, 3)`.
    pub fn slot(self) -> (usize, usize) {
        let gs = GROUP_SIDE as i32;
        (
            self.x.rem_euclid(gs) as usize,
            self.z.rem_euclid(gs) as usize,
        )
    }

    pub fn block_origin(self) -> (i32, i32) {
        let ts = TILE_SIZE as i32;
        (self.x * ts, self.z * ts)
    }
}

/// One 3x3 group of tiles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupCoord {
    pub x: i32,
    pub z: i32,
}

impl GroupCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn base_tile(self) -> TileCoord {
        let gs = GROUP_SIDE as i32;
        TileCoord::new(self.x * gs, self.z * gs)
    }

    pub fn tile_at(self, dx: usize, dz: usize) -> TileCoord {
        let base = self.base_tile();
        TileCoord::new(base.x + dx as i32, base.z + dz as i32)
    }

    /// All nine member tiles, row-major by `dz`.
    pub fn tiles(self) -> impl Iterator<Item = TileCoord> {
        (0..GROUP_SIDE).flat_map(move |dz| (0..GROUP_SIDE).map(move |dx| self.tile_at(dx, dz)))
    }

    pub fn block_origin(self) -> (i32, i32) {
        self.base_tile().block_origin()
    }
}

#[inline]
pub fn slot_index(dx: usize, dz: usize) -> usize {
    dz * GROUP_SIDE + dx
}

/// Row-major index of sample `(x, z)` inside a tile.
#[inline]
pub fn pixel_index(x: usize, z: usize) -> usize {
    z * TILE_SIZE + x
}

//! Read-only view of the host world the tiles are generated from.
//!
//! The host owns block storage; the pipeline only needs the top-height sample
//! of each tile, the material of a block inside a vertical column, and
//! whether that column has finished loading.

use crate::coords::{TileCoord, TILE_AREA, TILE_SIZE};
use std::sync::Arc;

/// Blocks along one edge of a column section.
pub const COLUMN_SIZE: usize = TILE_SIZE;
pub const COLUMN_VOLUME: usize = COLUMN_SIZE * COLUMN_SIZE * COLUMN_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MaterialId(pub u16);

impl MaterialId {
    pub const AIR: Self = Self(0);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Air,
    Stone,
    Soil,
    Gravel,
    Sand,
    Liquid,
    Plant,
    Ore,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Material {
    /// Domain-qualified code such as `game:rock-granite`.
    pub code: String,
    pub kind: MaterialKind,
    /// Map color the host would use for this block, packed `0xAABBGGRR`.
    pub base_color: Option<u32>,
}

impl Material {
    pub fn new(code: impl Into<String>, kind: MaterialKind, base_color: Option<u32>) -> Self {
        Self {
            code: code.into(),
            kind,
            base_color,
        }
    }

    /// Code without its `domain:` prefix.
    pub fn path(&self) -> &str {
        match self.code.split_once(':') {
            Some((_, path)) => path,
            None => &self.code,
        }
    }
}

/// The host's block list, indexed by [`MaterialId`].
#[derive(Clone, Debug, Default)]
pub struct MaterialTable {
    materials: Vec<Material>,
}

impl MaterialTable {
    /// Starts with `game:air` at id 0.
    pub fn new() -> Self {
        Self {
            materials: vec![Material::new("game:air", MaterialKind::Air, None)],
        }
    }

    pub fn register(&mut self, material: Material) -> MaterialId {
        let id = MaterialId(self.materials.len() as u16);
        self.materials.push(material);
        id
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.0 as usize)
    }

    pub fn find(&self, code: &str) -> Option<MaterialId> {
        self.materials
            .iter()
            .position(|material| material.code == code)
            .map(|index| MaterialId(index as u16))
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MaterialId, &Material)> {
        self.materials
            .iter()
            .enumerate()
            .map(|(index, material)| (MaterialId(index as u16), material))
    }
}

/// Top block height of every sample of a tile, row-major.
pub type HeightMap = Arc<[i32; TILE_AREA]>;

/// One 32-block vertical section of a tile.
#[derive(Clone, Debug)]
pub struct Column {
    fully_loaded: bool,
    blocks: Arc<[MaterialId]>,
}

impl Column {
    pub fn loaded(blocks: Arc<[MaterialId]>) -> Self {
        Self {
            fully_loaded: true,
            blocks,
        }
    }

    /// A section whose block data has not arrived yet.
    pub fn loading() -> Self {
        Self {
            fully_loaded: false,
            blocks: Arc::from(Vec::new()),
        }
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.fully_loaded
    }

    /// Out-of-range reads are air.
    pub fn material_at(&self, local_index: usize) -> MaterialId {
        self.blocks
            .get(local_index)
            .copied()
            .unwrap_or(MaterialId::AIR)
    }
}

/// Index of block `(x, y, z)` inside a column section.
#[inline]
pub fn column_index(x: usize, y: usize, z: usize) -> usize {
    (y * COLUMN_SIZE + z) * COLUMN_SIZE + x
}

pub trait TerrainSource: Send + Sync {
    fn is_valid_tile(&self, coord: TileCoord) -> bool;

    /// `None` when the tile's map column is not resident; the pipeline then
    /// falls back to the persisted tile.
    fn height_map(&self, coord: TileCoord) -> Option<HeightMap>;

    /// Number of vertical sections in every tile.
    fn column_count(&self) -> usize;

    fn column(&self, coord: TileCoord, vertical_index: usize) -> Option<Column>;
}

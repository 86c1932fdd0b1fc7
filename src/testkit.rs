//! Deterministic synthetic terrain for tests and the `simulate` command.

use crate::classify::ColorClassifier;
use crate::config::OverlayConfig;
use crate::coords::{TileCoord, TILE_AREA, TILE_SIZE};
use crate::terrain::{
    column_index, Column, HeightMap, Material, MaterialId, MaterialKind, MaterialTable,
    TerrainSource, COLUMN_SIZE, COLUMN_VOLUME,
};
use crate::tile::opaque_from_rgb;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, RwLock};

#[derive(Clone, Debug)]
pub struct SampleIds {
    pub granite: MaterialId,
    pub basalt: MaterialId,
    pub suevite: MaterialId,
    pub soil: MaterialId,
    pub granite_color: u32,
    pub basalt_color: u32,
    /// Built from the default overlay config.
    pub classifier: ColorClassifier,
}

pub fn sample_materials() -> (MaterialTable, SampleIds) {
    let granite_color = opaque_from_rgb(0x8a_8a8a);
    let basalt_color = opaque_from_rgb(0x30_3840);

    let mut table = MaterialTable::new();
    let granite = table.register(Material::new(
        "game:rock-granite",
        MaterialKind::Stone,
        Some(granite_color),
    ));
    let basalt = table.register(Material::new(
        "game:rock-basalt",
        MaterialKind::Stone,
        Some(basalt_color),
    ));
    let suevite = table.register(Material::new(
        "game:rock-suevite",
        MaterialKind::Stone,
        Some(opaque_from_rgb(0x6b_6355)),
    ));
    let soil = table.register(Material::new(
        "game:soil-medium-normal",
        MaterialKind::Soil,
        Some(opaque_from_rgb(0x5a_4028)),
    ));
    table.register(Material::new(
        "game:water-still-7",
        MaterialKind::Liquid,
        Some(opaque_from_rgb(0x2a_4a8c)),
    ));

    let classifier = ColorClassifier::new(&OverlayConfig::default(), &table);
    let ids = SampleIds {
        granite,
        basalt,
        suevite,
        soil,
        granite_color,
        basalt_color,
        classifier,
    };
    (table, ids)
}

/// Heights that differ per sample so a tile image has a recognizable
/// pattern: `base + (x + 2 * z) % span`.
pub fn ramp_heights(base: i32, span: i32) -> [i32; TILE_AREA] {
    let span = span.max(1);
    let mut heights = [0i32; TILE_AREA];
    for (index, height) in heights.iter_mut().enumerate() {
        let x = (index % TILE_SIZE) as i32;
        let z = (index / TILE_SIZE) as i32;
        *height = base + (x + 2 * z) % span;
    }
    heights
}

#[derive(Debug)]
struct LayeredTile {
    heights: HeightMap,
    unloaded_columns: HashSet<usize>,
}

/// Terrain made of horizontal material layers. Every tile shares the same
/// layers; tiles only exist once their height map has been inserted.
#[derive(Debug)]
pub struct LayeredTerrain {
    column_count: usize,
    layers: Vec<(Range<i32>, MaterialId)>,
    /// Inclusive tile bounds of the world, if any.
    bounds: Option<(TileCoord, TileCoord)>,
    tiles: RwLock<HashMap<TileCoord, LayeredTile>>,
}

impl LayeredTerrain {
    pub fn new(column_count: usize) -> Self {
        Self {
            column_count,
            layers: Vec::new(),
            bounds: None,
            tiles: RwLock::new(HashMap::new()),
        }
    }

    /// Later layers win where ranges overlap.
    pub fn with_layer(mut self, heights: Range<i32>, material: MaterialId) -> Self {
        self.layers.push((heights, material));
        self
    }

    pub fn with_bounds(mut self, min: TileCoord, max: TileCoord) -> Self {
        self.bounds = Some((min, max));
        self
    }

    pub fn insert_tile(&self, coord: TileCoord, heights: [i32; TILE_AREA]) {
        self.tiles.write().expect("terrain lock poisoned").insert(
            coord,
            LayeredTile {
                heights: Arc::new(heights),
                unloaded_columns: HashSet::new(),
            },
        );
    }

    /// Unloads the tile; its height map is gone until inserted again.
    pub fn remove_tile(&self, coord: TileCoord) {
        self.tiles.write().expect("terrain lock poisoned").remove(&coord);
    }

    pub fn set_column_loaded(&self, coord: TileCoord, vertical_index: usize, loaded: bool) {
        let mut tiles = self.tiles.write().expect("terrain lock poisoned");
        if let Some(tile) = tiles.get_mut(&coord) {
            if loaded {
                tile.unloaded_columns.remove(&vertical_index);
            } else {
                tile.unloaded_columns.insert(vertical_index);
            }
        }
    }

    pub fn material_at_height(&self, height: i32) -> MaterialId {
        self.layers
            .iter()
            .rev()
            .find(|(range, _)| range.contains(&height))
            .map(|&(_, material)| material)
            .unwrap_or(MaterialId::AIR)
    }

    fn build_column(&self, vertical_index: usize) -> Column {
        let mut blocks = vec![MaterialId::AIR; COLUMN_VOLUME];
        for y in 0..COLUMN_SIZE {
            let material = self.material_at_height((vertical_index * COLUMN_SIZE + y) as i32);
            if material == MaterialId::AIR {
                continue;
            }
            for z in 0..COLUMN_SIZE {
                for x in 0..COLUMN_SIZE {
                    blocks[column_index(x, y, z)] = material;
                }
            }
        }
        Column::loaded(Arc::from(blocks))
    }
}

impl TerrainSource for LayeredTerrain {
    fn is_valid_tile(&self, coord: TileCoord) -> bool {
        match self.bounds {
            Some((min, max)) => {
                (min.x..=max.x).contains(&coord.x) && (min.z..=max.z).contains(&coord.z)
            }
            None => true,
        }
    }

    fn height_map(&self, coord: TileCoord) -> Option<HeightMap> {
        let tiles = self.tiles.read().expect("terrain lock poisoned");
        tiles.get(&coord).map(|tile| tile.heights.clone())
    }

    fn column_count(&self) -> usize {
        self.column_count
    }

    fn column(&self, coord: TileCoord, vertical_index: usize) -> Option<Column> {
        if vertical_index >= self.column_count {
            return None;
        }
        {
            let tiles = self.tiles.read().expect("terrain lock poisoned");
            let tile = tiles.get(&coord)?;
            if tile.unloaded_columns.contains(&vertical_index) {
                return Some(Column::loading());
            }
        }
        Some(self.build_column(vertical_index))
    }
}

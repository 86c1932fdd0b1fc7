use crate::classify::{Surface, SurfacePalette};
use crate::coords::{TileCoord, TILE_AREA, TILE_SIZE};
use crate::terrain::{column_index, Column, TerrainSource, COLUMN_SIZE};
use crate::tile::{TilePixels, TRANSPARENT};
use std::fmt;

/// A vertical section needed by a tile is missing or still loading.
///
/// This is the normal backpressure signal: the caller re-enqueues the tile
/// and tries again on a later cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SourceNotReady {
    pub coord: TileCoord,
    pub vertical_index: usize,
}

impl fmt::Display for SourceNotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column {} of tile {}/{} is not loaded yet",
            self.vertical_index, self.coord.x, self.coord.z
        )
    }
}

impl std::error::Error for SourceNotReady {}

/// Computes tile images from terrain. Holds no per-tile state, so one
/// generator can be reused for every tile.
#[derive(Clone, Debug)]
pub struct TileGenerator {
    palette: SurfacePalette,
}

impl TileGenerator {
    pub fn new(palette: SurfacePalette) -> Self {
        Self { palette }
    }

    pub fn generate<T: TerrainSource + ?Sized>(
        &self,
        terrain: &T,
        coord: TileCoord,
        heights: &[i32; TILE_AREA],
    ) -> Result<TilePixels, SourceNotReady> {
        let columns = collect_columns(terrain, coord)?;
        Ok(self.generate_from_columns(&columns, heights))
    }

    /// Every column must already be fully loaded.
    pub fn generate_from_columns(
        &self,
        columns: &[Column],
        heights: &[i32; TILE_AREA],
    ) -> TilePixels {
        let mut pixels = [TRANSPARENT; TILE_AREA];
        for (index, pixel) in pixels.iter_mut().enumerate() {
            let x = index % TILE_SIZE;
            let z = index / TILE_SIZE;
            *pixel = self.surface_color(columns, x, z, heights[index]);
        }
        TilePixels::from_array(pixels)
    }

    fn surface_color(&self, columns: &[Column], x: usize, z: usize, top_height: i32) -> u32 {
        if top_height <= 0 {
            return TRANSPARENT;
        }
        let mut height = top_height as usize;
        if height / COLUMN_SIZE >= columns.len() {
            return TRANSPARENT;
        }

        loop {
            let column = &columns[height / COLUMN_SIZE];
            let material = column.material_at(column_index(x, height % COLUMN_SIZE, z));
            match self.palette.surface(material) {
                Surface::Color(color) => return color,
                Surface::Unclassified => return TRANSPARENT,
                Surface::Skip => {}
            }
            // The floor block never counts as a surface.
            if height <= 1 {
                return TRANSPARENT;
            }
            height -= 1;
        }
    }
}

fn collect_columns<T: TerrainSource + ?Sized>(
    terrain: &T,
    coord: TileCoord,
) -> Result<Vec<Column>, SourceNotReady> {
    let count = terrain.column_count();
    let mut columns = Vec::with_capacity(count);
    for vertical_index in 0..count {
        match terrain.column(coord, vertical_index) {
            Some(column) if column.is_fully_loaded() => columns.push(column),
            _ => {
                return Err(SourceNotReady {
                    coord,
                    vertical_index,
                })
            }
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{sample_materials, LayeredTerrain};

    fn heights(value: i32) -> [i32; TILE_AREA] {
        [value; TILE_AREA]
    }

    #[test]
    fn descends_through_non_rock_to_the_first_rock() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(2)
            .with_layer(0..40, ids.granite)
            .with_layer(40..44, ids.soil);
        let coord = TileCoord::new(0, 0);
        terrain.insert_tile(coord, heights(43));

        let pixels = generator
            .generate(&terrain, coord, &heights(43))
            .expect("columns are loaded");
        assert!(pixels.as_slice().iter().all(|&pixel| pixel == ids.granite_color));
    }

    #[test]
    fn ignored_rock_is_skipped_like_soil() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(1)
            .with_layer(1..10, ids.basalt)
            .with_layer(10..20, ids.suevite);
        let coord = TileCoord::new(3, -2);
        terrain.insert_tile(coord, heights(19));

        let pixels = generator
            .generate(&terrain, coord, &heights(19))
            .expect("columns are loaded");
        assert!(pixels.as_slice().iter().all(|&pixel| pixel == ids.basalt_color));
    }

    #[test]
    fn floor_heights_and_out_of_range_heights_are_transparent() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(1).with_layer(0..32, ids.granite);
        let coord = TileCoord::new(0, 0);
        terrain.insert_tile(coord, heights(0));

        let mut samples = heights(0);
        samples[1] = -5;
        samples[2] = 32;
        samples[3] = 12;
        let pixels = generator
            .generate(&terrain, coord, &samples)
            .expect("columns are loaded");
        assert_eq!(pixels.get(0), TRANSPARENT);
        assert_eq!(pixels.get(1), TRANSPARENT);
        assert_eq!(pixels.get(2), TRANSPARENT);
        assert_eq!(pixels.get(3), ids.granite_color);
    }

    #[test]
    fn column_without_rock_is_transparent() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(1).with_layer(0..20, ids.soil);
        let coord = TileCoord::new(0, 0);
        terrain.insert_tile(coord, heights(19));

        let pixels = generator
            .generate(&terrain, coord, &heights(19))
            .expect("columns are loaded");
        assert!(pixels.is_fully_transparent());
    }

    #[test]
    fn loading_column_reports_source_not_ready() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(3).with_layer(0..10, ids.granite);
        let coord = TileCoord::new(1, 1);
        terrain.insert_tile(coord, heights(9));
        terrain.set_column_loaded(coord, 2, false);

        let result = generator.generate(&terrain, coord, &heights(9));
        assert_eq!(
            result,
            Err(SourceNotReady {
                coord,
                vertical_index: 2
            })
        );
    }

    #[test]
    fn generation_is_deterministic() {
        let (materials, ids) = sample_materials();
        let generator = TileGenerator::new(ids.classifier.palette(&materials));
        let terrain = LayeredTerrain::new(2)
            .with_layer(1..30, ids.granite)
            .with_layer(30..34, ids.basalt)
            .with_layer(34..36, ids.soil);
        let coord = TileCoord::new(7, 7);
        let mut samples = [0i32; TILE_AREA];
        for (index, sample) in samples.iter_mut().enumerate() {
            *sample = (index % 40) as i32;
        }
        terrain.insert_tile(coord, samples);

        let first = generator.generate(&terrain, coord, &samples).expect("first");
        let second = generator.generate(&terrain, coord, &samples).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.get(35), ids.basalt_color);
        assert_eq!(first.get(10), ids.granite_color);
        assert_eq!(first.get(0), TRANSPARENT);
    }
}

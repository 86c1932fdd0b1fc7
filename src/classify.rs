use crate::config::OverlayConfig;
use crate::terrain::{Material, MaterialId, MaterialKind, MaterialTable};
use crate::tile::{parse_hex_color, with_full_alpha};
use std::collections::{BTreeMap, BTreeSet};

const ROCK_PATH_PREFIX: &str = "rock-";

/// How the tile generator treats one material while scanning a column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Surface {
    /// Not a geology surface; keep descending.
    Skip,
    /// A geology surface without any known color.
    Unclassified,
    Color(u32),
}

/// Maps materials to overlay colors.
///
/// Only stone blocks whose path starts with `rock-` and that are not in the
/// ignore list count as surfaces. Configured colors win; every other surface
/// material falls back to its own base color.
#[derive(Clone, Debug)]
pub struct ColorClassifier {
    colors_by_code: BTreeMap<String, u32>,
    ignored_codes: BTreeSet<String>,
}

impl ColorClassifier {
    pub fn new(config: &OverlayConfig, materials: &MaterialTable) -> Self {
        let mut colors_by_code = BTreeMap::new();
        for (code, raw_color) in &config.rock_code_colors {
            match parse_hex_color(raw_color) {
                Some(color) => {
                    colors_by_code.entry(code.clone()).or_insert(color);
                }
                None => log::warn!(
                    "Ignoring color {:?} for {}: expected #RRGGBB",
                    raw_color,
                    code
                ),
            }
        }

        let mut classifier = Self {
            colors_by_code,
            ignored_codes: config.ignored_rocks.clone(),
        };
        let mut registered = 0usize;
        for (_, material) in materials.iter() {
            if !classifier.is_valid_surface(material)
                || classifier.colors_by_code.contains_key(&material.code)
            {
                continue;
            }
            if let Some(color) = material.base_color {
                classifier
                    .colors_by_code
                    .insert(material.code.clone(), with_full_alpha(color));
                registered += 1;
            }
        }
        log::debug!(
            "classifier ready: {} colored codes ({} from block colors), {} ignored",
            classifier.colors_by_code.len(),
            registered,
            classifier.ignored_codes.len()
        );
        classifier
    }

    pub fn is_valid_surface(&self, material: &Material) -> bool {
        material.kind == MaterialKind::Stone
            && material.path().starts_with(ROCK_PATH_PREFIX)
            && !self.ignored_codes.contains(&material.code)
    }

    pub fn classify(&self, material: &Material) -> Option<u32> {
        if !self.is_valid_surface(material) {
            return None;
        }
        self.colors_by_code.get(&material.code).copied()
    }

    pub fn surface(&self, material: &Material) -> Surface {
        if !self.is_valid_surface(material) {
            return Surface::Skip;
        }
        match self.colors_by_code.get(&material.code) {
            Some(&color) => Surface::Color(color),
            None => Surface::Unclassified,
        }
    }

    /// First material code rendered with `color`.
    pub fn code_for_color(&self, color: u32) -> Option<&str> {
        self.colors_by_code
            .iter()
            .find(|&(_, &candidate)| candidate == color)
            .map(|(code, _)| code.as_str())
    }

    /// Resolves every material id once so generation is a table lookup.
    pub fn palette(&self, materials: &MaterialTable) -> SurfacePalette {
        SurfacePalette {
            surfaces: materials
                .iter()
                .map(|(_, material)| self.surface(material))
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SurfacePalette {
    surfaces: Vec<Surface>,
}

impl SurfacePalette {
    /// Unknown ids are skipped like air.
    pub fn surface(&self, id: MaterialId) -> Surface {
        self.surfaces
            .get(id.0 as usize)
            .copied()
            .unwrap_or(Surface::Skip)
    }
}

use crate::coords::{TileCoord, TILE_AREA};
use std::fmt;
use std::sync::Arc;

/// Fully transparent pixel: no classified material at that sample.
pub const TRANSPARENT: u32 = 0;
const OPAQUE_ALPHA: u32 = 0xff00_0000;

/// The 1024 packed colors of one tile, row-major.
///
/// Colors are RGBA8 packed little-endian (`0xAABBGGRR`), so the byte view
/// from [`TilePixels::as_bytes`] can be uploaded as an RGBA texture as-is.
/// The buffer is shared: cloning a tile for the disk batch and the ready
/// channel does not copy pixels.
#[derive(Clone, PartialEq, Eq)]
pub struct TilePixels(Arc<[u32; TILE_AREA]>);

impl TilePixels {
    pub fn transparent() -> Self {
        Self(Arc::new([TRANSPARENT; TILE_AREA]))
    }

    pub fn from_array(pixels: [u32; TILE_AREA]) -> Self {
        Self(Arc::new(pixels))
    }

    /// Rejects anything that is not exactly one tile of samples.
    pub fn from_slice(pixels: &[u32]) -> Option<Self> {
        let array: [u32; TILE_AREA] = pixels.try_into().ok()?;
        Some(Self::from_array(array))
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0[..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.0[..])
    }

    pub fn get(&self, index: usize) -> u32 {
        self.0[index]
    }

    pub fn is_fully_transparent(&self) -> bool {
        self.0.iter().all(|&pixel| pixel == TRANSPARENT)
    }
}

impl fmt::Debug for TilePixels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opaque = self.0.iter().filter(|&&pixel| pixel != TRANSPARENT).count();
        f.debug_struct("TilePixels")
            .field("opaque", &opaque)
            .finish()
    }
}

/// Unit of on-disk storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedTile {
    pub coord: TileCoord,
    pub pixels: TilePixels,
}

/// Packs a `0xRRGGBB` value into an opaque `0xAABBGGRR` pixel.
pub fn opaque_from_rgb(rgb: u32) -> u32 {
    let r = (rgb >> 16) & 0xff;
    let g = (rgb >> 8) & 0xff;
    let b = rgb & 0xff;
    OPAQUE_ALPHA | (b << 16) | (g << 8) | r
}

/// Forces full alpha on an already packed pixel.
pub fn with_full_alpha(pixel: u32) -> u32 {
    pixel | OPAQUE_ALPHA
}

/// Parses `#RRGGBB` (the leading `#` is optional).
pub fn parse_hex_color(raw: &str) -> Option<u32> {
    let digits = raw.trim().trim_start_matches('#');
    if digits.len() != 6 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok().map(opaque_from_rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors_pack_as_opaque_rgba() {
        assert_eq!(parse_hex_color("#ff8000"), Some(0xff00_80ff));
        assert_eq!(parse_hex_color("0000ff"), Some(0xffff_0000));
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(parse_hex_color("#gg0000"), None);
    }

    #[test]
    fn slices_of_the_wrong_length_are_rejected() {
        assert!(TilePixels::from_slice(&[1u32; TILE_AREA]).is_some());
        assert!(TilePixels::from_slice(&[1u32; TILE_AREA - 1]).is_none());
        assert!(TilePixels::from_slice(&[]).is_none());
    }

    #[test]
    fn byte_view_is_rgba_order() {
        let mut raw = [TRANSPARENT; TILE_AREA];
        raw[0] = opaque_from_rgb(0x112233);
        let tile = TilePixels::from_array(raw);
        assert_eq!(&tile.as_bytes()[..4], &[0x11, 0x22, 0x33, 0xff]);
    }
}

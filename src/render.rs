//! Drawing seam between the tile cache and the host's texture API.

use crate::coords::{GroupCoord, TileCoord, GROUP_PIXELS, TILE_SIZE};

/// Opaque handle to a texture owned by a [`TileRenderer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

pub trait TileRenderer {
    /// Uploads an RGBA8 image of `width * height` pixels.
    fn upload(&mut self, rgba: &[u8], width: u32, height: u32) -> TextureHandle;

    /// `rect_px` is `[x, y, width, height]` in screen pixels.
    fn draw(&mut self, texture: TextureHandle, rect_px: [f32; 4], z: f32, tint: [f32; 4]);

    fn dispose(&mut self, texture: TextureHandle);
}

/// The map camera: which world block sits at the top-left screen pixel and
/// how many screen pixels one block covers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MapView {
    pub origin_x: f64,
    pub origin_z: f64,
    pub pixels_per_block: f32,
    pub width_px: u32,
    pub height_px: u32,
}

impl MapView {
    pub fn new(
        origin_x: f64,
        origin_z: f64,
        pixels_per_block: f32,
        width_px: u32,
        height_px: u32,
    ) -> Self {
        Self {
            origin_x,
            origin_z,
            pixels_per_block: pixels_per_block.max(f32::EPSILON),
            width_px,
            height_px,
        }
    }

    pub fn world_to_screen(&self, wx: f64, wz: f64) -> [f32; 2] {
        let scale = f64::from(self.pixels_per_block);
        [
            ((wx - self.origin_x) * scale) as f32,
            ((wz - self.origin_z) * scale) as f32,
        ]
    }

    pub fn screen_to_world(&self, px: f32, py: f32) -> (f64, f64) {
        let scale = f64::from(self.pixels_per_block);
        (
            self.origin_x + f64::from(px) / scale,
            self.origin_z + f64::from(py) / scale,
        )
    }

    pub fn group_rect(&self, group: GroupCoord) -> [f32; 4] {
        let (bx, bz) = group.block_origin();
        let [x, y] = self.world_to_screen(f64::from(bx), f64::from(bz));
        let side = GROUP_PIXELS as f32 * self.pixels_per_block;
        [x, y, side, side]
    }

    /// Every tile overlapping the screen, row by row.
    pub fn visible_tiles(&self) -> Vec<TileCoord> {
        let (min_x, min_z) = self.screen_to_world(0.0, 0.0);
        let (max_x, max_z) = self.screen_to_world(self.width_px as f32, self.height_px as f32);
        let tile = TILE_SIZE as f64;
        let first_x = (min_x / tile).floor() as i32;
        let first_z = (min_z / tile).floor() as i32;
        // The far edge is exclusive.
        let last_x = (max_x / tile).ceil() as i32 - 1;
        let last_z = (max_z / tile).ceil() as i32 - 1;

        let mut tiles = Vec::new();
        for z in first_z..=last_z {
            for x in first_x..=last_x {
                tiles.push(TileCoord::new(x, z));
            }
        }
        tiles
    }
}

#[derive(Clone, Debug)]
pub struct HeadlessTexture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DrawCall {
    pub texture: TextureHandle,
    pub rect_px: [f32; 4],
    pub z: f32,
    pub tint: [f32; 4],
}

/// CPU-side renderer that keeps uploaded textures in reusable slots and
/// records the draws of the current frame.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    slots: Vec<Option<HeadlessTexture>>,
    free_slots: Vec<u32>,
    draws: Vec<DrawCall>,
    pub uploads: usize,
    pub disposes: usize,
    /// Disposes of handles that were not live.
    pub stale_disposes: usize,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_frame(&mut self) {
        self.draws.clear();
    }

    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&HeadlessTexture> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    pub fn live_textures(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl TileRenderer for HeadlessRenderer {
    fn upload(&mut self, rgba: &[u8], width: u32, height: u32) -> TextureHandle {
        debug_assert_eq!(rgba.len(), width as usize * height as usize * 4);
        let texture = HeadlessTexture {
            width,
            height,
            rgba: rgba.to_vec(),
        };
        self.uploads += 1;
        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(texture);
                TextureHandle(slot)
            }
            None => {
                self.slots.push(Some(texture));
                TextureHandle(self.slots.len() as u32 - 1)
            }
        }
    }

    fn draw(&mut self, texture: TextureHandle, rect_px: [f32; 4], z: f32, tint: [f32; 4]) {
        if self.texture(texture).is_none() {
            log::warn!("draw with disposed texture {:?}", texture);
            return;
        }
        self.draws.push(DrawCall {
            texture,
            rect_px,
            z,
            tint,
        });
    }

    fn dispose(&mut self, texture: TextureHandle) {
        match self.slots.get_mut(texture.0 as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.free_slots.push(texture.0);
                self.disposes += 1;
            }
            _ => {
                log::warn!("dispose of unknown texture {:?}", texture);
                self.stale_disposes += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_tiles_cover_the_screen_exactly() {
        let view = MapView::new(0.0, 0.0, 1.0, 64, 32);
        assert_eq!(view.visible_tiles(), vec![TileCoord::new(0, 0), TileCoord::new(1, 0)]);

        let shifted = MapView::new(-16.0, -16.0, 1.0, 32, 32);
        assert_eq!(
            shifted.visible_tiles(),
            vec![
                TileCoord::new(-1, -1),
                TileCoord::new(0, -1),
                TileCoord::new(-1, 0),
                TileCoord::new(0, 0),
            ]
        );
    }

    #[test]
    fn group_rect_scales_with_zoom() {
        let view = MapView::new(96.0, 0.0, 2.0, 800, 600);
        assert_eq!(view.group_rect(GroupCoord::new(1, 0)), [0.0, 0.0, 192.0, 192.0]);
        assert_eq!(view.group_rect(GroupCoord::new(2, 1)), [192.0, 192.0, 192.0, 192.0]);
    }

    #[test]
    fn headless_renderer_reuses_slots_and_flags_stale_disposes() {
        let mut renderer = HeadlessRenderer::new();
        let pixels = vec![0u8; 4 * 4];
        let a = renderer.upload(&pixels, 2, 2);
        let b = renderer.upload(&pixels, 2, 2);
        assert_ne!(a, b);
        renderer.dispose(a);
        assert_eq!(renderer.live_textures(), 1);
        let c = renderer.upload(&pixels, 2, 2);
        assert_eq!(c, a);

        renderer.dispose(b);
        renderer.dispose(b);
        assert_eq!(renderer.disposes, 2);
        assert_eq!(renderer.stale_disposes, 1);

        renderer.draw(b, [0.0; 4], 50.0, [1.0; 4]);
        renderer.draw(c, [0.0; 4], 50.0, [1.0; 4]);
        assert_eq!(renderer.draws().len(), 1);
    }
}

//! Foreground-only table of tile groups and their textures.

use crate::coords::{
    pixel_index, slot_index, GroupCoord, TileCoord, GROUP_PIXELS, GROUP_SIDE, GROUP_SLOTS,
    TILE_SIZE,
};
use crate::render::{TextureHandle, TileRenderer};
use crate::tile::{TilePixels, TRANSPARENT};
use std::collections::{HashMap, HashSet};

/// One 3x3 block of tiles drawn as a single 96x96 texture.
#[derive(Debug)]
pub struct TileGroup {
    coord: GroupCoord,
    slots: [Option<TilePixels>; GROUP_SLOTS],
    ttl: u32,
    dirty: bool,
    texture: Option<TextureHandle>,
}

impl TileGroup {
    fn new(coord: GroupCoord, ttl: u32) -> Self {
        Self {
            coord,
            slots: Default::default(),
            ttl,
            dirty: false,
            texture: None,
        }
    }

    pub fn coord(&self) -> GroupCoord {
        self.coord
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn slot(&self, dx: usize, dz: usize) -> Option<&TilePixels> {
        self.slots[slot_index(dx, dz)].as_ref()
    }

    pub fn any_chunk_set(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// True if any member tile is on screen.
    pub fn is_visible(&self, visible: &HashSet<TileCoord>) -> bool {
        self.coord.tiles().any(|tile| visible.contains(&tile))
    }

    /// Row-major 96x96 composite; empty slots are transparent.
    pub fn compose(&self) -> Vec<u32> {
        let mut image = vec![TRANSPARENT; GROUP_PIXELS * GROUP_PIXELS];
        for dz in 0..GROUP_SIDE {
            for dx in 0..GROUP_SIDE {
                let Some(pixels) = self.slot(dx, dz) else {
                    continue;
                };
                for z in 0..TILE_SIZE {
                    let row_start = (dz * TILE_SIZE + z) * GROUP_PIXELS + dx * TILE_SIZE;
                    let source = &pixels.as_slice()[pixel_index(0, z)..pixel_index(0, z) + TILE_SIZE];
                    image[row_start..row_start + TILE_SIZE].copy_from_slice(source);
                }
            }
        }
        image
    }

    fn refresh<R: TileRenderer + ?Sized>(&mut self, renderer: &mut R) {
        self.dispose(renderer);
        if self.any_chunk_set() {
            let image = self.compose();
            self.texture = Some(renderer.upload(
                bytemuck::cast_slice(&image),
                GROUP_PIXELS as u32,
                GROUP_PIXELS as u32,
            ));
        }
        self.dirty = false;
    }

    /// Releases the texture; calling it again is a no-op.
    pub fn dispose<R: TileRenderer + ?Sized>(&mut self, renderer: &mut R) {
        if let Some(texture) = self.texture.take() {
            renderer.dispose(texture);
        }
    }
}

#[derive(Debug)]
pub struct TileCache {
    groups: HashMap<GroupCoord, TileGroup>,
    max_ttl: u32,
}

impl TileCache {
    pub fn new(max_ttl: u32) -> Self {
        Self {
            groups: HashMap::new(),
            max_ttl: max_ttl.max(1),
        }
    }

    pub fn max_ttl(&self) -> u32 {
        self.max_ttl
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, coord: GroupCoord) -> Option<&TileGroup> {
        self.groups.get(&coord)
    }

    pub fn groups(&self) -> impl Iterator<Item = &TileGroup> {
        self.groups.values()
    }

    /// Stores a tile in its group slot. Returns true if the group was created.
    pub fn set_chunk(&mut self, group: GroupCoord, dx: usize, dz: usize, pixels: TilePixels) -> bool {
        let mut created = false;
        let max_ttl = self.max_ttl;
        let entry = self.groups.entry(group).or_insert_with(|| {
            created = true;
            TileGroup::new(group, max_ttl)
        });
        entry.slots[slot_index(dx, dz)] = Some(pixels);
        entry.dirty = true;
        created
    }

    pub fn chunk(&self, coord: TileCoord) -> Option<&TilePixels> {
        let (dx, dz) = coord.slot();
        self.groups.get(&coord.group())?.slot(dx, dz)
    }

    pub fn is_chunk_set(&self, coord: TileCoord) -> bool {
        self.chunk(coord).is_some()
    }

    /// Re-uploads every dirty group among `groups`, once each. Returns the
    /// number of groups refreshed.
    pub fn finish_batch<R: TileRenderer + ?Sized>(
        &mut self,
        groups: impl IntoIterator<Item = GroupCoord>,
        renderer: &mut R,
    ) -> usize {
        let mut refreshed = 0;
        for coord in groups {
            if let Some(group) = self.groups.get_mut(&coord) {
                if group.dirty {
                    group.refresh(renderer);
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Clears the slot of `coord`. The group itself stays until its TTL runs out.
    pub fn unset_chunk(&mut self, coord: TileCoord) -> bool {
        let (dx, dz) = coord.slot();
        let Some(group) = self.groups.get_mut(&coord.group()) else {
            return false;
        };
        let cleared = group.slots[slot_index(dx, dz)].take().is_some();
        if cleared {
            group.dirty = true;
        }
        cleared
    }

    /// Ages hidden or empty groups and evicts those whose TTL reached zero.
    /// Returns the evicted group coordinates.
    pub fn sweep<R: TileRenderer + ?Sized>(
        &mut self,
        visible: &HashSet<TileCoord>,
        renderer: &mut R,
    ) -> Vec<GroupCoord> {
        let max_ttl = self.max_ttl;
        let mut evicted = Vec::new();
        self.groups.retain(|&coord, group| {
            if group.any_chunk_set() && group.is_visible(visible) {
                group.ttl = max_ttl;
                return true;
            }
            group.ttl = group.ttl.saturating_sub(1);
            if group.ttl > 0 {
                return true;
            }
            group.dispose(renderer);
            evicted.push(coord);
            false
        });
        if !evicted.is_empty() {
            log::debug!("evicted {} tile groups, {} resident", evicted.len(), self.groups.len());
        }
        evicted
    }

    /// Disposes and removes every group.
    pub fn clear<R: TileRenderer + ?Sized>(&mut self, renderer: &mut R) -> usize {
        let cleared = self.groups.len();
        for group in self.groups.values_mut() {
            group.dispose(renderer);
        }
        self.groups.clear();
        cleared
    }

    /// Pixel under world block column `(wx, wz)`, if its tile is resident.
    pub fn pixel_at(&self, wx: i32, wz: i32) -> Option<u32> {
        let pixels = self.chunk(TileCoord::from_block(wx, wz))?;
        let ts = TILE_SIZE as i32;
        Some(pixels.get(pixel_index(
            wx.rem_euclid(ts) as usize,
            wz.rem_euclid(ts) as usize,
        )))
    }
}

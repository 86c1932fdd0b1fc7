use crate::cache::TileCache;
use crate::coords::TileCoord;
use crate::queue::GenerationQueue;
use crate::render::TileRenderer;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewportDelta {
    pub enqueued: usize,
    pub unset: usize,
}

/// Turns viewport transitions into generation requests and cache unsets.
#[derive(Debug, Clone)]
pub struct ViewportTracker {
    queue: Arc<GenerationQueue>,
}

impl ViewportTracker {
    pub fn new(queue: Arc<GenerationQueue>) -> Self {
        Self { queue }
    }

    /// Newly visible tiles are requested unless their slot is already
    /// populated; newly hidden tiles lose their slot.
    pub fn apply(
        &self,
        cache: &mut TileCache,
        now_visible: &[TileCoord],
        now_hidden: &[TileCoord],
    ) -> ViewportDelta {
        let enqueued = self
            .queue
            .apply_viewport_delta(now_visible, now_hidden, |coord| !cache.is_chunk_set(coord));
        let unset = now_hidden
            .iter()
            .filter(|&&coord| cache.unset_chunk(coord))
            .count();
        log::trace!(
            "viewport: +{} -{} tiles, {} requested, {} unset",
            now_visible.len(),
            now_hidden.len(),
            enqueued,
            unset
        );
        ViewportDelta { enqueued, unset }
    }

    /// Drops every resident group and requests the whole visible set again.
    pub fn redraw<R: TileRenderer + ?Sized>(&self, cache: &mut TileCache, renderer: &mut R) -> usize {
        let disposed = cache.clear(renderer);
        self.queue.clear_resident_groups();
        let enqueued = self.queue.enqueue_visible();
        log::info!("Redrawing map: {} groups disposed, {} tiles requeued", disposed, enqueued);
        enqueued
    }
}

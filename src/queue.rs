use crate::coords::{GroupCoord, TileCoord};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TileCoord>,
    pending_set: HashSet<TileCoord>,
    /// Tiles currently on screen. Written by the viewport, read by the
    /// dirty-notification path.
    visible: HashSet<TileCoord>,
    /// Mirror of the groups resident in the foreground cache.
    resident_groups: HashSet<GroupCoord>,
    view_open: bool,
}

impl QueueState {
    fn enqueue(&mut self, coord: TileCoord) -> bool {
        if self.pending_set.insert(coord) {
            self.pending.push_back(coord);
            true
        } else {
            false
        }
    }
}

/// Duplicate-free FIFO of tiles waiting for generation.
///
/// The same lock also guards the visible set and the resident-group mirror,
/// so the dirty-notification path can decide relevance and enqueue in one
/// critical section.
#[derive(Debug, Default)]
pub struct GenerationQueue {
    state: Mutex<QueueState>,
}

impl GenerationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("generation queue lock poisoned")
    }

    /// Returns false when `coord` was already queued.
    pub fn enqueue(&self, coord: TileCoord) -> bool {
        self.lock().enqueue(coord)
    }

    pub fn enqueue_many(&self, coords: impl IntoIterator<Item = TileCoord>) -> usize {
        let mut state = self.lock();
        coords
            .into_iter()
            .filter(|&coord| state.enqueue(coord))
            .count()
    }

    /// Removes up to `max` tiles in FIFO order. Stops early once `shutdown`
    /// is raised; whatever was not taken stays queued.
    pub fn drain_up_to(&self, max: usize, shutdown: &AtomicBool) -> Vec<TileCoord> {
        let mut state = self.lock();
        let mut batch = Vec::with_capacity(max.min(state.pending.len()));
        while batch.len() < max {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(coord) = state.pending.pop_front() else {
                break;
            };
            state.pending_set.remove(&coord);
            batch.push(coord);
        }
        batch
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.pending_set.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        self.lock().pending_set.contains(&coord)
    }

    /// Applies a viewport delta and enqueues each newly visible tile for
    /// which `needs_generation` holds, all under one lock. Returns the number
    /// of tiles enqueued.
    pub fn apply_viewport_delta(
        &self,
        now_visible: &[TileCoord],
        now_hidden: &[TileCoord],
        mut needs_generation: impl FnMut(TileCoord) -> bool,
    ) -> usize {
        let mut state = self.lock();
        state.view_open = true;
        state.visible.extend(now_visible.iter().copied());
        for coord in now_hidden {
            state.visible.remove(coord);
        }
        let mut enqueued = 0;
        for &coord in now_visible {
            if needs_generation(coord) && state.enqueue(coord) {
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Queues every visible tile again. Returns the number enqueued.
    pub fn enqueue_visible(&self) -> usize {
        let mut state = self.lock();
        let mut visible: Vec<TileCoord> = state.visible.iter().copied().collect();
        visible.sort_unstable();
        visible
            .into_iter()
            .filter(|&coord| state.enqueue(coord))
            .count()
    }

    /// Enqueues a changed tile if the view is open and the tile is on screen
    /// or its group is resident.
    pub fn enqueue_if_relevant(&self, coord: TileCoord) -> bool {
        let mut state = self.lock();
        if !state.view_open {
            return false;
        }
        if !state.visible.contains(&coord) && !state.resident_groups.contains(&coord.group()) {
            return false;
        }
        state.enqueue(coord)
    }

    pub fn with_visible<R>(&self, f: impl FnOnce(&HashSet<TileCoord>) -> R) -> R {
        let state = self.lock();
        f(&state.visible)
    }

    pub fn is_visible(&self, coord: TileCoord) -> bool {
        self.lock().visible.contains(&coord)
    }

    pub fn set_group_resident(&self, group: GroupCoord, resident: bool) {
        let mut state = self.lock();
        if resident {
            state.resident_groups.insert(group);
        } else {
            state.resident_groups.remove(&group);
        }
    }

    pub fn clear_resident_groups(&self) {
        self.lock().resident_groups.clear();
    }

    /// Drops pending work and the visible set; dirty notifications are
    /// ignored until the next viewport change.
    pub fn close_view(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.pending_set.clear();
        state.visible.clear();
        state.view_open = false;
    }

    pub fn is_view_open(&self) -> bool {
        self.lock().view_open
    }
}

//! Background half of the tile pump and its hand-off channel.

use crate::coords::TileCoord;
use crate::generator::TileGenerator;
use crate::queue::GenerationQueue;
use crate::store::{PendingWrites, TileStore};
use crate::terrain::TerrainSource;
use crate::tile::TilePixels;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// A tile produced by the background path, generated or loaded from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyTile {
    pub coord: TileCoord,
    pub pixels: TilePixels,
}

pub fn ready_channel() -> (Sender<ReadyTile>, Receiver<ReadyTile>) {
    mpsc::channel()
}

/// Takes at most `cap` tiles without blocking.
pub fn drain_ready(receiver: &Receiver<ReadyTile>, cap: usize) -> Vec<ReadyTile> {
    receiver.try_iter().take(cap).collect()
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BackgroundReport {
    pub generated: usize,
    pub loaded_from_store: usize,
    pub retried: usize,
    pub dropped: usize,
    pub flushed: usize,
}

/// Drains the generation queue into the ready channel.
///
/// Tiles whose terrain is resident are generated and queued for a disk
/// write; the rest are served from pending writes or the store.
pub struct BackgroundWorker {
    terrain: Arc<dyn TerrainSource>,
    generator: TileGenerator,
    store: TileStore,
    pending: PendingWrites,
    queue: Arc<GenerationQueue>,
    ready: Sender<ReadyTile>,
    shutdown: Arc<AtomicBool>,
    period: Duration,
    since_run: Duration,
}

impl BackgroundWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        terrain: Arc<dyn TerrainSource>,
        generator: TileGenerator,
        store: TileStore,
        pending: PendingWrites,
        queue: Arc<GenerationQueue>,
        ready: Sender<ReadyTile>,
        shutdown: Arc<AtomicBool>,
        period: Duration,
    ) -> Self {
        Self {
            terrain,
            generator,
            store,
            pending,
            queue,
            ready,
            shutdown,
            period,
            since_run: Duration::ZERO,
        }
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TileStore {
        &mut self.store
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Runs one generation pass once `period` has accumulated.
    pub fn tick(&mut self, dt: Duration) -> BackgroundReport {
        self.pending.advance(dt);
        self.since_run = self.since_run.saturating_add(dt);
        if self.since_run < self.period {
            return BackgroundReport::default();
        }
        self.since_run = Duration::ZERO;

        let mut report = BackgroundReport::default();
        let batch = self.queue.drain_up_to(usize::MAX, &self.shutdown);
        for (index, &coord) in batch.iter().enumerate() {
            if self.shutdown.load(Ordering::Relaxed) {
                self.queue.enqueue_many(batch[index..].iter().copied());
                break;
            }
            self.process(coord, &mut report);
        }

        match self.pending.flush_if_due(&mut self.store) {
            Ok(Some(written)) => {
                report.flushed = written;
                log::debug!("flushed {} tiles to {}", written, self.store.path().display());
            }
            Ok(None) => {}
            Err(error) => log::error!(
                "Failed writing {} tiles to {}: {}",
                self.pending.len(),
                self.store.path().display(),
                error
            ),
        }
        report
    }

    fn process(&mut self, coord: TileCoord, report: &mut BackgroundReport) {
        if !self.terrain.is_valid_tile(coord) {
            log::debug!("dropping out-of-world tile {}/{}", coord.x, coord.z);
            report.dropped += 1;
            return;
        }

        let Some(heights) = self.terrain.height_map(coord) else {
            let persisted = match self.pending.get(coord) {
                Some(pixels) => Some(pixels.clone()),
                None => self.store.get_tile(coord).map(|tile| tile.pixels),
            };
            if let Some(pixels) = persisted {
                report.loaded_from_store += 1;
                self.send(coord, pixels);
            }
            return;
        };

        match self.generator.generate(&*self.terrain, coord, &heights) {
            Ok(pixels) => {
                self.pending.insert(coord, pixels.clone());
                report.generated += 1;
                self.send(coord, pixels);
            }
            Err(not_ready) => {
                log::trace!("{}; retrying later", not_ready);
                self.queue.enqueue(coord);
                report.retried += 1;
            }
        }
    }

    fn send(&self, coord: TileCoord, pixels: TilePixels) {
        if self.ready.send(ReadyTile { coord, pixels }).is_err() {
            log::debug!("ready channel closed, discarding tile {}/{}", coord.x, coord.z);
        }
    }

    /// Writes every pending tile now.
    pub fn flush(&mut self) -> io::Result<usize> {
        self.pending.flush(&mut self.store)
    }
}

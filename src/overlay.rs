//! The overlay facade: wires the queue, background worker, ready channel
//! and foreground cache together and exposes the host-facing operations.

use crate::cache::TileCache;
use crate::classify::ColorClassifier;
use crate::config::{OverlayConfig, PipelineConfig, StoreOptions};
use crate::coords::TileCoord;
use crate::generator::TileGenerator;
use crate::pipeline::{drain_ready, ready_channel, BackgroundReport, BackgroundWorker, ReadyTile};
use crate::queue::GenerationQueue;
use crate::render::{MapView, TileRenderer};
use crate::store::{PendingWrites, StoreOpenError, TileStore};
use crate::terrain::{MaterialTable, TerrainSource};
use crate::tile::TRANSPARENT;
use crate::viewport::{ViewportDelta, ViewportTracker};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use web_time::Instant;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ForegroundReport {
    pub consumed: usize,
    pub refreshed_groups: usize,
    pub evicted_groups: usize,
}

pub struct GeologyOverlay<R: TileRenderer> {
    config: PipelineConfig,
    queue: Arc<GenerationQueue>,
    shutdown: Arc<AtomicBool>,
    worker: Arc<Mutex<BackgroundWorker>>,
    background: Option<JoinHandle<()>>,
    ready: Receiver<ReadyTile>,
    cache: TileCache,
    viewport: ViewportTracker,
    classifier: ColorClassifier,
    renderer: R,
    tint: [f32; 4],
    since_sweep: Duration,
    shut_down: bool,
}

impl<R: TileRenderer> GeologyOverlay<R> {
    /// Opens the tile store; failure to open it is fatal for the overlay.
    pub fn new(
        terrain: Arc<dyn TerrainSource>,
        materials: &MaterialTable,
        overlay_config: &OverlayConfig,
        config: PipelineConfig,
        store_path: &Path,
        store_options: StoreOptions,
        renderer: R,
    ) -> Result<Self, StoreOpenError> {
        let store = TileStore::open(store_path, store_options)?;
        let overlay_config = overlay_config.clone().sanitized();
        let classifier = ColorClassifier::new(&overlay_config, materials);
        let generator = TileGenerator::new(classifier.palette(materials));

        let queue = Arc::new(GenerationQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (sender, ready) = ready_channel();
        let worker = BackgroundWorker::new(
            terrain,
            generator,
            store,
            PendingWrites::new(config.flush_pending_threshold, config.flush_interval),
            queue.clone(),
            sender,
            shutdown.clone(),
            config.background_period,
        );

        Ok(Self {
            cache: TileCache::new(config.max_ttl),
            viewport: ViewportTracker::new(queue.clone()),
            config,
            queue,
            shutdown,
            worker: Arc::new(Mutex::new(worker)),
            background: None,
            ready,
            classifier,
            renderer,
            tint: [1.0, 1.0, 1.0, overlay_config.overlay_alpha],
            since_sweep: Duration::ZERO,
            shut_down: false,
        })
    }

    fn worker(&self) -> MutexGuard<'_, BackgroundWorker> {
        self.worker.lock().expect("background worker lock poisoned")
    }

    /// Runs the background pass on a dedicated thread. Hosts that drive
    /// [`Self::tick_background`] themselves do not need this.
    pub fn spawn_background(&mut self) -> io::Result<()> {
        if self.background.is_some() || self.shut_down {
            return Ok(());
        }
        let worker = self.worker.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.background_period;
        let handle = thread::Builder::new()
            .name("geology-map-gen".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let now = Instant::now();
                    let dt = now.duration_since(last);
                    last = now;
                    worker
                        .lock()
                        .expect("background worker lock poisoned")
                        .tick(dt);
                }
            })?;
        self.background = Some(handle);
        Ok(())
    }

    /// Does nothing once [`Self::spawn_background`] has started the thread.
    pub fn tick_background(&self, dt: Duration) -> BackgroundReport {
        if self.shut_down || self.background.is_some() {
            return BackgroundReport::default();
        }
        self.worker().tick(dt)
    }

    /// Consumes ready tiles into the cache and sweeps TTLs once per
    /// `sweep_interval`.
    pub fn tick_foreground(&mut self, dt: Duration) -> ForegroundReport {
        let mut report = ForegroundReport::default();
        if self.shut_down {
            return report;
        }

        let mut touched = BTreeSet::new();
        for tile in drain_ready(&self.ready, self.config.ready_drain_cap) {
            let group = tile.coord.group();
            let (dx, dz) = tile.coord.slot();
            if self.cache.set_chunk(group, dx, dz, tile.pixels) {
                self.queue.set_group_resident(group, true);
            }
            touched.insert(group);
            report.consumed += 1;
        }
        report.refreshed_groups = self.cache.finish_batch(touched, &mut self.renderer);

        self.since_sweep = self.since_sweep.saturating_add(dt);
        if self.since_sweep >= self.config.sweep_interval {
            self.since_sweep = Duration::ZERO;
            let cache = &mut self.cache;
            let renderer = &mut self.renderer;
            let evicted = self
                .queue
                .with_visible(|visible| cache.sweep(visible, renderer));
            for group in &evicted {
                self.queue.set_group_resident(*group, false);
            }
            report.evicted_groups = evicted.len();
        }
        report
    }

    pub fn on_viewport_changed(
        &mut self,
        now_visible: &[TileCoord],
        now_hidden: &[TileCoord],
    ) -> ViewportDelta {
        self.viewport.apply(&mut self.cache, now_visible, now_hidden)
    }

    /// Requests regeneration of a changed tile if anyone could see it.
    pub fn on_source_region_dirty(&self, coord: TileCoord) -> bool {
        self.queue.enqueue_if_relevant(coord)
    }

    pub fn redraw(&mut self) -> usize {
        self.viewport.redraw(&mut self.cache, &mut self.renderer)
    }

    /// Deletes every persisted tile. Tiles already in memory stay.
    pub fn purge_store(&self) -> io::Result<()> {
        self.worker().store_mut().purge()
    }

    pub fn close_view(&self) {
        self.queue.close_view();
    }

    pub fn set_overlay_alpha(&mut self, alpha: f32) {
        self.tint[3] = if alpha.is_finite() {
            alpha.clamp(0.0, 1.0)
        } else {
            1.0
        };
    }

    pub fn overlay_alpha(&self) -> f32 {
        self.tint[3]
    }

    /// Draws every resident group. Returns the number of draw calls.
    pub fn render(&mut self, view: &MapView) -> usize {
        let mut draws = 0;
        for group in self.cache.groups() {
            let Some(texture) = group.texture() else {
                continue;
            };
            self.renderer
                .draw(texture, view.group_rect(group.coord()), self.config.z_order, self.tint);
            draws += 1;
        }
        draws
    }

    /// Material code of the overlay pixel under a world block column.
    pub fn hover_label(&self, world_x: i32, world_z: i32) -> Option<String> {
        let color = self.cache.pixel_at(world_x, world_z)?;
        if color == TRANSPARENT {
            return None;
        }
        self.classifier.code_for_color(color).map(str::to_string)
    }

    /// Stops the background thread, flushes pending writes and disposes
    /// every texture. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.background.take() {
            if handle.join().is_err() {
                log::error!("geology map background thread panicked");
            }
        }

        {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match worker.flush() {
                Ok(written) => log::info!("Flushed {} map tiles on shutdown", written),
                Err(error) => log::error!(
                    "Failed flushing map tiles to {}: {}",
                    worker.store().path().display(),
                    error
                ),
            }
        }
        let disposed = self.cache.clear(&mut self.renderer);
        self.queue.close_view();
        self.queue.clear_resident_groups();
        log::debug!("geology overlay shut down, {} groups disposed", disposed);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn queue(&self) -> &GenerationQueue {
        &self.queue
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn pending_writes(&self) -> usize {
        self.worker().pending_writes()
    }

    pub fn stored_tiles(&self) -> usize {
        self.worker().store().len()
    }
}

impl<R: TileRenderer> Drop for GeologyOverlay<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

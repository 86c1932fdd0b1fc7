use super::{drain_ready, ready_channel, BackgroundReport, BackgroundWorker};
use crate::classify::ColorClassifier;
use crate::config::{OverlayConfig, PipelineConfig, StoreOptions};
use crate::coords::{GroupCoord, TileCoord, TILE_AREA};
use crate::generator::TileGenerator;
use crate::overlay::GeologyOverlay;
use crate::queue::GenerationQueue;
use crate::render::{HeadlessRenderer, MapView};
use crate::store::{PendingWrites, TileStore};
use crate::terrain::{Column, HeightMap, MaterialTable, TerrainSource};
use crate::testkit::{ramp_heights, sample_materials, LayeredTerrain, SampleIds};
use crate::tile::TilePixels;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

const BACKGROUND_STEP: Duration = Duration::from_millis(100);
const FRAME: Duration = Duration::from_millis(16);
const SWEEP: Duration = Duration::from_secs(1);

fn test_db(name: &str) -> PathBuf {
    let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "geology-map-pipeline-{name}-{}-{}",
        std::process::id(),
        serial
    ));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).expect("create test dir");
    path.join("pipeline-geology.db")
}

struct Fixture {
    materials: MaterialTable,
    ids: SampleIds,
    terrain: Arc<LayeredTerrain>,
}

/// Granite up to height 20, basalt from 20 to 40.
fn fixture() -> Fixture {
    let (materials, ids) = sample_materials();
    let terrain = Arc::new(
        LayeredTerrain::new(2)
            .with_layer(1..20, ids.granite)
            .with_layer(20..40, ids.basalt)
            .with_bounds(TileCoord::new(-20, -20), TileCoord::new(20, 20)),
    );
    Fixture {
        materials,
        ids,
        terrain,
    }
}

impl Fixture {
    fn overlay(&self, config: PipelineConfig, db: &Path) -> GeologyOverlay<HeadlessRenderer> {
        GeologyOverlay::new(
            self.terrain.clone(),
            &self.materials,
            &OverlayConfig::default(),
            config,
            db,
            StoreOptions::default(),
            HeadlessRenderer::new(),
        )
        .expect("open overlay")
    }

    fn expected_pixels(&self, heights: &[i32; TILE_AREA]) -> TilePixels {
        let mut pixels = [0u32; TILE_AREA];
        for (pixel, &height) in pixels.iter_mut().zip(heights.iter()) {
            *pixel = if height < 20 {
                self.ids.granite_color
            } else {
                self.ids.basalt_color
            };
        }
        TilePixels::from_array(pixels)
    }
}

fn pump(overlay: &mut GeologyOverlay<HeadlessRenderer>) {
    overlay.tick_background(BACKGROUND_STEP);
    overlay.tick_foreground(FRAME);
}

#[test]
fn visible_tile_lands_in_its_group_slot() {
    let fixture = fixture();
    let db = test_db("slot");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(5, 5);
    let heights = ramp_heights(15, 10);
    fixture.terrain.insert_tile(coord, heights);

    let delta = overlay.on_viewport_changed(&[coord], &[]);
    assert_eq!(delta.enqueued, 1);

    let background = overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(background.generated, 1);
    let foreground = overlay.tick_foreground(FRAME);
    assert_eq!(foreground.consumed, 1);
    assert_eq!(foreground.refreshed_groups, 1);

    let group = overlay.cache().group(GroupCoord::new(1, 1)).expect("group (1,1)");
    assert_eq!(group.slot(2, 2), Some(&fixture.expected_pixels(&heights)));
    assert!(group.texture().is_some());
    assert_eq!(overlay.renderer().uploads, 1);
}

#[test]
fn incomplete_source_data_is_retried() {
    let fixture = fixture();
    let db = test_db("retry");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(1, 1);
    fixture.terrain.insert_tile(coord, ramp_heights(10, 4));
    fixture.terrain.set_column_loaded(coord, 1, false);
    overlay.on_viewport_changed(&[coord], &[]);

    let report = overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(report.retried, 1);
    assert!(overlay.queue().contains(coord));
    overlay.tick_foreground(FRAME);
    assert!(!overlay.cache().is_chunk_set(coord));

    fixture.terrain.set_column_loaded(coord, 1, true);
    let report = overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(report.generated, 1);
    overlay.tick_foreground(FRAME);
    assert!(overlay.cache().is_chunk_set(coord));
}

#[test]
fn background_waits_for_its_period() {
    let fixture = fixture();
    let db = test_db("period");
    let overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(0, 0);
    fixture.terrain.insert_tile(coord, ramp_heights(5, 3));
    overlay.queue().enqueue(coord);

    assert_eq!(overlay.tick_background(Duration::from_millis(40)).generated, 0);
    assert_eq!(overlay.tick_background(Duration::from_millis(40)).generated, 0);
    assert_eq!(overlay.tick_background(Duration::from_millis(40)).generated, 1);
}

#[test]
fn visible_populated_group_is_never_evicted() {
    let fixture = fixture();
    let db = test_db("keep-alive");
    let config = PipelineConfig::default();
    let max_ttl = config.max_ttl;
    let mut overlay = fixture.overlay(config, &db);
    let coord = TileCoord::new(0, 0);
    fixture.terrain.insert_tile(coord, ramp_heights(5, 3));
    overlay.on_viewport_changed(&[coord], &[]);
    pump(&mut overlay);

    for _ in 0..max_ttl + 5 {
        assert_eq!(overlay.tick_foreground(SWEEP).evicted_groups, 0);
    }
    let group = overlay.cache().group(coord.group()).expect("resident group");
    assert_eq!(group.ttl(), max_ttl);
}

#[test]
fn hidden_tile_group_is_evicted_after_max_ttl_sweeps() {
    let fixture = fixture();
    let db = test_db("evict");
    let config = PipelineConfig::default();
    let max_ttl = config.max_ttl;
    let mut overlay = fixture.overlay(config, &db);
    let coord = TileCoord::new(0, 0);
    fixture.terrain.insert_tile(coord, ramp_heights(5, 3));
    overlay.on_viewport_changed(&[coord], &[]);
    pump(&mut overlay);
    assert!(overlay.cache().is_chunk_set(coord));

    let delta = overlay.on_viewport_changed(&[], &[coord]);
    assert_eq!(delta.unset, 1);

    overlay.tick_foreground(SWEEP);
    assert_eq!(
        overlay.cache().group(coord.group()).expect("group").ttl(),
        max_ttl - 1
    );
    for _ in 1..max_ttl - 1 {
        assert_eq!(overlay.tick_foreground(SWEEP).evicted_groups, 0);
    }
    assert_eq!(overlay.tick_foreground(SWEEP).evicted_groups, 1);
    assert!(overlay.cache().group(coord.group()).is_none());
    assert_eq!(overlay.renderer().disposes, 1);
    assert!(!overlay.on_source_region_dirty(coord));
}

#[test]
fn unloaded_terrain_is_served_from_disk() {
    let fixture = fixture();
    let db = test_db("disk");
    let coord = TileCoord::new(2, 2);
    let heights = ramp_heights(12, 16);
    fixture.terrain.insert_tile(coord, heights);
    {
        let mut writer = fixture.overlay(PipelineConfig::default(), &db);
        writer.on_viewport_changed(&[coord], &[]);
        pump(&mut writer);
        writer.shutdown();
        assert_eq!(writer.stored_tiles(), 1);
    }

    fixture.terrain.remove_tile(coord);
    let mut reader = fixture.overlay(PipelineConfig::default(), &db);
    reader.on_viewport_changed(&[coord], &[]);
    let report = reader.tick_background(BACKGROUND_STEP);
    assert_eq!(report.loaded_from_store, 1);
    assert_eq!(report.generated, 0);
    reader.tick_foreground(FRAME);
    assert_eq!(
        reader.cache().chunk(coord),
        Some(&fixture.expected_pixels(&heights))
    );
}

#[test]
fn unflushed_tiles_are_served_from_pending_writes() {
    let fixture = fixture();
    let db = test_db("pending");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(-3, 4);
    fixture.terrain.insert_tile(coord, ramp_heights(18, 4));
    overlay.on_viewport_changed(&[coord], &[]);
    pump(&mut overlay);
    assert_eq!(overlay.pending_writes(), 1);
    assert_eq!(overlay.stored_tiles(), 0);

    fixture.terrain.remove_tile(coord);
    assert_eq!(overlay.redraw(), 1);
    let report = overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(report.loaded_from_store, 1);
    overlay.tick_foreground(FRAME);
    assert!(overlay.cache().is_chunk_set(coord));
}

#[test]
fn pending_writes_flush_on_the_interval() {
    let fixture = fixture();
    let db = test_db("flush-interval");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(0, 1);
    fixture.terrain.insert_tile(coord, ramp_heights(3, 3));
    overlay.on_viewport_changed(&[coord], &[]);
    pump(&mut overlay);

    for _ in 0..39 {
        overlay.tick_background(BACKGROUND_STEP);
    }
    assert_eq!(overlay.stored_tiles(), 0);
    overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(overlay.stored_tiles(), 1);
    assert_eq!(overlay.pending_writes(), 0);
}

#[test]
fn out_of_world_tiles_are_dropped() {
    let fixture = fixture();
    let db = test_db("invalid");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(50, 50);
    overlay.on_viewport_changed(&[coord], &[]);
    let report = overlay.tick_background(BACKGROUND_STEP);
    assert_eq!(report.dropped, 1);
    assert!(overlay.queue().is_empty());
}

#[test]
fn foreground_drain_is_capped_per_tick() {
    let fixture = fixture();
    let db = test_db("drain-cap");
    let config = PipelineConfig {
        ready_drain_cap: 2,
        ..PipelineConfig::default()
    };
    let mut overlay = fixture.overlay(config, &db);
    let coords: Vec<TileCoord> = (0..5).map(|x| TileCoord::new(x, 0)).collect();
    for &coord in &coords {
        fixture.terrain.insert_tile(coord, ramp_heights(4, 2));
    }
    overlay.on_viewport_changed(&coords, &[]);
    assert_eq!(overlay.tick_background(BACKGROUND_STEP).generated, 5);

    assert_eq!(overlay.tick_foreground(FRAME).consumed, 2);
    assert_eq!(overlay.tick_foreground(FRAME).consumed, 2);
    assert_eq!(overlay.tick_foreground(FRAME).consumed, 1);
    assert!(coords.iter().all(|&coord| overlay.cache().is_chunk_set(coord)));
}

#[test]
fn dirty_notifications_follow_view_state() {
    let fixture = fixture();
    let db = test_db("dirty");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(3, 3);
    assert!(!overlay.on_source_region_dirty(coord));

    overlay.on_viewport_changed(&[coord], &[]);
    overlay.queue().clear();
    assert!(overlay.on_source_region_dirty(coord));

    overlay.close_view();
    assert!(overlay.queue().is_empty());
    assert!(!overlay.on_source_region_dirty(coord));
}

#[test]
fn render_and_hover_use_resident_groups() {
    let fixture = fixture();
    let db = test_db("render");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coord = TileCoord::new(5, 5);
    fixture.terrain.insert_tile(coord, ramp_heights(15, 10));
    overlay.on_viewport_changed(&[coord], &[]);
    pump(&mut overlay);

    let view = MapView::new(96.0, 96.0, 2.0, 400, 300);
    overlay.set_overlay_alpha(0.5);
    overlay.renderer_mut().begin_frame();
    assert_eq!(overlay.render(&view), 1);
    let draw = overlay.renderer().draws()[0];
    assert_eq!(draw.rect_px, [0.0, 0.0, 192.0, 192.0]);
    assert_eq!(draw.tint, [1.0, 1.0, 1.0, 0.5]);
    assert_eq!(draw.z, PipelineConfig::default().z_order);

    // Sample (0, 0) sits at height 15 (granite); sample (5, 0) at 20 (basalt).
    assert_eq!(overlay.hover_label(160, 160).as_deref(), Some("game:rock-granite"));
    assert_eq!(overlay.hover_label(165, 160).as_deref(), Some("game:rock-basalt"));
    assert_eq!(overlay.hover_label(0, 0), None);
}

#[test]
fn shutdown_flushes_and_disposes_once() {
    let fixture = fixture();
    let db = test_db("shutdown");
    let mut overlay = fixture.overlay(PipelineConfig::default(), &db);
    let coords = [TileCoord::new(0, 0), TileCoord::new(9, 9)];
    for coord in coords {
        fixture.terrain.insert_tile(coord, ramp_heights(6, 6));
    }
    overlay.on_viewport_changed(&coords, &[]);
    pump(&mut overlay);
    assert_eq!(overlay.renderer().live_textures(), 2);

    overlay.shutdown();
    overlay.shutdown();
    assert!(overlay.is_shut_down());
    assert_eq!(overlay.stored_tiles(), 2);
    assert_eq!(overlay.renderer().disposes, 2);
    assert_eq!(overlay.renderer().stale_disposes, 0);
    assert_eq!(overlay.tick_foreground(SWEEP).consumed, 0);
}

#[test]
fn background_thread_feeds_the_foreground() {
    let fixture = fixture();
    let db = test_db("thread");
    let config = PipelineConfig {
        background_period: Duration::from_millis(10),
        ..PipelineConfig::default()
    };
    let mut overlay = fixture.overlay(config, &db);
    let coord = TileCoord::new(-1, -1);
    fixture.terrain.insert_tile(coord, ramp_heights(8, 5));
    overlay.spawn_background().expect("spawn background thread");
    overlay.on_viewport_changed(&[coord], &[]);

    for _ in 0..300 {
        std::thread::sleep(Duration::from_millis(10));
        overlay.tick_foreground(FRAME);
        if overlay.cache().is_chunk_set(coord) {
            break;
        }
    }
    assert!(overlay.cache().is_chunk_set(coord));
    overlay.shutdown();
    assert_eq!(overlay.stored_tiles(), 1);
}

/// Raises the shutdown flag as soon as the worker asks for a height map.
struct CancelOnFirstLookup {
    inner: Arc<LayeredTerrain>,
    shutdown: Arc<AtomicBool>,
}

impl TerrainSource for CancelOnFirstLookup {
    fn is_valid_tile(&self, coord: TileCoord) -> bool {
        self.inner.is_valid_tile(coord)
    }

    fn height_map(&self, coord: TileCoord) -> Option<HeightMap> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.inner.height_map(coord)
    }

    fn column_count(&self) -> usize {
        self.inner.column_count()
    }

    fn column(&self, coord: TileCoord, vertical_index: usize) -> Option<Column> {
        self.inner.column(coord, vertical_index)
    }
}

#[test]
fn shutdown_mid_batch_requeues_the_rest_in_order() {
    let fixture = fixture();
    let db = test_db("cancel");
    let coords = [
        TileCoord::new(0, 0),
        TileCoord::new(1, 0),
        TileCoord::new(2, 0),
        TileCoord::new(3, 0),
    ];
    for coord in coords {
        fixture.terrain.insert_tile(coord, ramp_heights(12, 6));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let terrain = Arc::new(CancelOnFirstLookup {
        inner: fixture.terrain.clone(),
        shutdown: shutdown.clone(),
    });
    let classifier = ColorClassifier::new(&OverlayConfig::default(), &fixture.materials);
    let generator = TileGenerator::new(classifier.palette(&fixture.materials));
    let queue = Arc::new(GenerationQueue::new());
    queue.enqueue_many(coords);
    let (sender, ready) = ready_channel();
    let mut worker = BackgroundWorker::new(
        terrain,
        generator,
        TileStore::open(&db, StoreOptions::default()).expect("open store"),
        PendingWrites::new(100, Duration::from_secs(4)),
        queue.clone(),
        sender,
        shutdown.clone(),
        BACKGROUND_STEP,
    );

    let report = worker.tick(BACKGROUND_STEP);
    assert_eq!(report.generated, 1);
    assert_eq!(worker.pending_writes(), 1);

    let sent = drain_ready(&ready, 10);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].coord, coords[0]);
    assert_eq!(
        queue.drain_up_to(usize::MAX, &AtomicBool::new(false)),
        coords[1..].to_vec()
    );
}

#[test]
fn manual_background_ticks_are_ignored_while_the_thread_runs() {
    let fixture = fixture();
    let db = test_db("manual-tick");
    let config = PipelineConfig {
        background_period: Duration::from_millis(50),
        ..PipelineConfig::default()
    };
    let mut overlay = fixture.overlay(config, &db);
    let coord = TileCoord::new(2, 2);
    fixture.terrain.insert_tile(coord, ramp_heights(8, 5));
    overlay.on_viewport_changed(&[coord], &[]);
    overlay.spawn_background().expect("spawn background thread");

    assert_eq!(
        overlay.tick_background(Duration::from_secs(10)),
        BackgroundReport::default()
    );
    overlay.shutdown();
}

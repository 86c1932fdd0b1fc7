use clap::{Parser, Subcommand};
use geology_map::config::{load_or_init_config, OverlayConfig, PipelineConfig, StoreOptions};
use geology_map::coords::{TileCoord, TILE_SIZE};
use geology_map::overlay::GeologyOverlay;
use geology_map::render::{HeadlessRenderer, MapView};
use geology_map::store::TileStore;
use geology_map::testkit::{ramp_heights, sample_materials, LayeredTerrain};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const FRAME: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(
    name = "geomap",
    about = "Generate, inspect and maintain geology map tile stores"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tile pipeline against a synthetic world
    Simulate {
        /// Tile store file (created if missing)
        #[arg(long)]
        db: PathBuf,
        /// Visible tiles around the origin, in tiles
        #[arg(long, default_value_t = 4)]
        radius: i32,
        /// Foreground frames to run
        #[arg(long, default_value_t = 120)]
        frames: u32,
        /// Overlay opacity
        #[arg(long, default_value_t = 1.0)]
        alpha: f32,
    },
    /// Print tile store statistics
    Inspect {
        #[arg(long)]
        db: PathBuf,
        /// Verify every record checksum
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
    /// Delete every tile in a store
    Purge {
        #[arg(long)]
        db: PathBuf,
    },
    /// Print the effective overlay config, writing defaults if absent
    Config {
        #[arg(long)]
        path: PathBuf,
    },
}

fn open_error(error: geology_map::StoreOpenError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

fn square(radius: i32, offset_x: i32) -> Vec<TileCoord> {
    let mut tiles = Vec::new();
    for z in -radius..=radius {
        for x in -radius..=radius {
            tiles.push(TileCoord::new(x + offset_x, z));
        }
    }
    tiles
}

fn simulate(db: &Path, radius: i32, frames: u32, alpha: f32) -> io::Result<()> {
    let radius = radius.max(0);
    let (materials, ids) = sample_materials();
    let extent = radius + 2;
    let terrain = Arc::new(
        LayeredTerrain::new(2)
            .with_layer(1..18, ids.granite)
            .with_layer(18..26, ids.suevite)
            .with_layer(26..34, ids.basalt)
            .with_layer(34..38, ids.soil)
            .with_bounds(
                TileCoord::new(-extent, -extent),
                TileCoord::new(extent, extent),
            ),
    );
    for coord in square(extent, 0) {
        let base = 8 + (coord.x * 7 + coord.z * 3).rem_euclid(20);
        terrain.insert_tile(coord, ramp_heights(base, 12));
    }

    let overlay_config = OverlayConfig {
        overlay_alpha: alpha,
        ..OverlayConfig::default()
    };
    let mut overlay = GeologyOverlay::new(
        terrain,
        &materials,
        &overlay_config,
        PipelineConfig::default(),
        db,
        StoreOptions::default(),
        HeadlessRenderer::new(),
    )
    .map_err(open_error)?;
    overlay.spawn_background()?;

    let mut visible = square(radius, 0);
    overlay.on_viewport_changed(&visible, &[]);
    let side_px = ((2 * radius + 1) as usize * TILE_SIZE) as u32;
    let mut view = MapView::new(
        f64::from(-radius * TILE_SIZE as i32),
        f64::from(-radius * TILE_SIZE as i32),
        1.0,
        side_px,
        side_px,
    );

    let mut consumed = 0usize;
    let mut evicted = 0usize;
    let mut draws = 0usize;
    for frame in 0..frames {
        if frame == frames / 2 {
            // Pan one tile east.
            let next = square(radius, 1);
            let hidden: Vec<TileCoord> =
                visible.iter().copied().filter(|c| !next.contains(c)).collect();
            let shown: Vec<TileCoord> =
                next.iter().copied().filter(|c| !visible.contains(c)).collect();
            overlay.on_viewport_changed(&shown, &hidden);
            view.origin_x += TILE_SIZE as f64;
            visible = next;
        }
        std::thread::sleep(FRAME);
        let report = overlay.tick_foreground(FRAME);
        consumed += report.consumed;
        evicted += report.evicted_groups;
        overlay.renderer_mut().begin_frame();
        draws = overlay.render(&view);
    }

    let probe = overlay.hover_label(0, 0);
    let resident = overlay.cache().len();
    let set_tiles = visible
        .iter()
        .filter(|&&coord| overlay.cache().is_chunk_set(coord))
        .count();
    overlay.shutdown();

    println!("Simulated {} frames over {} visible tiles", frames, visible.len());
    println!("  tiles consumed:    {}", consumed);
    println!("  visible tiles set: {}/{}", set_tiles, visible.len());
    println!("  resident groups:   {}", resident);
    println!("  evicted groups:    {}", evicted);
    println!("  draws last frame:  {}", draws);
    println!(
        "  texture uploads:   {} ({} disposed)",
        overlay.renderer().uploads,
        overlay.renderer().disposes
    );
    println!("  stored tiles:      {}", overlay.stored_tiles());
    println!("  rock at origin:    {}", probe.as_deref().unwrap_or("-"));
    Ok(())
}

fn inspect(db: &Path, verify: bool) -> io::Result<()> {
    let options = StoreOptions {
        integrity_check: verify,
        ..StoreOptions::read_only()
    };
    let store = TileStore::open(db, options).map_err(open_error)?;
    let coords = store.coords();
    println!("Store: {}", store.path().display());
    println!("  tiles:      {}", store.len());
    println!("  file bytes: {}", store.file_len());
    println!("  dead bytes: {}", store.dead_bytes());
    if let (Some(first), Some(last)) = (coords.first(), coords.last()) {
        let min_z = coords.iter().map(|c| c.z).min().unwrap_or(first.z);
        let max_z = coords.iter().map(|c| c.z).max().unwrap_or(last.z);
        println!(
            "  tile bounds: x {}..={}, z {}..={}",
            first.x, last.x, min_z, max_z
        );
    }
    Ok(())
}

fn purge(db: &Path) -> io::Result<()> {
    let mut store = TileStore::open(db, StoreOptions::default()).map_err(open_error)?;
    let purged = store.len();
    store.purge()?;
    println!("Purged {} tiles from {}", purged, db.display());
    Ok(())
}

fn show_config(path: &Path) -> io::Result<()> {
    let config = load_or_init_config(path);
    let json = serde_json::to_string_pretty(&config)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    println!("{json}");
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Simulate {
            db,
            radius,
            frames,
            alpha,
        } => simulate(&db, radius, frames, alpha),
        Command::Inspect { db, verify } => inspect(&db, verify),
        Command::Purge { db } => purge(&db),
        Command::Config { path } => show_config(&path),
    };

    if let Err(err) = result {
        exit_with_error(err);
    }
}

fn exit_with_error(err: io::Error) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(1);
}

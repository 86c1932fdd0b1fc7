//! Geology overlay for a 2-D world map.
//!
//! Tiles of 32x32 surface samples are colored by the rock type under each
//! column, persisted in a single-file store, and drawn as 3x3-tile groups
//! that expire once they leave the screen.

pub mod cache;
pub mod classify;
pub mod config;
pub mod coords;
pub mod generator;
pub mod overlay;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod store;
pub mod terrain;
pub mod testkit;
pub mod tile;
pub mod viewport;

pub use config::{OverlayConfig, PipelineConfig, StoreOptions};
pub use coords::{GroupCoord, TileCoord};
pub use overlay::GeologyOverlay;
pub use render::{MapView, TextureHandle, TileRenderer};
pub use store::{StoreOpenError, TileStore};
pub use terrain::{Material, MaterialKind, MaterialTable, TerrainSource};
pub use tile::TilePixels;

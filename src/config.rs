use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAPS_DIR: &str = "Maps";
const DEFAULT_IGNORED_ROCK: &str = "game:rock-suevite";

/// User-facing classification settings, persisted as JSON.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlayConfig {
    pub overlay_alpha: f32,
    /// Material code -> `#RRGGBB`.
    pub rock_code_colors: BTreeMap<String, String>,
    pub ignored_rocks: BTreeSet<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            overlay_alpha: 1.0,
            rock_code_colors: BTreeMap::new(),
            ignored_rocks: BTreeSet::from([DEFAULT_IGNORED_ROCK.to_string()]),
        }
    }
}

impl OverlayConfig {
    pub fn sanitized(mut self) -> Self {
        self.overlay_alpha = if self.overlay_alpha.is_finite() {
            self.overlay_alpha.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.rock_code_colors = self
            .rock_code_colors
            .into_iter()
            .map(|(code, color)| (code.trim().to_string(), color.trim().to_string()))
            .filter(|(code, _)| !code.is_empty())
            .collect();
        self.ignored_rocks = self
            .ignored_rocks
            .into_iter()
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
            .collect();
        self
    }
}

/// Tunables of the tile pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Sweeps a hidden or empty group survives before eviction.
    pub max_ttl: u32,
    /// Ready tiles consumed per foreground tick.
    pub ready_drain_cap: usize,
    pub background_period: Duration,
    pub sweep_interval: Duration,
    /// Pending writes are flushed once their count exceeds this.
    pub flush_pending_threshold: usize,
    pub flush_interval: Duration,
    pub z_order: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_ttl: 15,
            ready_drain_cap: 200,
            background_period: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(1),
            flush_pending_threshold: 100,
            flush_interval: Duration::from_secs(4),
            z_order: 50.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOptions {
    pub require_write_access: bool,
    /// Sync every batch to disk and recover from a torn trailing record.
    pub corruption_protection: bool,
    /// Verify every record checksum while opening.
    pub integrity_check: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            require_write_access: true,
            corruption_protection: true,
            integrity_check: false,
        }
    }
}

impl StoreOptions {
    pub fn read_only() -> Self {
        Self {
            require_write_access: false,
            corruption_protection: false,
            integrity_check: false,
        }
    }
}

/// `<data_dir>/Maps/<save_id>-geology.db`; the directory is created.
pub fn store_file_path(data_dir: &Path, save_id: &str) -> io::Result<PathBuf> {
    let maps = data_dir.join(MAPS_DIR);
    std::fs::create_dir_all(&maps)?;
    Ok(maps.join(format!("{save_id}-geology.db")))
}

pub fn load_config(path: &Path) -> Option<OverlayConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            if error.kind() != io::ErrorKind::NotFound {
                log::error!("Could not read config {}: {}", path.display(), error);
            }
            return None;
        }
    };

    match serde_json::from_str::<OverlayConfig>(&raw) {
        Ok(config) => Some(config.sanitized()),
        Err(error) => {
            log::error!(
                "Could not parse config {}: {} (loading default settings instead)",
                path.display(),
                error
            );
            None
        }
    }
}

pub fn save_config(path: &Path, config: &OverlayConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let bytes = serde_json::to_vec_pretty(config)
        .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
    std::fs::write(path, bytes)
}

/// Loads the config, falling back to defaults, and writes the effective
/// config back so a fresh install gets an editable file.
pub fn load_or_init_config(path: &Path) -> OverlayConfig {
    let config = load_config(path).unwrap_or_default();
    if let Err(error) = save_config(path, &config) {
        log::warn!("Could not store config {}: {}", path.display(), error);
    }
    config
}

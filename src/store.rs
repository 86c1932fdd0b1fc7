//! Single-file persistent tile store.
//!
//! The file is an append-only log of checksummed records. The newest record
//! for a coordinate wins; an in-memory index built while opening maps each
//! coordinate to its live record. Superseded records are reclaimed by
//! rewriting the file once they outweigh the live ones.

use crate::config::StoreOptions;
use crate::coords::{TileCoord, TILE_AREA};
use crate::tile::{PersistedTile, TilePixels};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILE_MAGIC: &[u8; 4] = b"GMDB";
const FILE_VERSION: u32 = 1;
const FILE_HEADER_LEN: u64 = 4 + 4;
const RECORD_MAGIC: &[u8; 4] = b"TILE";
const RECORD_HEADER_LEN: u64 = 4 + 4 + 4 + 4 + 4;
const COMPACT_MIN_DEAD_BYTES: u64 = 1024 * 1024;
/// Largest postcard encoding of a full tile: length prefix plus one
/// five-byte varint per pixel.
const MAX_RECORD_PAYLOAD_LEN: u32 = 3 + 5 * TILE_AREA as u32;

#[derive(Serialize)]
struct TileRecordRef<'a> {
    pixels: &'a [u32],
}

#[derive(Deserialize)]
struct TileRecord {
    pixels: Vec<u32>,
}

/// The store could not be opened. Fatal for the overlay.
#[derive(Debug)]
pub enum StoreOpenError {
    Io { path: PathBuf, source: io::Error },
    Corrupted { path: PathBuf, reason: String },
}

impl StoreOpenError {
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. } | Self::Corrupted { path, .. } => path,
        }
    }
}

impl fmt::Display for StoreOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(
                f,
                "cannot open {} ({source}), possibly corrupted. Fix it manually or delete this file to continue",
                path.display()
            ),
            Self::Corrupted { path, reason } => write!(
                f,
                "cannot open {} ({reason}), possibly corrupted. Fix it manually or delete this file to continue",
                path.display()
            ),
        }
    }
}

impl std::error::Error for StoreOpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Corrupted { .. } => None,
        }
    }
}

/// A single persisted tile could not be decoded. Treated as a cache miss.
#[derive(Debug)]
pub enum RecordError {
    Io(io::Error),
    BadMagic { offset: u64 },
    KeyMismatch { expected: TileCoord, found: TileCoord },
    ChecksumMismatch { offset: u64 },
    Decode(String),
    WrongLength(usize),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "read failed: {error}"),
            Self::BadMagic { offset } => write!(f, "invalid record magic at offset {offset}"),
            Self::KeyMismatch { expected, found } => write!(
                f,
                "record key mismatch: expected {}/{} found {}/{}",
                expected.x, expected.z, found.x, found.z
            ),
            Self::ChecksumMismatch { offset } => {
                write!(f, "record checksum mismatch at offset {offset}")
            }
            Self::Decode(message) => write!(f, "record decode failed: {message}"),
            Self::WrongLength(len) => write!(f, "record holds {len} pixels"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<io::Error> for RecordError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct RecordRef {
    offset: u64,
    payload_len: u32,
    payload_crc32: u32,
}

impl RecordRef {
    fn record_len(&self) -> u64 {
        RECORD_HEADER_LEN + u64::from(self.payload_len)
    }
}

struct RecordHeader {
    coord: TileCoord,
    payload_len: u32,
    payload_crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN as usize] {
        let mut out = [0u8; RECORD_HEADER_LEN as usize];
        out[0..4].copy_from_slice(RECORD_MAGIC);
        out[4..8].copy_from_slice(&self.coord.x.to_le_bytes());
        out[8..12].copy_from_slice(&self.coord.z.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16..20].copy_from_slice(&self.payload_crc32.to_le_bytes());
        out
    }

    /// `None` when the magic does not match.
    fn decode(raw: &[u8; RECORD_HEADER_LEN as usize]) -> Option<Self> {
        if &raw[0..4] != RECORD_MAGIC {
            return None;
        }
        let word = |at: usize| [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];
        Some(Self {
            coord: TileCoord::new(i32::from_le_bytes(word(4)), i32::from_le_bytes(word(8))),
            payload_len: u32::from_le_bytes(word(12)),
            payload_crc32: u32::from_le_bytes(word(16)),
        })
    }
}

struct ScanOutcome {
    index: HashMap<TileCoord, RecordRef>,
    dead_bytes: u64,
    /// End of the last complete record.
    valid_len: u64,
    torn_tail: Option<String>,
}

pub struct TileStore {
    path: PathBuf,
    file: File,
    options: StoreOptions,
    index: HashMap<TileCoord, RecordRef>,
    file_len: u64,
    dead_bytes: u64,
}

impl TileStore {
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreOpenError> {
        log::info!("Loading tile cache db {}...", path.display());
        let io_error = |source: io::Error| StoreOpenError::Io {
            path: path.to_path_buf(),
            source,
        };
        let corrupted = |reason: String| StoreOpenError::Corrupted {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = if options.require_write_access {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(io_error)?;
                }
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
        } else {
            OpenOptions::new().read(true).open(path)
        }
        .map_err(io_error)?;

        let mut file_len = file.metadata().map_err(io_error)?.len();
        if file_len == 0 {
            if !options.require_write_access {
                return Err(corrupted("empty store file".to_string()));
            }
            write_file_header(&mut file).map_err(io_error)?;
            file_len = FILE_HEADER_LEN;
        }

        let scan = scan_records(&mut file, file_len, options.integrity_check).map_err(|error| {
            if error.kind() == io::ErrorKind::InvalidData {
                corrupted(error.to_string())
            } else {
                io_error(error)
            }
        })?;

        if let Some(reason) = scan.torn_tail {
            if !options.corruption_protection {
                return Err(corrupted(reason));
            }
            if options.require_write_access {
                log::warn!(
                    "Tile cache db {}: {}; truncating {} trailing bytes",
                    path.display(),
                    reason,
                    file_len - scan.valid_len
                );
                file.set_len(scan.valid_len).map_err(io_error)?;
                file.sync_all().map_err(io_error)?;
                file_len = scan.valid_len;
            } else {
                log::warn!(
                    "Tile cache db {}: {}; ignoring trailing bytes",
                    path.display(),
                    reason
                );
            }
        }

        log::info!(
            "Tile cache db {} ready: {} tiles, {} bytes",
            path.display(),
            scan.index.len(),
            file_len
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            options,
            index: scan.index,
            file_len: scan.valid_len.min(file_len).max(FILE_HEADER_LEN),
            dead_bytes: scan.dead_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        self.index.contains_key(&coord)
    }

    pub fn coords(&self) -> Vec<TileCoord> {
        let mut coords: Vec<TileCoord> = self.index.keys().copied().collect();
        coords.sort_unstable();
        coords
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Bytes held by superseded records.
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    /// Unreadable records are logged and reported as absent.
    pub fn get_tile(&mut self, coord: TileCoord) -> Option<PersistedTile> {
        let record = *self.index.get(&coord)?;
        match self.read_record(coord, record) {
            Ok(pixels) => Some(PersistedTile { coord, pixels }),
            Err(error) => {
                log::warn!(
                    "Failed loading map db section {}/{}: {}. Will ignore.",
                    coord.x,
                    coord.z,
                    error
                );
                None
            }
        }
    }

    fn read_record(&mut self, coord: TileCoord, record: RecordRef) -> Result<TilePixels, RecordError> {
        self.file.seek(SeekFrom::Start(record.offset))?;
        let mut raw_header = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact(&mut raw_header)?;
        let header = RecordHeader::decode(&raw_header).ok_or(RecordError::BadMagic {
            offset: record.offset,
        })?;
        if header.coord != coord {
            return Err(RecordError::KeyMismatch {
                expected: coord,
                found: header.coord,
            });
        }
        if header.payload_len != record.payload_len || header.payload_crc32 != record.payload_crc32
        {
            return Err(RecordError::ChecksumMismatch {
                offset: record.offset,
            });
        }

        let mut payload = vec![0u8; record.payload_len as usize];
        self.file.read_exact(&mut payload)?;
        if crc32(&payload) != record.payload_crc32 {
            return Err(RecordError::ChecksumMismatch {
                offset: record.offset,
            });
        }
        let decoded: TileRecord =
            postcard::from_bytes(&payload).map_err(|error| RecordError::Decode(error.to_string()))?;
        TilePixels::from_slice(&decoded.pixels).ok_or(RecordError::WrongLength(decoded.pixels.len()))
    }

    /// Writes every tile of `batch`, replacing earlier records of the same
    /// coordinates.
    pub fn set_tiles(&mut self, batch: &HashMap<TileCoord, TilePixels>) -> io::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.ensure_writable()?;

        let mut coords: Vec<TileCoord> = batch.keys().copied().collect();
        coords.sort_unstable();

        let mut encoded = Vec::new();
        let mut written = Vec::with_capacity(coords.len());
        let mut offset = self.file_len;
        for coord in coords {
            let pixels = &batch[&coord];
            let payload = postcard::to_stdvec(&TileRecordRef {
                pixels: pixels.as_slice(),
            })
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
            let payload_len = u32::try_from(payload.len()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("tile record too large: {} bytes", payload.len()),
                )
            })?;
            let header = RecordHeader {
                coord,
                payload_len,
                payload_crc32: crc32(&payload),
            };
            encoded.extend_from_slice(&header.encode());
            encoded.extend_from_slice(&payload);
            let record = RecordRef {
                offset,
                payload_len,
                payload_crc32: header.payload_crc32,
            };
            offset += record.record_len();
            written.push((coord, record));
        }

        if let Err(error) = self.append(&encoded) {
            // Drop whatever part of the batch made it to disk.
            if let Err(rollback) = self.file.set_len(self.file_len) {
                log::error!(
                    "Failed rolling back partial write to {}: {}",
                    self.path.display(),
                    rollback
                );
            }
            return Err(error);
        }

        for (coord, record) in written {
            if let Some(previous) = self.index.insert(coord, record) {
                self.dead_bytes += previous.record_len();
            }
        }
        self.file_len = offset;
        log::debug!(
            "Stored {} tiles in {} ({} live, {} dead bytes)",
            batch.len(),
            self.path.display(),
            self.index.len(),
            self.dead_bytes
        );

        if self.dead_bytes >= COMPACT_MIN_DEAD_BYTES && self.dead_bytes > self.live_bytes() {
            // The batch is durable; a failed compaction is retried on the next write.
            if let Err(error) = self.compact() {
                log::error!("Failed compacting {}: {}", self.path.display(), error);
            }
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.file_len))?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        if self.options.corruption_protection {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Deletes every persisted tile.
    pub fn purge(&mut self) -> io::Result<()> {
        self.ensure_writable()?;
        self.file.set_len(FILE_HEADER_LEN)?;
        self.file.sync_all()?;
        let purged = self.index.len();
        self.index.clear();
        self.file_len = FILE_HEADER_LEN;
        self.dead_bytes = 0;
        log::info!("Purged {} tiles from {}", purged, self.path.display());
        Ok(())
    }

    fn live_bytes(&self) -> u64 {
        self.index.values().map(RecordRef::record_len).sum()
    }

    /// Rewrites the file with only the live records.
    pub fn compact(&mut self) -> io::Result<()> {
        self.ensure_writable()?;
        let tmp_path = tmp_path_for(&self.path);
        let mut live: Vec<(TileCoord, RecordRef)> =
            self.index.iter().map(|(&coord, &record)| (coord, record)).collect();
        live.sort_unstable_by_key(|(_, record)| record.offset);

        let mut new_index = HashMap::with_capacity(live.len());
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(FILE_MAGIC)?;
            writer.write_all(&FILE_VERSION.to_le_bytes())?;
            let mut offset = FILE_HEADER_LEN;
            let mut record_bytes = Vec::new();
            for (coord, record) in live {
                record_bytes.resize(record.record_len() as usize, 0);
                self.file.seek(SeekFrom::Start(record.offset))?;
                self.file.read_exact(&mut record_bytes)?;
                writer.write_all(&record_bytes)?;
                new_index.insert(
                    coord,
                    RecordRef {
                        offset,
                        ..record
                    },
                );
                offset += record.record_len();
            }
            writer.flush()?;
            let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let reclaimed = self.dead_bytes;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file_len = self.file.metadata()?.len();
        self.index = new_index;
        self.dead_bytes = 0;
        log::info!(
            "Compacted {}: reclaimed {} bytes, {} tiles live",
            self.path.display(),
            reclaimed,
            self.index.len()
        );
        Ok(())
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.options.require_write_access {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("tile store {} is opened read-only", self.path.display()),
            ))
        }
    }
}

/// Tiles produced since the last flush, written to the store as one batch.
///
/// A flush is due once more than `threshold` tiles are pending or
/// `interval` has elapsed since the previous flush.
#[derive(Debug)]
pub struct PendingWrites {
    tiles: HashMap<TileCoord, TilePixels>,
    since_flush: Duration,
    threshold: usize,
    interval: Duration,
}

impl PendingWrites {
    pub fn new(threshold: usize, interval: Duration) -> Self {
        Self {
            tiles: HashMap::new(),
            since_flush: Duration::ZERO,
            threshold,
            interval,
        }
    }

    pub fn insert(&mut self, coord: TileCoord, pixels: TilePixels) {
        self.tiles.insert(coord, pixels);
    }

    pub fn get(&self, coord: TileCoord) -> Option<&TilePixels> {
        self.tiles.get(&coord)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn advance(&mut self, dt: Duration) {
        self.since_flush = self.since_flush.saturating_add(dt);
    }

    pub fn is_due(&self) -> bool {
        self.tiles.len() > self.threshold || self.since_flush > self.interval
    }

    /// Returns the number of tiles written, or `None` if no flush was due.
    pub fn flush_if_due(&mut self, store: &mut TileStore) -> io::Result<Option<usize>> {
        if !self.is_due() {
            return Ok(None);
        }
        self.flush(store).map(Some)
    }

    /// On failure the tiles stay pending for the next attempt.
    pub fn flush(&mut self, store: &mut TileStore) -> io::Result<usize> {
        self.since_flush = Duration::ZERO;
        if self.tiles.is_empty() {
            return Ok(0);
        }
        store.set_tiles(&self.tiles)?;
        let written = self.tiles.len();
        self.tiles.clear();
        Ok(written)
    }
}

fn write_file_header(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(FILE_MAGIC)?;
    file.write_all(&FILE_VERSION.to_le_bytes())?;
    file.flush()?;
    file.sync_all()
}

fn scan_records(file: &mut File, file_len: u64, verify_checksums: bool) -> io::Result<ScanOutcome> {
    if file_len < FILE_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file too short for header: {file_len} bytes"),
        ));
    }

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    if &header[0..4] != FILE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "store file magic mismatch",
        ));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FILE_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported store file version {version}"),
        ));
    }

    let mut index = HashMap::<TileCoord, RecordRef>::new();
    let mut dead_bytes = 0u64;
    let mut offset = FILE_HEADER_LEN;
    let mut torn_tail = None;
    let mut payload = Vec::new();
    while offset < file_len {
        if file_len - offset < RECORD_HEADER_LEN {
            torn_tail = Some(format!("incomplete record header at offset {offset}"));
            break;
        }
        let mut raw_header = [0u8; RECORD_HEADER_LEN as usize];
        reader.read_exact(&mut raw_header)?;
        let Some(header) = RecordHeader::decode(&raw_header) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid record magic at offset {offset}"),
            ));
        };
        if header.payload_len > MAX_RECORD_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "record for tile {}/{} at offset {offset} claims {} payload bytes",
                    header.coord.x, header.coord.z, header.payload_len
                ),
            ));
        }
        let record = RecordRef {
            offset,
            payload_len: header.payload_len,
            payload_crc32: header.payload_crc32,
        };
        // Only a plausible record running into the end of the file is an
        // interrupted append.
        if offset + record.record_len() > file_len {
            torn_tail = Some(format!("incomplete record payload at offset {offset}"));
            break;
        }

        if verify_checksums {
            payload.resize(header.payload_len as usize, 0);
            reader.read_exact(&mut payload)?;
            if crc32(&payload) != header.payload_crc32 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "integrity check failed for tile {}/{} at offset {offset}",
                        header.coord.x, header.coord.z
                    ),
                ));
            }
        } else {
            reader.seek_relative(i64::from(header.payload_len))?;
        }

        if let Some(previous) = index.insert(header.coord, record) {
            dead_bytes += previous.record_len();
        }
        offset += record.record_len();
    }

    Ok(ScanOutcome {
        index,
        dead_bytes,
        valid_len: offset.min(file_len),
        torn_tail,
    })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

use std::path::PathBuf;

use thiserror::Error;

use crate::merge::TileOverlap;
use crate::model::TileCoord;

pub type Result<T> = std::result::Result<T, MosaicError>;

/// パイプライン全体のエラー。
///
/// Precondition / Consistency / ResourceLimit / Interrupted の区別は
/// 呼び出し側 (CLI の終了コード、再開案内) で使われる。
#[derive(Debug, Error)]
pub enum MosaicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bounds file not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("{path} is missing columns: {missing:?}")]
    ManifestColumns { path: PathBuf, missing: Vec<String> },

    #[error("No valid raster entries available for source '{0}'")]
    EmptySource(String),

    #[error("At least one source collection is required")]
    NoSources,

    #[error("Requested bbox does not overlap source coverage")]
    BboxOutsideCoverage,

    #[error("Requested max zoom {requested} exceeds supported maximum {max}")]
    ZoomOutOfRange { requested: u8, max: u8 },

    #[error("min zoom {min} cannot be larger than max zoom {max}")]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("Output file already exists: {0}. Use overwrite to replace it")]
    OutputExists(PathBuf),

    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Resume requested but intermediate file not found: {0}")]
    ResumeFileMissing(PathBuf),

    #[error("Resume index {index} is out of range for a split pattern of {groups} groups")]
    ResumeOutOfRange { index: usize, groups: usize },

    #[error("Unknown split pattern: {name}. Available patterns: {available}")]
    UnknownSplitPattern { name: String, available: String },

    #[error("Invalid split pattern: {0}")]
    InvalidSplitPattern(String),

    #[error("Tile overlaps detected:\n{}", format_overlaps(.0))]
    DuplicateTiles(Vec<TileOverlap>),

    #[error("Tile id {tile_id} is not greater than the previously written id {previous}")]
    TileOrder { tile_id: u64, previous: u64 },

    #[error("Tile {0} lies outside the tile grid")]
    TileOutOfRange(TileCoord),

    #[error("Tile z{z}/x{x}/y{y} was spooled more than once")]
    DuplicateSpoolTile { z: u8, x: u32, y: u32 },

    #[error("Group {index} ({name}) exceeded its {breach}; resume from group {index}")]
    ResourceLimit {
        index: usize,
        name: String,
        breach: String,
    },

    #[error("Group {index} ({name}) failed: {reason}; resume from group {index}")]
    GroupFailed {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("Interrupted by user")]
    Interrupted,

    #[error("Malformed archive {path}: {reason}")]
    MalformedArchive { path: PathBuf, reason: String },
}

impl MosaicError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, MosaicError::Interrupted)
    }
}

fn format_overlaps(overlaps: &[TileOverlap]) -> String {
    overlaps
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// 候補ソース単位・タイル単位で回復可能な失敗。
///
/// 警告としてログに出し、そのアイテムだけをスキップする。実行全体を失敗させない。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("no source footprint overlaps the tile")]
    NoCandidates,

    #[error("composited raster has no valid elevation")]
    NoData,

    #[error("failed to read {path}: {message}")]
    ReadFailed { path: PathBuf, message: String },

    #[error("failed to encode tile: {0}")]
    EncodeFailed(String),
}

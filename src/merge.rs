//! 複数の MBTiles を1つに統合する
//!
//! ズーム分割で作った中間ファイルの結合に使う。キーの重複は統合前に検出してエラーにする。

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{MosaicError, Result};
use crate::model::{TileCoord, TileExtent};
use crate::writer::mbtiles::{MbtilesReader, MbtilesWriter, DEFAULT_BATCH_SIZE};
use crate::writer::{finalize_best_effort, ArchiveInfo, DEFAULT_ATTRIBUTION};

/// 2つの入力が同じタイルキーを持っていた
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileOverlap {
    pub coord: TileCoord,
    pub first: PathBuf,
    pub second: PathBuf,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl fmt::Display for TileOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Duplicate tile at {}: found in both {} and {}",
            self.coord,
            display_name(&self.first),
            display_name(&self.second)
        )
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub verify: bool,
    pub overwrite: bool,
    pub batch_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            verify: true,
            overwrite: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub total_tiles: u64,
    pub extent: TileExtent,
    pub attribution: String,
}

/// 全入力のタイルキーを走査し、重複を全て返す
pub fn find_overlapping_tiles(inputs: &[PathBuf]) -> Result<Vec<TileOverlap>> {
    let mut owners: HashMap<(u8, u32, u32), usize> = HashMap::new();
    let mut overlaps = Vec::new();

    for (index, path) in inputs.iter().enumerate() {
        let reader = MbtilesReader::open(path)?;
        info!("Checking {}...", display_name(path));
        reader.for_each_key(|z, column, row| {
            if let Some(&owner) = owners.get(&(z, column, row)) {
                overlaps.push(TileOverlap {
                    coord: TileCoord::from_tms(z, column, row),
                    first: inputs[owner].clone(),
                    second: path.clone(),
                });
            } else {
                owners.insert((z, column, row), index);
            }
        })?;
    }

    if overlaps.is_empty() {
        info!("No overlaps found.");
    } else {
        warn!("Found {} overlap(s)", overlaps.len());
    }
    Ok(overlaps)
}

pub fn verify_no_overlaps(inputs: &[PathBuf]) -> Result<()> {
    let overlaps = find_overlapping_tiles(inputs)?;
    if overlaps.is_empty() {
        Ok(())
    } else {
        Err(MosaicError::DuplicateTiles(overlaps))
    }
}

/// 空白を除いて重複を取り、ソートして " | " で連結する
pub fn combine_attributions<'a, I>(attributions: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let unique: BTreeSet<&str> = attributions
        .into_iter()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();
    if unique.is_empty() {
        None
    } else {
        Some(unique.into_iter().collect::<Vec<_>>().join(" | "))
    }
}

/// 入力の行をそのまま連結する。
///
/// ズーム範囲と範囲は書き込んだ行から計算し直し、attribution は全入力から集める。
/// それ以外のメタデータは先頭の入力に従う。
pub fn merge_mbtiles(
    inputs: &[PathBuf],
    output: &Path,
    options: &MergeOptions,
) -> Result<MergeSummary> {
    for path in inputs {
        if !path.exists() {
            return Err(MosaicError::InputNotFound(path.clone()));
        }
    }
    if output.exists() && !options.overwrite {
        return Err(MosaicError::OutputExists(output.to_path_buf()));
    }

    if options.verify {
        info!("Verifying no overlaps between {} input files...", inputs.len());
        verify_no_overlaps(inputs)?;
    }

    let readers = inputs
        .iter()
        .map(|p| MbtilesReader::open(p))
        .collect::<Result<Vec<_>>>()?;
    let metadata = readers
        .iter()
        .map(|r| r.metadata())
        .collect::<Result<Vec<_>>>()?;

    let fallback_name = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merged".to_string());
    let mut archive_info = match metadata.first() {
        Some(first) => ArchiveInfo::from_metadata(first, &fallback_name),
        None => ArchiveInfo::new(fallback_name),
    };
    let attribution = combine_attributions(
        metadata
            .iter()
            .filter_map(|m| m.get("attribution").map(String::as_str)),
    )
    .unwrap_or_else(|| DEFAULT_ATTRIBUTION.to_string());
    archive_info.attribution = attribution.clone();

    let mut writer = MbtilesWriter::create(output, archive_info, options.overwrite)?
        .with_batch_size(options.batch_size);

    let copied = readers.iter().try_for_each(|reader| -> Result<()> {
        let before = writer.inserted();
        let mut count = 0u64;
        reader.for_each_row(|z, column, row, data| {
            count += 1;
            writer.add_row(z, column, row, data)
        })?;
        writer.flush()?;
        info!(
            "Merged {} tiles from {} (total {})",
            count,
            display_name(reader.path()),
            before + count
        );
        Ok(())
    });
    if let Err(e) = copied {
        finalize_best_effort(writer);
        return Err(e);
    }

    let summary = writer.finalize()?;
    info!(
        "Merge completed: {} ({} tiles)",
        output.display(),
        summary.tiles
    );
    Ok(MergeSummary {
        output: summary.path,
        total_tiles: summary.tiles,
        extent: summary.extent,
        attribution,
    })
}

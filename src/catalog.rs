use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{MosaicError, Result};
use crate::mercator::EARTH_CIRCUMFERENCE;
use crate::model::{Bounds, LngLatBbox, SourceRecord, MAX_SUPPORTED_ZOOM, TILE_SIZE};
use crate::raster::RasterService;

/// 各ソースディレクトリに置かれるフットプリント一覧
pub const MANIFEST_FILE: &str = "bounds.csv";

pub const MANIFEST_COLUMNS: [&str; 7] = [
    "filename", "left", "bottom", "right", "top", "width", "height",
];

/// bounds.csv を解析してレコードを返す。
///
/// 単純なカンマ区切りのみ対応し、引用符付きのフィールドは扱わない。
/// 列数がヘッダーと合わない行、ファイルが存在しない行、数値が読めない行、
/// 非有限値を含む行は警告を出して捨てる。
pub fn parse_manifest<R: BufRead>(
    reader: R,
    manifest_path: &Path,
    base_dir: &Path,
    source: &str,
    priority: usize,
) -> Result<Vec<SourceRecord>> {
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => line?,
        None => String::new(),
    };
    let columns: Vec<String> = header
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();

    let missing: Vec<String> = MANIFEST_COLUMNS
        .iter()
        .filter(|name| !columns.iter().any(|c| c == *name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(MosaicError::ManifestColumns {
            path: manifest_path.to_path_buf(),
            missing,
        });
    }

    // ヘッダーの順序に依存しないよう列番号を引いておく
    let index_of = |name: &str| columns.iter().position(|c| c == name).unwrap_or(0);
    let idx = MANIFEST_COLUMNS.map(index_of);

    let mut records = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            warn!(
                "{}:{}: expected {} fields but found {} (quoted filenames are not supported), skipping",
                manifest_path.display(),
                line_no + 2,
                columns.len(),
                fields.len()
            );
            continue;
        }
        let field = |i: usize| fields.get(idx[i]).copied().unwrap_or("");

        let filename = field(0);
        if filename.is_empty() {
            warn!(
                "{}:{}: empty filename, skipping",
                manifest_path.display(),
                line_no + 2
            );
            continue;
        }

        let parsed = (|| -> Option<(Bounds, usize, usize)> {
            let left = field(1).parse::<f64>().ok()?;
            let bottom = field(2).parse::<f64>().ok()?;
            let right = field(3).parse::<f64>().ok()?;
            let top = field(4).parse::<f64>().ok()?;
            let width = parse_dimension(field(5))?;
            let height = parse_dimension(field(6))?;
            let bounds = Bounds::new(left, bottom, right, top);
            bounds.is_finite().then_some((bounds, width, height))
        })();

        let Some((bounds, width, height)) = parsed else {
            warn!(
                "{}:{}: invalid bounds for {}, skipping",
                manifest_path.display(),
                line_no + 2,
                filename
            );
            continue;
        };

        let path = base_dir.join(filename);
        if !path.exists() {
            warn!("Raster listed in manifest not found: {}", path.display());
            continue;
        }

        records.push(SourceRecord::new(
            path, bounds, width, height, source, priority,
        ));
    }

    Ok(records)
}

fn parse_dimension(value: &str) -> Option<usize> {
    // "512.0" のような書き方も受け付ける
    if let Ok(v) = value.parse::<usize>() {
        return (v > 0).then_some(v);
    }
    let v = value.parse::<f64>().ok()?;
    (v.is_finite() && v >= 1.0).then_some(v as usize)
}

/// `<dir>/bounds.csv` を読み込む
pub fn load_manifest(dir: &Path, source: &str, priority: usize) -> Result<Vec<SourceRecord>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(MosaicError::ManifestNotFound(manifest_path));
    }

    let file = fs::File::open(&manifest_path)?;
    let records = parse_manifest(
        BufReader::new(file),
        &manifest_path,
        dir,
        source,
        priority,
    )?;
    debug!(
        "Loaded {} records from {}",
        records.len(),
        manifest_path.display()
    );
    Ok(records)
}

/// `<store_root>/<name>/bounds.csv` を並列に読み込み、優先度順に連結する。
///
/// 優先度は引数の並び順 (先頭が 0)。
pub fn build_records_from_sources(store_root: &Path, names: &[String]) -> Result<Vec<SourceRecord>> {
    if names.is_empty() {
        return Err(MosaicError::NoSources);
    }

    let per_source: Vec<Result<Vec<SourceRecord>>> = names
        .par_iter()
        .enumerate()
        .map(|(priority, name)| {
            let records = load_manifest(&store_root.join(name), name, priority)?;
            if records.is_empty() {
                return Err(MosaicError::EmptySource(name.clone()));
            }
            Ok(records)
        })
        .collect();

    let mut records = Vec::new();
    for (name, result) in names.iter().zip(per_source) {
        let loaded = result?;
        info!("Source '{}': {} rasters", name, loaded.len());
        records.extend(loaded);
    }

    Ok(records)
}

/// ピクセルサイズ (m) から、タイル解像度がそれを下回らない最大ズームを推定する。
pub fn recommended_max_zoom(pixel_size: f64) -> u8 {
    if !pixel_size.is_finite() || pixel_size <= 0.0 {
        return MAX_SUPPORTED_ZOOM;
    }
    let zoom_zero_resolution = EARTH_CIRCUMFERENCE / TILE_SIZE as f64;
    let zoom = (zoom_zero_resolution / pixel_size).log2().ceil();
    zoom.clamp(0.0, MAX_SUPPORTED_ZOOM as f64) as u8
}

/// 指定があればそれを、なければ最も細かいソースから最大ズームを決める。
pub fn compute_max_zoom(records: &[SourceRecord], user_max_zoom: Option<u8>) -> Result<u8> {
    if let Some(zoom) = user_max_zoom {
        if zoom > MAX_SUPPORTED_ZOOM {
            return Err(MosaicError::ZoomOutOfRange {
                requested: zoom,
                max: MAX_SUPPORTED_ZOOM,
            });
        }
        return Ok(zoom);
    }

    let finest = records
        .iter()
        .map(|r| r.pixel_size)
        .filter(|p| p.is_finite() && *p > 0.0)
        .fold(f64::INFINITY, f64::min);
    Ok(recommended_max_zoom(finest))
}

/// 全フットプリントの和集合 (メートル)
pub fn union_bounds(records: &[SourceRecord]) -> Option<Bounds> {
    records
        .iter()
        .map(|r| r.bounds)
        .reduce(|acc, b| acc.union(&b))
}

/// 要求 bbox とソース範囲の共通部分 (経緯度)。bbox 省略時はソース範囲全体。
pub fn coverage_bbox(records: &[SourceRecord], bbox: Option<LngLatBbox>) -> Result<LngLatBbox> {
    let union = union_bounds(records).ok_or(MosaicError::NoSources)?;
    let coverage = union.to_lnglat();
    match bbox {
        None => Ok(coverage),
        Some(requested) => requested
            .intersection(&coverage)
            .ok_or(MosaicError::BboxOutsideCoverage),
    }
}

/// ディレクトリ内の GeoTIFF から bounds.csv を生成する。戻り値は書き出した行数。
pub fn write_manifest(dir: &Path, service: &dyn RasterService) -> Result<usize> {
    let mut rasters: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "tif" | "tiff"))
                .unwrap_or(false)
        })
        .collect();
    rasters.sort();

    let manifest_path = dir.join(MANIFEST_FILE);
    let mut out = std::io::BufWriter::new(fs::File::create(&manifest_path)?);
    writeln!(out, "{}", MANIFEST_COLUMNS.join(","))?;

    let mut written = 0;
    for path in &rasters {
        let footprint = match service.footprint(path) {
            Ok(f) => f,
            Err(reason) => {
                warn!("Skipping {}: {}", path.display(), reason);
                continue;
            }
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains(',') {
            warn!("Skipping {}: file names containing ',' cannot be listed", path.display());
            continue;
        }
        let b = footprint.bounds;
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            name, b.left, b.bottom, b.right, b.top, footprint.width, footprint.height
        )?;
        written += 1;
    }
    out.flush()?;

    info!(
        "Wrote {} entries to {}",
        written,
        manifest_path.display()
    );
    Ok(written)
}

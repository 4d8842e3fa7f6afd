//! ソース読み込みからアーカイブ書き出しまでの1回分の集約処理

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{build_records_from_sources, compute_max_zoom, coverage_bbox};
use crate::codec::{EncoderEffort, TileFormat};
use crate::compositor::Compositor;
use crate::config::EnvOverrides;
use crate::error::{MosaicError, Result};
use crate::generator::{CancelToken, GenerationStats, GeneratorOptions, TileGenerator};
use crate::index::CandidateIndex;
use crate::model::{LngLatBbox, TILE_SIZE};
use crate::raster::RasterService;
use crate::writer::mbtiles::{DEFAULT_BATCH_SIZE, DEFAULT_CHECKPOINT_INTERVAL};
use crate::writer::spool::write_pmtiles;
use crate::writer::{
    write_tiles, ArchiveInfo, ArchiveSummary, MbtilesWriter, TileSpool, DEFAULT_ATTRIBUTION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Mbtiles,
    Pmtiles,
}

impl OutputKind {
    /// 拡張子で判定する。`.pmtiles` 以外は MBTiles。
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pmtiles") => OutputKind::Pmtiles,
            _ => OutputKind::Mbtiles,
        }
    }
}

/// `<stem>_lineage.mbtiles`
pub fn lineage_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tiles".to_string());
    output.with_file_name(format!("{stem}_lineage.mbtiles"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    /// ソースコレクションのディレクトリを置いたルート
    pub store_root: PathBuf,
    /// 優先度順のソースコレクション名
    pub sources: Vec<String>,
    pub output: PathBuf,
    pub min_zoom: u8,
    /// 省略時は最も細かいソースの解像度から決める
    pub max_zoom: Option<u8>,
    pub bbox: Option<LngLatBbox>,
    pub format: TileFormat,
    pub effort: EncoderEffort,
    pub attribution: String,
    pub lineage: bool,
    pub overwrite: bool,
    /// 既存の MBTiles に追記する
    pub append: bool,
    pub tile_size: usize,
    pub gdal_threads: usize,
    pub progress_interval: u64,
    pub force_progress: bool,
    pub io_sleep_ms: Option<u64>,
    pub batch_size: usize,
    pub checkpoint_interval: u64,
    pub temp_dir: Option<PathBuf>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("."),
            sources: Vec::new(),
            output: PathBuf::from("output.mbtiles"),
            min_zoom: 0,
            max_zoom: None,
            bbox: None,
            format: TileFormat::default(),
            effort: EncoderEffort::default(),
            attribution: DEFAULT_ATTRIBUTION.to_string(),
            lineage: false,
            overwrite: false,
            append: false,
            tile_size: TILE_SIZE,
            gdal_threads: 1,
            progress_interval: 500,
            force_progress: false,
            io_sleep_ms: None,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            temp_dir: None,
        }
    }
}

impl AggregateOptions {
    /// 環境変数の上書きを反映する
    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(effort) = env.encoder_effort {
            self.effort = effort;
        }
        if self.temp_dir.is_none() {
            self.temp_dir = env.temp_dir.clone();
        }
        self.force_progress |= env.force_progress;
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    fn archive_info(&self) -> ArchiveInfo {
        ArchiveInfo::for_path(&self.output)
            .with_format(self.format)
            .with_attribution(self.attribution.clone())
    }

    fn generator_options(&self, max_zoom: u8, bbox: LngLatBbox) -> GeneratorOptions {
        let mut options = GeneratorOptions::new(self.min_zoom, max_zoom, bbox);
        options.tile_size = self.tile_size;
        options.format = self.format;
        options.effort = self.effort;
        options.lineage = self.lineage;
        options.progress_interval = self.progress_interval;
        options.force_progress = self.force_progress;
        options.io_sleep = self.io_sleep_ms.map(Duration::from_millis);
        options
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub output: PathBuf,
    pub tiles: u64,
    pub max_zoom: u8,
    pub bbox: LngLatBbox,
    pub stats: GenerationStats,
    pub lineage: Option<ArchiveSummary>,
}

/// 既存の出力と lineage を、どちらのライターも作る前に確認する
fn check_outputs(options: &AggregateOptions, kind: OutputKind) -> Result<()> {
    if options.overwrite {
        return Ok(());
    }
    let appending = kind == OutputKind::Mbtiles && options.append;
    if !appending && options.output.exists() {
        return Err(MosaicError::OutputExists(options.output.clone()));
    }
    if options.lineage {
        let path = lineage_path(&options.output);
        if path.exists() {
            return Err(MosaicError::OutputExists(path));
        }
    }
    Ok(())
}

/// ソースを読み込み、タイルを生成して出力に書く
pub fn run_aggregate(
    options: &AggregateOptions,
    service: &dyn RasterService,
    cancel: &CancelToken,
) -> Result<AggregateReport> {
    if options.sources.is_empty() {
        return Err(MosaicError::NoSources);
    }
    let kind = OutputKind::for_path(&options.output);
    check_outputs(options, kind)?;

    let records = build_records_from_sources(&options.store_root, &options.sources)?;
    let max_zoom = compute_max_zoom(&records, options.max_zoom)?;
    if options.min_zoom > max_zoom {
        return Err(MosaicError::InvalidZoomRange {
            min: options.min_zoom,
            max: max_zoom,
        });
    }
    let bbox = coverage_bbox(&records, options.bbox)?;
    info!(
        "Aggregating {} rasters from [{}] into {} (z{}-{}, bbox {})",
        records.len(),
        options.sources.join(", "),
        options.output.display(),
        options.min_zoom,
        max_zoom,
        bbox
    );

    let index = CandidateIndex::build(records);
    let compositor = Compositor::new(&index, service, options.tile_size);
    let mut generator = TileGenerator::new(
        compositor,
        options.generator_options(max_zoom, bbox),
        cancel.clone(),
    )?;

    let lineage_writer = if options.lineage {
        let path = lineage_path(&options.output);
        let info = ArchiveInfo::for_path(&path)
            .with_format(TileFormat::Png)
            .with_attribution(options.attribution.clone())
            .with_extra("sources", options.sources.join(","));
        Some(MbtilesWriter::create(&path, info, options.overwrite)?)
    } else {
        None
    };

    let (tiles, lineage) = match kind {
        OutputKind::Mbtiles => {
            let writer = if options.append {
                MbtilesWriter::open_append(&options.output, options.archive_info())?
            } else {
                MbtilesWriter::create(&options.output, options.archive_info(), options.overwrite)?
            }
            .with_batch_size(options.batch_size)
            .with_checkpoint_interval(options.checkpoint_interval);
            let (summary, lineage) = write_tiles(generator.by_ref(), writer, lineage_writer)?;
            (summary.tiles, lineage)
        }
        OutputKind::Pmtiles => {
            if options.output.exists() {
                std::fs::remove_file(&options.output)?;
            }
            let spool = TileSpool::new(&options.temp_root())?;
            let (summary, lineage) = write_pmtiles(
                generator.by_ref(),
                spool,
                &options.output,
                &options.archive_info(),
                lineage_writer,
            )?;
            (summary.addressed_tiles, lineage)
        }
    };

    let stats = generator.stats();
    info!(
        "Wrote {} tiles to {} ({} skipped: {} without candidates, {} without data, {} failed)",
        tiles,
        options.output.display(),
        stats.skipped(),
        stats.no_candidates,
        stats.no_data,
        stats.encode_failed
    );

    Ok(AggregateReport {
        output: options.output.clone(),
        tiles,
        max_zoom,
        bbox,
        stats,
        lineage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TileEncoder;
    use crate::lineage::priority_for_color;
    use crate::model::TileCoord;
    use crate::raster::fake::{write_source, ConstantRasterService};
    use crate::terrain_rgb::decode_raster;
    use crate::writer::{MbtilesReader, PmtilesReader};
    use tempfile::TempDir;

    const PRIMARY_TILE: TileCoord = TileCoord { z: 8, x: 100, y: 100 };
    const FALLBACK_TILE: TileCoord = TileCoord { z: 8, x: 101, y: 100 };

    /// dem1a は左のタイルだけ、dem5a は左右両方を覆う
    fn two_source_store(root: &Path) -> ConstantRasterService {
        let left = PRIMARY_TILE.xy_bounds();
        let right = FALLBACK_TILE.xy_bounds();
        write_source(root, "dem1a", &[("primary.tif", left)]);
        write_source(root, "dem5a", &[("fallback.tif", left.union(&right))]);
        ConstantRasterService::new()
            .with_source("dem1a", 96.0)
            .with_source("dem5a", 48.0)
    }

    fn options(root: &Path, output: &str) -> AggregateOptions {
        AggregateOptions {
            store_root: root.to_path_buf(),
            sources: vec!["dem1a".to_string(), "dem5a".to_string()],
            output: root.join(output),
            min_zoom: 8,
            max_zoom: Some(8),
            format: TileFormat::Png,
            tile_size: 8,
            ..AggregateOptions::default()
        }
    }

    fn elevations(bytes: &[u8]) -> Vec<f32> {
        decode_raster(&TileEncoder::decode(bytes).unwrap()).values
    }

    #[test]
    fn test_output_kind() {
        assert_eq!(OutputKind::for_path(Path::new("a.pmtiles")), OutputKind::Pmtiles);
        assert_eq!(OutputKind::for_path(Path::new("a.PMTILES")), OutputKind::Pmtiles);
        assert_eq!(OutputKind::for_path(Path::new("a.mbtiles")), OutputKind::Mbtiles);
        assert_eq!(OutputKind::for_path(Path::new("noext")), OutputKind::Mbtiles);
    }

    #[test]
    fn test_lineage_path() {
        assert_eq!(
            lineage_path(Path::new("/data/japan.pmtiles")),
            PathBuf::from("/data/japan_lineage.mbtiles")
        );
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut options = AggregateOptions::default();
        let env = EnvOverrides {
            encoder_effort: Some(EncoderEffort::Best),
            temp_dir: Some(PathBuf::from("/scratch")),
            force_progress: true,
        };
        options.apply_env(&env);
        assert_eq!(options.effort, EncoderEffort::Best);
        assert_eq!(options.temp_root(), PathBuf::from("/scratch"));
        assert!(options.force_progress);
    }

    #[test]
    fn test_options_json_defaults() {
        let options: AggregateOptions =
            serde_json::from_str(r#"{"sources": ["dem1a"], "max_zoom": 12}"#).unwrap();
        assert_eq!(options.sources, vec!["dem1a".to_string()]);
        assert_eq!(options.max_zoom, Some(12));
        assert_eq!(options.format, TileFormat::Webp);
        assert_eq!(options.batch_size, 1000);
    }

    #[test]
    fn test_primary_wins_and_fallback_fills() {
        let dir = TempDir::new().unwrap();
        let service = two_source_store(dir.path());
        let options = AggregateOptions {
            lineage: true,
            ..options(dir.path(), "japan.mbtiles")
        };

        let report = run_aggregate(&options, &service, &CancelToken::new()).unwrap();
        assert_eq!(report.tiles, 2);
        assert_eq!(report.max_zoom, 8);

        let reader = MbtilesReader::open(&options.output).unwrap();
        let primary = reader.get_tile(PRIMARY_TILE).unwrap().unwrap();
        let fallback = reader.get_tile(FALLBACK_TILE).unwrap().unwrap();
        assert!(elevations(&primary).iter().all(|&v| v == 96.0));
        assert!(elevations(&fallback).iter().all(|&v| v == 48.0));

        let metadata = reader.metadata().unwrap();
        assert_eq!(metadata["format"], "png");
        assert_eq!(metadata["encoding"], "terrarium");

        let lineage = report.lineage.unwrap();
        assert_eq!(lineage.tiles, 2);
        let lineage_reader = MbtilesReader::open(&lineage_path(&options.output)).unwrap();
        let colors = |tile| {
            let bytes = lineage_reader.get_tile(tile).unwrap().unwrap();
            TileEncoder::decode(&bytes).unwrap()
        };
        assert_eq!(colors(PRIMARY_TILE).pixel(0, 0), (0, 100, 0));
        assert_eq!(colors(FALLBACK_TILE).pixel(7, 7), (50, 205, 50));
        assert_eq!(priority_for_color(colors(FALLBACK_TILE).pixel(3, 3)), Some(1));
    }

    #[test]
    fn test_pmtiles_output() {
        let dir = TempDir::new().unwrap();
        let service = two_source_store(dir.path());
        let options = options(dir.path(), "japan.pmtiles");

        let report = run_aggregate(&options, &service, &CancelToken::new()).unwrap();
        assert_eq!(report.tiles, 2);

        let mut reader = PmtilesReader::open(&options.output).unwrap();
        assert_eq!(reader.header().min_zoom, 8);
        assert_eq!(reader.header().max_zoom, 8);
        assert_eq!(reader.header().tile_type, 2);
        let fallback = reader.get(FALLBACK_TILE.tile_id()).unwrap().unwrap();
        assert!(elevations(&fallback).iter().all(|&v| v == 48.0));
        assert_eq!(reader.metadata().unwrap()["attribution"], DEFAULT_ATTRIBUTION);

        // 既存の PMTiles は overwrite なしでは上書きしない
        let err = run_aggregate(&options, &service, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, MosaicError::OutputExists(_)));
    }

    #[test]
    fn test_existing_outputs_are_checked_before_writing() {
        let dir = TempDir::new().unwrap();
        let service = two_source_store(dir.path());
        let options = AggregateOptions {
            lineage: true,
            ..options(dir.path(), "japan.mbtiles")
        };

        std::fs::write(&options.output, b"stale").unwrap();
        let err = run_aggregate(&options, &service, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, MosaicError::OutputExists(path) if path == options.output));
        assert!(!lineage_path(&options.output).exists());
        assert_eq!(std::fs::read(&options.output).unwrap(), b"stale");

        std::fs::remove_file(&options.output).unwrap();
        std::fs::write(lineage_path(&options.output), b"stale").unwrap();
        let err = run_aggregate(&options, &service, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, MosaicError::OutputExists(path) if path == lineage_path(&options.output)));
        assert!(!options.output.exists());
    }

    #[test]
    fn test_partial_tile_keeps_nodata_cells() {
        let dir = TempDir::new().unwrap();
        // 左端から 0.3 タイル分だけを覆う (8 セル中 3 列)
        let tile = PRIMARY_TILE.xy_bounds();
        let edge = tile.left + tile.width() * 0.3;
        let sliver = crate::model::Bounds::new(tile.left, tile.bottom, edge, tile.top);
        write_source(dir.path(), "dem1a", &[("sliver.tif", sliver)]);
        let service = ConstantRasterService::new().with_source("dem1a", 96.0);
        let options = AggregateOptions {
            sources: vec!["dem1a".to_string()],
            ..options(dir.path(), "partial.mbtiles")
        };

        let report = run_aggregate(&options, &service, &CancelToken::new()).unwrap();
        assert_eq!(report.tiles, 1);

        let reader = MbtilesReader::open(&options.output).unwrap();
        let bytes = reader.get_tile(PRIMARY_TILE).unwrap().unwrap();
        let rgb = TileEncoder::decode(&bytes).unwrap();
        let values = elevations(&bytes);
        for row in 0..8 {
            for col in 0..8 {
                if col < 3 {
                    assert_eq!(values[row * 8 + col], 96.0);
                } else {
                    // 海抜 0 m ((128, 0, 0)) で埋めず、no-data のまま符号化される
                    assert_eq!(rgb.pixel(row, col), (0, 0, 0));
                }
            }
        }
    }

    #[test]
    fn test_preconditions() {
        let dir = TempDir::new().unwrap();
        let service = two_source_store(dir.path());

        let no_sources = AggregateOptions {
            sources: Vec::new(),
            ..options(dir.path(), "a.mbtiles")
        };
        assert!(matches!(
            run_aggregate(&no_sources, &service, &CancelToken::new()),
            Err(MosaicError::NoSources)
        ));

        let outside = AggregateOptions {
            bbox: Some(LngLatBbox::new(-10.0, -10.0, -5.0, -5.0)),
            ..options(dir.path(), "b.mbtiles")
        };
        assert!(matches!(
            run_aggregate(&outside, &service, &CancelToken::new()),
            Err(MosaicError::BboxOutsideCoverage)
        ));

        let inverted = AggregateOptions {
            min_zoom: 9,
            ..options(dir.path(), "c.mbtiles")
        };
        assert!(matches!(
            run_aggregate(&inverted, &service, &CancelToken::new()),
            Err(MosaicError::InvalidZoomRange { min: 9, max: 8 })
        ));
    }

    #[test]
    fn test_cancelled_run_is_interrupted() {
        let dir = TempDir::new().unwrap();
        let service = two_source_store(dir.path());
        let options = options(dir.path(), "cancelled.mbtiles");
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_aggregate(&options, &service, &cancel).unwrap_err();
        assert!(err.is_interrupted());
    }
}

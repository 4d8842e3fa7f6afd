use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{EncoderEffort, TileEncoder, TileFormat};
use crate::compositor::Compositor;
use crate::error::{MosaicError, Result, SkipReason};
use crate::lineage::lineage_tile;
use crate::mercator::{tiles_in_bbox, TileRangeIter};
use crate::model::{LngLatBbox, TileCoord, MAX_SUPPORTED_ZOOM, TILE_SIZE};
use crate::progress::ProgressReporter;
use crate::terrain_rgb::encode_raster;

/// Ctrl-C やウォッチドッグから立てる中断フラグ。
///
/// `child()` で作ったトークンは親が中断されると自身も中断扱いになる。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|p| p.load(Ordering::SeqCst))
                .unwrap_or(false)
    }

    pub fn child(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(self.flag.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bbox: LngLatBbox,
    pub tile_size: usize,
    pub format: TileFormat,
    pub effort: EncoderEffort,
    /// 供給元ソースの可視化タイルも作る
    pub lineage: bool,
    pub progress_interval: u64,
    pub force_progress: bool,
    /// タイルごとに入れる待ち時間 (I/O 負荷の抑制)
    pub io_sleep: Option<Duration>,
}

impl GeneratorOptions {
    pub fn new(min_zoom: u8, max_zoom: u8, bbox: LngLatBbox) -> Self {
        Self {
            min_zoom,
            max_zoom,
            bbox,
            tile_size: TILE_SIZE,
            format: TileFormat::default(),
            effort: EncoderEffort::default(),
            lineage: false,
            progress_interval: 500,
            force_progress: false,
            io_sleep: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(MosaicError::ZoomOutOfRange {
                requested: self.max_zoom,
                max: MAX_SUPPORTED_ZOOM,
            });
        }
        if self.min_zoom > self.max_zoom {
            return Err(MosaicError::InvalidZoomRange {
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        Ok(())
    }
}

/// 書き出し用に符号化済みのタイル
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTile {
    pub coord: TileCoord,
    pub data: Vec<u8>,
    pub lineage: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationStats {
    pub checked: u64,
    pub emitted: u64,
    pub no_candidates: u64,
    pub no_data: u64,
    pub encode_failed: u64,
    pub failed_reads: u64,
}

impl GenerationStats {
    pub fn skipped(&self) -> u64 {
        self.no_candidates + self.no_data + self.encode_failed
    }
}

/// bbox 内のタイル数を [min_zoom, max_zoom] で合計する
pub fn count_tiles(bbox: &LngLatBbox, min_zoom: u8, max_zoom: u8) -> u64 {
    (min_zoom..=max_zoom)
        .filter_map(|z| tiles_in_bbox(bbox, z))
        .map(|range| range.count())
        .sum()
}

/// z, x, y の順にタイルを走査し、データのあるタイルだけを返すイテレータ
pub struct TileGenerator<'a> {
    compositor: Compositor<'a>,
    options: GeneratorOptions,
    encoder: TileEncoder,
    lineage_encoder: TileEncoder,
    cancel: CancelToken,
    next_zoom: u8,
    current: Option<TileRangeIter>,
    progress: Option<ProgressReporter>,
    /// 現在のズームを始めた時点の (checked, emitted)
    zoom_base: (u64, u64),
    stats: GenerationStats,
    finished: bool,
}

impl<'a> TileGenerator<'a> {
    pub fn new(
        compositor: Compositor<'a>,
        options: GeneratorOptions,
        cancel: CancelToken,
    ) -> Result<Self> {
        options.validate()?;
        let encoder = TileEncoder::new(options.format, options.effort);
        let lineage_encoder = TileEncoder::new(TileFormat::Png, EncoderEffort::Fast);
        let next_zoom = options.min_zoom;

        Ok(Self {
            compositor,
            options,
            encoder,
            lineage_encoder,
            cancel,
            next_zoom,
            current: None,
            progress: None,
            zoom_base: (0, 0),
            stats: GenerationStats::default(),
            finished: false,
        })
    }

    pub fn stats(&self) -> GenerationStats {
        GenerationStats {
            failed_reads: self.compositor.failed_reads(),
            ..self.stats
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    fn next_coord(&mut self) -> Option<TileCoord> {
        loop {
            if let Some(tile) = self.current.as_mut().and_then(|it| it.next()) {
                return Some(tile);
            }
            self.finish_zoom();
            if self.next_zoom > self.options.max_zoom {
                return None;
            }

            let z = self.next_zoom;
            self.next_zoom += 1;
            let Some(range) = tiles_in_bbox(&self.options.bbox, z) else {
                continue;
            };
            info!("Zoom {}: scanning {} tiles", z, range.count());
            self.progress = Some(ProgressReporter::new(
                format!("z{z}"),
                range.count(),
                self.options.progress_interval,
                self.options.force_progress,
            ));
            self.zoom_base = (self.stats.checked, self.stats.emitted);
            self.current = Some(range.iter());
        }
    }

    fn finish_zoom(&mut self) {
        if let Some(progress) = self.progress.take() {
            let (checked, emitted) = self.zoom_counts();
            progress.finish(checked, emitted);
        }
        self.current = None;
    }

    fn zoom_counts(&self) -> (u64, u64) {
        (
            self.stats.checked - self.zoom_base.0,
            self.stats.emitted - self.zoom_base.1,
        )
    }

    fn render(&self, tile: TileCoord) -> std::result::Result<GeneratedTile, SkipReason> {
        let composite = self
            .compositor
            .composite_tile(tile, self.options.lineage)?;

        let rgb = encode_raster(&composite.elevation, tile.z);
        let data = self
            .encoder
            .encode(&rgb)
            .map_err(|e| SkipReason::EncodeFailed(e.to_string()))?;

        let lineage = match composite.provenance.as_ref() {
            Some(provenance) => Some(
                lineage_tile(provenance, &self.lineage_encoder)
                    .map_err(|e| SkipReason::EncodeFailed(e.to_string()))?,
            ),
            None => None,
        };

        Ok(GeneratedTile {
            coord: tile,
            data,
            lineage,
        })
    }

    fn record_skip(&mut self, tile: TileCoord, reason: &SkipReason) {
        match reason {
            SkipReason::NoCandidates => self.stats.no_candidates += 1,
            SkipReason::NoData => self.stats.no_data += 1,
            SkipReason::EncodeFailed(_) | SkipReason::ReadFailed { .. } => {
                self.stats.encode_failed += 1;
                warn!("Skipping {}: {}", tile, reason);
                return;
            }
        }
        debug!("Skipping {}: {}", tile, reason);
    }
}

impl Iterator for TileGenerator<'_> {
    type Item = Result<GeneratedTile>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finished = true;
                warn!(
                    "Tile generation interrupted after {} tiles",
                    self.stats.emitted
                );
                return Some(Err(MosaicError::Interrupted));
            }

            let Some(tile) = self.next_coord() else {
                self.finished = true;
                let stats = self.stats();
                info!(
                    "Finished tile generation: {} tiles produced out of {} candidates",
                    stats.emitted, stats.checked
                );
                return None;
            };
            self.stats.checked += 1;

            match self.render(tile) {
                Ok(generated) => {
                    self.stats.emitted += 1;
                    let (checked, emitted) = self.zoom_counts();
                    if let Some(progress) = self.progress.as_mut() {
                        progress.update(checked, emitted);
                    }
                    if let Some(pause) = self.options.io_sleep {
                        std::thread::sleep(pause);
                    }
                    return Some(Ok(generated));
                }
                Err(reason) => self.record_skip(tile, &reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_options_validation() {
        let bbox = LngLatBbox::new(139.0, 35.0, 140.0, 36.0);
        assert!(GeneratorOptions::new(0, 17, bbox).validate().is_ok());
        assert!(matches!(
            GeneratorOptions::new(0, 18, bbox).validate(),
            Err(MosaicError::ZoomOutOfRange { .. })
        ));
        assert!(matches!(
            GeneratorOptions::new(9, 8, bbox).validate(),
            Err(MosaicError::InvalidZoomRange { min: 9, max: 8 })
        ));
    }

    #[test]
    fn test_count_tiles() {
        let world = LngLatBbox::new(-180.0, -85.0, 180.0, 85.0);
        assert_eq!(count_tiles(&world, 0, 2), 1 + 4 + 16);
    }
}

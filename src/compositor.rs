use std::cell::Cell;

use tracing::{debug, warn};

use crate::error::SkipReason;
use crate::index::{compare_records, CandidateIndex};
use crate::model::{ElevationRaster, ProvenanceRaster, SourceRecord, TileCoord, TileGrid};
use crate::raster::RasterService;

/// 1タイル分の合成結果
#[derive(Debug, Clone, PartialEq)]
pub struct TileComposite {
    pub elevation: ElevationRaster,
    pub provenance: Option<ProvenanceRaster>,
    /// 実際に画素を供給したソース数
    pub contributors: usize,
}

/// (priority, pixel_size) の昇順に並べる
pub fn order_candidates(candidates: &mut [&SourceRecord]) {
    candidates.sort_by(|a, b| compare_records(a, b));
}

/// 先に書いたものが勝つ画素単位の合成
struct Accumulator {
    elevation: ElevationRaster,
    provenance: Option<ProvenanceRaster>,
    remaining: usize,
}

impl Accumulator {
    fn new(width: usize, height: usize, track_provenance: bool) -> Self {
        Self {
            elevation: ElevationRaster::nodata(width, height),
            provenance: track_provenance.then(|| ProvenanceRaster::empty(width, height)),
            remaining: width * height,
        }
    }

    /// まだ埋まっていないセルだけにコピーし、埋めたセル数を返す
    fn absorb(&mut self, priority: i32, raster: &ElevationRaster) -> usize {
        if raster.width != self.elevation.width || raster.height != self.elevation.height {
            warn!(
                "Raster shape {}x{} does not match tile {}x{}, ignoring",
                raster.width, raster.height, self.elevation.width, self.elevation.height
            );
            return 0;
        }

        let mut filled = 0;
        for (i, (dst, &src)) in self
            .elevation
            .values
            .iter_mut()
            .zip(raster.values.iter())
            .enumerate()
        {
            if dst.is_finite() || !src.is_finite() {
                continue;
            }
            *dst = src;
            if let Some(provenance) = self.provenance.as_mut() {
                provenance.values[i] = priority;
            }
            filled += 1;
        }
        self.remaining -= filled;
        filled
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    fn finish(self, contributors: usize) -> Option<TileComposite> {
        if self.elevation.is_all_nodata() {
            return None;
        }
        Some(TileComposite {
            elevation: self.elevation,
            provenance: self.provenance,
            contributors,
        })
    }
}

/// 優先度順に並んだラスタを合成する。全セルが no-data なら `None`。
pub fn compose(rasters: &[ElevationRaster]) -> Option<ElevationRaster> {
    let first = rasters.first()?;
    let mut acc = Accumulator::new(first.width, first.height, false);
    let mut contributors = 0;
    for raster in rasters {
        if acc.absorb(ProvenanceRaster::NO_SOURCE, raster) > 0 {
            contributors += 1;
        }
        if acc.is_complete() {
            break;
        }
    }
    acc.finish(contributors).map(|c| c.elevation)
}

/// `compose` と同じ規則で合成し、各セルを供給したラスタの優先度も記録する
pub fn compose_with_provenance(
    rasters: &[(i32, ElevationRaster)],
) -> Option<(ElevationRaster, ProvenanceRaster)> {
    let (_, first) = rasters.first()?;
    let mut acc = Accumulator::new(first.width, first.height, true);
    let mut contributors = 0;
    for (priority, raster) in rasters {
        if acc.absorb(*priority, raster) > 0 {
            contributors += 1;
        }
        if acc.is_complete() {
            break;
        }
    }
    let composite = acc.finish(contributors)?;
    let provenance = composite.provenance?;
    Some((composite.elevation, provenance))
}

/// 候補検索、ラスタ読み込み、合成をまとめて行う
pub struct Compositor<'a> {
    index: &'a CandidateIndex,
    service: &'a dyn RasterService,
    tile_size: usize,
    failed_reads: Cell<u64>,
}

impl<'a> Compositor<'a> {
    pub fn new(index: &'a CandidateIndex, service: &'a dyn RasterService, tile_size: usize) -> Self {
        Self {
            index,
            service,
            tile_size,
            failed_reads: Cell::new(0),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// 読み込みに失敗して無視した候補の累計
    pub fn failed_reads(&self) -> u64 {
        self.failed_reads.get()
    }

    pub fn has_candidates(&self, tile: TileCoord) -> bool {
        !self.index.candidates(tile).is_empty()
    }

    pub fn composite_tile(
        &self,
        tile: TileCoord,
        with_provenance: bool,
    ) -> Result<TileComposite, SkipReason> {
        let mut candidates = self.index.candidates(tile);
        if candidates.is_empty() {
            return Err(SkipReason::NoCandidates);
        }
        order_candidates(&mut candidates);

        let grid = TileGrid::for_tile(tile, self.tile_size);
        let mut acc = Accumulator::new(self.tile_size, self.tile_size, with_provenance);
        let mut contributors = 0;

        for record in candidates {
            match self.service.read_window(record, &grid) {
                Ok(Some(raster)) => {
                    if acc.absorb(record.priority as i32, &raster) > 0 {
                        contributors += 1;
                    }
                }
                Ok(None) => {}
                Err(reason) => {
                    // 個々のソースの失敗はタイル全体を止めない
                    warn!("{}: {}", tile, reason);
                    self.failed_reads.set(self.failed_reads.get() + 1);
                    continue;
                }
            }
            if acc.is_complete() {
                debug!("{}: filled after {} sources", tile, contributors);
                break;
            }
        }

        acc.finish(contributors).ok_or(SkipReason::NoData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAN: f32 = f32::NAN;

    fn raster(values: Vec<f32>) -> ElevationRaster {
        ElevationRaster::new(2, 2, values)
    }

    #[test]
    fn test_first_writer_wins() {
        let a = raster(vec![1.0, NAN, 3.0, NAN]);
        let b = raster(vec![10.0, 20.0, NAN, NAN]);
        let merged = compose(&[a, b]).unwrap();

        assert_eq!(merged.values[0], 1.0);
        assert_eq!(merged.values[1], 20.0);
        assert_eq!(merged.values[2], 3.0);
        assert!(merged.values[3].is_nan());
    }

    #[test]
    fn test_provenance_tracks_supplier() {
        let rasters = vec![
            (0, raster(vec![1.0, NAN, NAN, NAN])),
            (1, raster(vec![5.0, 6.0, NAN, NAN])),
            (2, raster(vec![7.0, 8.0, 9.0, NAN])),
        ];
        let (elevation, provenance) = compose_with_provenance(&rasters).unwrap();

        assert_eq!(provenance.values, vec![0, 1, 2, -1]);
        for (v, p) in elevation.values.iter().zip(&provenance.values) {
            assert_eq!(v.is_finite(), *p != ProvenanceRaster::NO_SOURCE);
        }
    }

    #[test]
    fn test_all_nodata_is_none() {
        let empty = raster(vec![NAN; 4]);
        assert!(compose(&[empty.clone(), empty]).is_none());
        assert!(compose(&[]).is_none());
    }

    #[test]
    fn test_sparse_high_priority_is_not_overwritten() {
        let high = raster(vec![NAN, NAN, NAN, 100.0]);
        let low = raster(vec![1.0, 1.0, 1.0, 1.0]);
        let merged = compose(&[high, low]).unwrap();
        assert_eq!(merged.values, vec![1.0, 1.0, 1.0, 100.0]);
    }
}

//! 粗いズームのタイルをキーにしたソース候補インデックス

use std::collections::HashMap;

use crate::mercator::{self, ORIGIN_SHIFT};
use crate::model::{Bounds, SourceRecord, TileCoord};

pub const DEFAULT_COARSE_ZOOM: u8 = 5;

/// 出力タイルごとの候補ソース検索。
///
/// 構築時に各フットプリントを粗いズームのタイルへ振り分け、問い合わせ時は
/// 祖先タイルのバケットを引いてから厳密な矩形交差で絞り込む。
pub struct CandidateIndex {
    records: Vec<SourceRecord>,
    coarse_zoom: u8,
    buckets: HashMap<(u32, u32), Vec<usize>>,
}

impl CandidateIndex {
    pub fn build(records: Vec<SourceRecord>) -> Self {
        Self::with_coarse_zoom(records, DEFAULT_COARSE_ZOOM)
    }

    pub fn with_coarse_zoom(records: Vec<SourceRecord>, coarse_zoom: u8) -> Self {
        let mut buckets: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            let Some((min_x, max_x, min_y, max_y)) = coarse_span(&record.bounds, coarse_zoom)
            else {
                continue;
            };
            for x in min_x..=max_x {
                for y in min_y..=max_y {
                    buckets.entry((x, y)).or_default().push(i);
                }
            }
        }

        // 各バケット内は優先度、解像度の順に並べておく
        for indices in buckets.values_mut() {
            indices.sort_by(|&a, &b| compare_records(&records[a], &records[b]));
        }

        Self {
            records,
            coarse_zoom,
            buckets,
        }
    }

    pub fn coarse_zoom(&self) -> u8 {
        self.coarse_zoom
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// タイルと交差するソースを (priority, pixel_size) 順で返す
    pub fn candidates(&self, tile: TileCoord) -> Vec<&SourceRecord> {
        let tile_bounds = tile.xy_bounds();
        let mut hits: Vec<usize> = Vec::new();

        if tile.z >= self.coarse_zoom {
            let parent = mercator::ancestor(tile, self.coarse_zoom);
            if let Some(indices) = self.buckets.get(&(parent.x, parent.y)) {
                hits.extend(
                    indices
                        .iter()
                        .copied()
                        .filter(|&i| self.records[i].bounds.intersects(&tile_bounds)),
                );
            }
            return hits.into_iter().map(|i| &self.records[i]).collect();
        }

        // 粗いズームより浅いタイルは配下の全バケットを見る
        let shift = self.coarse_zoom - tile.z;
        let span = 1u32 << shift;
        let (x0, y0) = (tile.x << shift, tile.y << shift);
        for x in x0..x0 + span {
            for y in y0..y0 + span {
                if let Some(indices) = self.buckets.get(&(x, y)) {
                    hits.extend(indices.iter().copied());
                }
            }
        }
        hits.sort_unstable();
        hits.dedup();
        hits.retain(|&i| self.records[i].bounds.intersects(&tile_bounds));

        let mut found: Vec<&SourceRecord> = hits.into_iter().map(|i| &self.records[i]).collect();
        found.sort_by(|a, b| compare_records(a, b));
        found
    }
}

pub(crate) fn compare_records(a: &SourceRecord, b: &SourceRecord) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.pixel_size.total_cmp(&b.pixel_size))
}

/// フットプリントが掛かる粗いタイルの列・行範囲 (両端を含む)
fn coarse_span(bounds: &Bounds, coarse_zoom: u8) -> Option<(u32, u32, u32, u32)> {
    if !bounds.is_finite() || bounds.right <= bounds.left || bounds.top <= bounds.bottom {
        return None;
    }

    let n = 1i64 << coarse_zoom;
    let size = 2.0 * ORIGIN_SHIFT / n as f64;
    let clamp = |v: f64| (v as i64).clamp(0, n - 1) as u32;

    let min_x = ((bounds.left + ORIGIN_SHIFT) / size).floor();
    let max_x = ((bounds.right + ORIGIN_SHIFT) / size).ceil() - 1.0;
    let min_y = ((ORIGIN_SHIFT - bounds.top) / size).floor();
    let max_y = ((ORIGIN_SHIFT - bounds.bottom) / size).ceil() - 1.0;

    if max_x < 0.0 || max_y < 0.0 || min_x >= n as f64 || min_y >= n as f64 {
        return None;
    }

    Some((clamp(min_x), clamp(max_x), clamp(min_y), clamp(max_y)))
}

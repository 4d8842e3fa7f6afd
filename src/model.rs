use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mercator;

/// 出力タイルの1辺のピクセル数
pub const TILE_SIZE: usize = 512;

/// 1m 解像度のソースで量子化ステップが意味を持つ上限
pub const MAX_SUPPORTED_ZOOM: u8 = 17;

/// Web Mercator (EPSG:3857) のメートル座標による矩形
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Bounds {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite()
            && self.bottom.is_finite()
            && self.right.is_finite()
            && self.top.is_finite()
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// 辺が接しているだけの矩形は重なりとみなさない
    pub fn intersects(&self, other: &Bounds) -> bool {
        !(self.right <= other.left
            || self.left >= other.right
            || self.top <= other.bottom
            || self.bottom >= other.top)
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.left && x < self.right && y > self.bottom && y <= self.top
    }

    pub fn to_lnglat(&self) -> LngLatBbox {
        let (west, south) = mercator::xy_to_lnglat(self.left, self.bottom);
        let (east, north) = mercator::xy_to_lnglat(self.right, self.top);
        LngLatBbox {
            west,
            south,
            east,
            north,
        }
    }
}

/// WGS84 経緯度のバウンディングボックス (west, south, east, north)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLatBbox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl LngLatBbox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn intersection(&self, other: &LngLatBbox) -> Option<LngLatBbox> {
        let west = self.west.max(other.west);
        let south = self.south.max(other.south);
        let east = self.east.min(other.east);
        let north = self.north.min(other.north);
        if west >= east || south >= north {
            return None;
        }
        Some(LngLatBbox {
            west,
            south,
            east,
            north,
        })
    }

    pub fn union(&self, other: &LngLatBbox) -> LngLatBbox {
        LngLatBbox {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            0.5 * (self.west + self.east),
            0.5 * (self.south + self.north),
        )
    }
}

impl fmt::Display for LngLatBbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

/// bounds.csv の1行に対応するラスタのメタデータ。読み込み後は不変。
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub path: PathBuf,
    pub bounds: Bounds,
    pub width: usize,
    pub height: usize,
    /// 2軸の解像度の大きい方 (m/pixel)。解像度の代理指標として使う。
    pub pixel_size: f64,
    pub source: String,
    /// 小さいほど優先度が高い
    pub priority: usize,
}

impl SourceRecord {
    pub fn new(
        path: PathBuf,
        bounds: Bounds,
        width: usize,
        height: usize,
        source: &str,
        priority: usize,
    ) -> Self {
        let span_x = bounds.width().abs().max(1e-6);
        let span_y = bounds.height().abs().max(1e-6);
        let res_x = span_x / width.max(1) as f64;
        let res_y = span_y / height.max(1) as f64;

        Self {
            path,
            bounds,
            width,
            height,
            pixel_size: res_x.max(res_y),
            source: source.to_string(),
            priority,
        }
    }
}

/// 非反転 (XYZ) 規約のタイル座標
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    pub fn is_valid(&self) -> bool {
        self.z < 32 && (self.x as u64) < (1u64 << self.z) && (self.y as u64) < (1u64 << self.z)
    }

    pub fn xy_bounds(&self) -> Bounds {
        mercator::tile_xy_bounds(self.z, self.x, self.y)
    }

    pub fn lnglat_bounds(&self) -> LngLatBbox {
        mercator::tile_lnglat_bounds(self.z, self.x, self.y)
    }

    /// MBTiles (TMS) の tile_row
    pub fn tms_row(&self) -> u32 {
        mercator::flip_y(self.y, self.z)
    }

    pub fn from_tms(z: u8, column: u32, row: u32) -> Self {
        Self {
            z,
            x: column,
            y: mercator::flip_y(row, z),
        }
    }

    /// 列・行がズーム z のグリッド外なら None
    pub fn try_from_tms(z: u8, column: u32, row: u32) -> Option<Self> {
        let y = mercator::checked_flip_y(row, z)?;
        let tile = Self { z, x: column, y };
        tile.is_valid().then_some(tile)
    }

    pub fn tile_id(&self) -> u64 {
        mercator::tile_id(self.z, self.x, self.y)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}/x{}/y{}", self.z, self.x, self.y)
    }
}

/// 外部リサンプリングに渡す出力グリッド
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub bounds: Bounds,
    pub width: usize,
    pub height: usize,
}

impl TileGrid {
    pub fn for_tile(tile: TileCoord, size: usize) -> Self {
        Self {
            bounds: tile.xy_bounds(),
            width: size,
            height: size,
        }
    }

    /// GDAL 形式のジオトランスフォーム (北が上)
    pub fn geo_transform(&self) -> [f64; 6] {
        [
            self.bounds.left,
            self.bounds.width() / self.width as f64,
            0.0,
            self.bounds.top,
            0.0,
            -self.bounds.height() / self.height as f64,
        ]
    }

    /// (row, col) のピクセル中心座標
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let res_x = self.bounds.width() / self.width as f64;
        let res_y = self.bounds.height() / self.height as f64;
        (
            self.bounds.left + (col as f64 + 0.5) * res_x,
            self.bounds.top - (row as f64 + 0.5) * res_y,
        )
    }
}

/// 合成済み標高。NaN などの非有限値が no-data を表す。
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationRaster {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl ElevationRaster {
    pub fn new(width: usize, height: usize, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), width * height);
        Self {
            width,
            height,
            values,
        }
    }

    pub fn nodata(width: usize, height: usize) -> Self {
        Self::new(width, height, vec![f32::NAN; width * height])
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self::new(width, height, vec![value; width * height])
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.width + col]
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    pub fn is_all_nodata(&self) -> bool {
        !self.values.iter().any(|v| v.is_finite())
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// ピクセルごとに値を供給したソースの優先度。-1 はどのソースも埋めなかったセル。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceRaster {
    pub width: usize,
    pub height: usize,
    pub values: Vec<i32>,
}

impl ProvenanceRaster {
    pub const NO_SOURCE: i32 = -1;

    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            values: vec![Self::NO_SOURCE; width * height],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.values[row * self.width + col]
    }
}

/// RGB インターリーブの 8bit ラスタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbRaster {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl RgbRaster {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 3],
        }
    }

    pub fn pixel(&self, row: usize, col: usize) -> (u8, u8, u8) {
        let i = (row * self.width + col) * 3;
        (self.data[i], self.data[i + 1], self.data[i + 2])
    }

    pub fn set_pixel(&mut self, index: usize, rgb: (u8, u8, u8)) {
        let i = index * 3;
        self.data[i] = rgb.0;
        self.data[i + 1] = rgb.1;
        self.data[i + 2] = rgb.2;
    }
}

/// 書き込んだタイルから集計するズーム範囲と経緯度範囲
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TileExtent {
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub bbox: Option<LngLatBbox>,
}

impl TileExtent {
    pub fn add(&mut self, tile: TileCoord) {
        self.min_zoom = Some(self.min_zoom.map_or(tile.z, |z| z.min(tile.z)));
        self.max_zoom = Some(self.max_zoom.map_or(tile.z, |z| z.max(tile.z)));
        let b = tile.lnglat_bounds();
        self.bbox = Some(self.bbox.map_or(b, |acc| acc.union(&b)));
    }

    pub fn merge(&mut self, other: &TileExtent) {
        if let Some(z) = other.min_zoom {
            self.min_zoom = Some(self.min_zoom.map_or(z, |m| m.min(z)));
        }
        if let Some(z) = other.max_zoom {
            self.max_zoom = Some(self.max_zoom.map_or(z, |m| m.max(z)));
        }
        if let Some(b) = other.bbox {
            self.bbox = Some(self.bbox.map_or(b, |acc| acc.union(&b)));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_zoom.is_none()
    }

    /// (lon, lat, zoom)。ズームは範囲の中間を切り捨て
    pub fn center(&self) -> Option<(f64, f64, u8)> {
        let (min_z, max_z, bbox) = (self.min_zoom?, self.max_zoom?, self.bbox?);
        let (lon, lat) = bbox.center();
        Some((lon, lat, ((min_z as u16 + max_z as u16) / 2) as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touching_bounds_do_not_intersect() {
        let a = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let b = Bounds::new(10.0, 0.0, 20.0, 10.0);
        let c = Bounds::new(9.999, 5.0, 20.0, 15.0);

        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
    }

    #[test]
    fn test_pixel_size_uses_coarser_axis() {
        let record = SourceRecord::new(
            PathBuf::from("a.tif"),
            Bounds::new(0.0, 0.0, 1000.0, 500.0),
            1000,
            250,
            "dem",
            0,
        );
        assert_eq!(record.pixel_size, 2.0);
    }

    #[test]
    fn test_tms_row_round_trip() {
        let tile = TileCoord::new(5, 10, 12);
        assert_eq!(tile.tms_row(), 19);
        assert_eq!(TileCoord::from_tms(5, 10, tile.tms_row()), tile);
        assert_eq!(TileCoord::try_from_tms(5, 10, tile.tms_row()), Some(tile));
        assert_eq!(TileCoord::try_from_tms(5, 32, 0), None);
        assert_eq!(TileCoord::try_from_tms(5, 0, 32), None);
    }

    #[test]
    fn test_extent_center() {
        let mut extent = TileExtent::default();
        assert!(extent.center().is_none());

        extent.add(TileCoord::new(0, 0, 0));
        extent.add(TileCoord::new(3, 0, 0));
        let (lon, _lat, zoom) = extent.center().unwrap();
        assert_eq!(zoom, 1);
        assert!(lon.abs() < 1e-9);
    }
}

//! Web Mercator (EPSG:3857) の座標計算とタイル番号付け

use std::f64::consts::PI;

use crate::model::{Bounds, LngLatBbox, TileCoord};

pub const EARTH_RADIUS: f64 = 6_378_137.0;
pub const ORIGIN_SHIFT: f64 = PI * EARTH_RADIUS;
pub const EARTH_CIRCUMFERENCE: f64 = 2.0 * PI * EARTH_RADIUS;
pub const MAX_LATITUDE: f64 = 85.051_129;

const EPSILON: f64 = 1e-14;
const LL_EPSILON: f64 = 1e-11;

pub fn lnglat_to_xy(lng: f64, lat: f64) -> (f64, f64) {
    let x = EARTH_RADIUS * lng.to_radians();
    let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

pub fn xy_to_lnglat(x: f64, y: f64) -> (f64, f64) {
    let lng = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lng, lat)
}

/// タイルの投影座標 (メートル) での範囲
pub fn tile_xy_bounds(z: u8, x: u32, y: u32) -> Bounds {
    let size = 2.0 * ORIGIN_SHIFT / (1u64 << z) as f64;
    Bounds {
        left: x as f64 * size - ORIGIN_SHIFT,
        bottom: ORIGIN_SHIFT - (y as f64 + 1.0) * size,
        right: (x as f64 + 1.0) * size - ORIGIN_SHIFT,
        top: ORIGIN_SHIFT - y as f64 * size,
    }
}

/// タイルの経緯度範囲
pub fn tile_lnglat_bounds(z: u8, x: u32, y: u32) -> LngLatBbox {
    let (west, north) = tile_ul(z, x, y);
    let (east, south) = tile_ul(z, x + 1, y + 1);
    LngLatBbox {
        west,
        south,
        east,
        north,
    }
}

fn tile_ul(z: u8, x: u32, y: u32) -> (f64, f64) {
    let n = (1u64 << z) as f64;
    let lng = x as f64 / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan().to_degrees();
    (lng, lat)
}

/// 経緯度を含むタイルの (x, y)。範囲外は端のタイルに丸める。
pub fn lnglat_to_tile(lng: f64, lat: f64, z: u8) -> (u32, u32) {
    let n = (1u64 << z) as f64;
    let max_index = (1u64 << z) - 1;

    let fx = lng / 360.0 + 0.5;
    let sin_lat = lat.to_radians().sin();
    let fy = 0.5 - 0.25 * ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / PI;

    let to_index = |f: f64| -> u32 {
        if f <= 0.0 {
            0
        } else if f >= 1.0 {
            max_index as u32
        } else {
            (((f + EPSILON) * n).floor() as u64).min(max_index) as u32
        }
    };

    (to_index(fx), to_index(fy))
}

/// 1つのズームレベルにおける矩形範囲のタイル集合 (両端を含む)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub z: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn count(&self) -> u64 {
        (self.max_x - self.min_x + 1) as u64 * (self.max_y - self.min_y + 1) as u64
    }

    pub fn contains(&self, tile: &TileCoord) -> bool {
        tile.z == self.z
            && (self.min_x..=self.max_x).contains(&tile.x)
            && (self.min_y..=self.max_y).contains(&tile.y)
    }

    pub fn iter(&self) -> TileRangeIter {
        TileRangeIter {
            range: *self,
            x: self.min_x,
            y: self.min_y,
            done: false,
        }
    }
}

impl IntoIterator for TileRange {
    type Item = TileCoord;
    type IntoIter = TileRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// x を外側、y を内側に回す
#[derive(Debug, Clone)]
pub struct TileRangeIter {
    range: TileRange,
    x: u32,
    y: u32,
    done: bool,
}

impl Iterator for TileRangeIter {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        if self.done {
            return None;
        }
        let tile = TileCoord::new(self.range.z, self.x, self.y);
        if self.y < self.range.max_y {
            self.y += 1;
        } else if self.x < self.range.max_x {
            self.x += 1;
            self.y = self.range.min_y;
        } else {
            self.done = true;
        }
        Some(tile)
    }
}

/// bbox と交差するズーム z のタイル範囲。緯度は ±85.051129° に丸める。
pub fn tiles_in_bbox(bbox: &LngLatBbox, z: u8) -> Option<TileRange> {
    let west = bbox.west.max(-180.0);
    let east = bbox.east.min(180.0);
    let south = bbox.south.max(-MAX_LATITUDE);
    let north = bbox.north.min(MAX_LATITUDE);
    if west >= east || south >= north {
        return None;
    }

    let (min_x, min_y) = lnglat_to_tile(west, north, z);
    let (max_x, max_y) = lnglat_to_tile(east - LL_EPSILON, south + LL_EPSILON, z);
    if min_x > max_x || min_y > max_y {
        return None;
    }

    Some(TileRange {
        z,
        min_x,
        max_x,
        min_y,
        max_y,
    })
}

/// XYZ と TMS の行番号変換。自身の逆関数になっている。
///
/// 範囲外の行は 0 に丸める。外部入力には [`checked_flip_y`] を使う。
pub fn flip_y(y: u32, z: u8) -> u32 {
    ((1u64 << z.min(32)) - 1).saturating_sub(y as u64) as u32
}

/// z のグリッドに収まらない行なら None
pub fn checked_flip_y(y: u32, z: u8) -> Option<u32> {
    (z < 32 && (y as u64) < (1u64 << z)).then(|| flip_y(y, z))
}

/// z 以下のズームへの祖先タイル
pub fn ancestor(tile: TileCoord, z: u8) -> TileCoord {
    if z >= tile.z {
        return tile;
    }
    let shift = tile.z - z;
    TileCoord::new(z, tile.x >> shift, tile.y >> shift)
}

/// ズーム z より前の全レベルのタイル数 (4^0 + ... + 4^(z-1))
fn zoom_base_id(z: u8) -> u64 {
    ((1u64 << (2 * z as u32)) - 1) / 3
}

/// PMTiles v3 のタイル ID (ズームごとのヒルベルト曲線上の累積位置)
pub fn tile_id(z: u8, x: u32, y: u32) -> u64 {
    if z == 0 {
        return 0;
    }

    let n = 1u64 << z;
    let (mut x, mut y) = (x as u64, y as u64);
    let mut d = 0u64;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        // 象限の回転は n-1 を基準にする
        if ry == 0 {
            if rx == 1 {
                x = n - 1 - x;
                y = n - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }

    zoom_base_id(z) + d
}

/// `tile_id` の逆変換
pub fn tile_id_to_zxy(tile_id: u64) -> TileCoord {
    let mut z = 0u8;
    while z < 31 && zoom_base_id(z + 1) <= tile_id {
        z += 1;
    }

    let n = 1u64 << z;
    let mut t = tile_id - zoom_base_id(z);
    let (mut x, mut y) = (0u64, 0u64);
    let mut s = 1u64;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        if ry == 0 {
            if rx == 1 {
                x = s - 1 - x;
                y = s - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }

    TileCoord::new(z, x as u32, y as u32)
}

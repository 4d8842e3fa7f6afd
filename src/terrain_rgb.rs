//! Terrarium 形式の標高 RGB エンコード
//!
//! value = elevation + 32768 を R = value / 256, G = value mod 256,
//! B = 小数部 * 256 に分解する。ズーム 19 で 1/256 m の鉛直分解能になり、
//! ズームが1段浅くなるごとに量子化ステップが2倍になる。

use tracing::debug;

use crate::model::{ElevationRaster, RgbRaster};

const OFFSET: f64 = 32768.0;

/// 鉛直分解能 1/256 m を持つ基準ズーム
pub const FULL_RESOLUTION_ZOOM: i32 = 19;

/// ズーム z での量子化ステップ (m)
pub fn vertical_resolution(zoom: u8) -> f64 {
    2f64.powi(FULL_RESOLUTION_ZOOM - zoom as i32) / 256.0
}

pub fn elevation_to_rgb(elevation: f32, zoom: u8) -> (u8, u8, u8) {
    let step = vertical_resolution(zoom);
    let quantized = (elevation as f64 / step).round_ties_even() * step;
    let value = quantized + OFFSET;

    let r = (value / 256.0).floor().clamp(0.0, 255.0) as u8;
    let g = value.rem_euclid(256.0).floor().clamp(0.0, 255.0) as u8;
    let b = ((value - value.floor()) * 256.0).clamp(0.0, 255.0) as u8;

    (r, g, b)
}

pub fn rgb_to_elevation(r: u8, g: u8, b: u8) -> f32 {
    (r as f64 * 256.0 + g as f64 + b as f64 / 256.0 - OFFSET) as f32
}

/// 合成済みラスタを RGB に変換する。
///
/// no-data のセルは本来渡されないが、来た場合は (0, 0, 0) にする。
pub fn encode_raster(elevation: &ElevationRaster, zoom: u8) -> RgbRaster {
    let mut rgb = RgbRaster::new(elevation.width, elevation.height);
    let mut nodata = 0usize;

    for (i, &value) in elevation.values.iter().enumerate() {
        if value.is_finite() {
            rgb.set_pixel(i, elevation_to_rgb(value, zoom));
        } else {
            nodata += 1;
        }
    }

    if nodata > 0 {
        debug!("Encoded {} no-data cells as (0, 0, 0) at z{}", nodata, zoom);
    }
    rgb
}

pub fn decode_raster(rgb: &RgbRaster) -> ElevationRaster {
    let values = rgb
        .data
        .chunks_exact(3)
        .map(|px| rgb_to_elevation(px[0], px[1], px[2]))
        .collect();
    ElevationRaster::new(rgb.width, rgb.height, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_rgb_conversion() {
        let test_elevations = vec![0.0, 100.0, 1000.0, 3776.24, 8848.0];

        for zoom in [8u8, 12, 17] {
            let step = vertical_resolution(zoom) as f32;
            for &elevation in &test_elevations {
                let (r, g, b) = elevation_to_rgb(elevation, zoom);
                let decoded = rgb_to_elevation(r, g, b);

                assert!(
                    (elevation - decoded).abs() <= step,
                    "Elevation {} decoded to {} at z{} (diff: {})",
                    elevation,
                    decoded,
                    zoom,
                    (elevation - decoded).abs()
                );
            }
        }
    }

    #[test]
    fn test_negative_elevation_handling() {
        let negative_elevations = vec![-1000.0, -500.0, -10.0, -0.25];

        for elevation in negative_elevations {
            let (r, g, b) = elevation_to_rgb(elevation, 17);
            let decoded = rgb_to_elevation(r, g, b);

            assert!(
                (elevation - decoded).abs() <= vertical_resolution(17) as f32,
                "Negative elevation {} failed: decoded to {}",
                elevation,
                decoded
            );
        }
    }

    #[test]
    fn test_zero_elevation_channels() {
        assert_eq!(elevation_to_rgb(0.0, 17), (128, 0, 0));
        assert_eq!(rgb_to_elevation(128, 0, 0), 0.0);
        assert_eq!(rgb_to_elevation(0, 0, 0), -32768.0);
    }

    #[test]
    fn test_vertical_resolution_halves_per_zoom() {
        assert_eq!(vertical_resolution(19), 1.0 / 256.0);
        assert_eq!(vertical_resolution(17), 4.0 / 256.0);
        assert_eq!(vertical_resolution(11), 1.0);
        assert_eq!(vertical_resolution(0), 2048.0);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        assert_eq!(elevation_to_rgb(-40000.0, 17).0, 0);
        assert_eq!(elevation_to_rgb(40000.0, 17).0, 255);
    }

    #[test]
    fn test_low_zoom_quantization() {
        // z11 では 1m 単位
        let (r, g, b) = elevation_to_rgb(123.4, 11);
        assert_eq!(rgb_to_elevation(r, g, b), 123.0);
        assert_eq!(b, 0);
    }

    #[test]
    fn test_raster_round_trip_and_nodata() {
        let raster = ElevationRaster::new(2, 1, vec![250.5, f32::NAN]);
        let rgb = encode_raster(&raster, 15);
        assert_eq!(rgb.pixel(0, 1), (0, 0, 0));

        let decoded = decode_raster(&rgb);
        assert!((decoded.values[0] - 250.5).abs() <= vertical_resolution(15) as f32);
    }
}

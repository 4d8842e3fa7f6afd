//! ズーム分割の設定
//!
//! メモリ使用量を抑えるため、ズームレベルを複数のグループに分けて順番に処理する。

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MosaicError, Result};
use crate::model::LngLatBbox;

/// 名前付きパターンが想定する最大ズーム
pub const DEFAULT_SPLIT_MAX_ZOOM: u8 = 16;

/// 推定に使う日本全域の概算範囲
pub const JAPAN_BBOX: LngLatBbox = LngLatBbox {
    west: 122.0,
    south: 24.0,
    east: 154.0,
    north: 46.0,
};

const BASE_MEMORY_GB: f64 = 4.0;
const MEMORY_PER_MILLION_TILES_GB: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomGroup {
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// 日本全域での推定タイル数
    pub estimated_tiles: u64,
    pub estimated_memory_gb: f64,
}

impl ZoomGroup {
    pub const fn with_estimate(
        min_zoom: u8,
        max_zoom: u8,
        estimated_tiles: u64,
        estimated_memory_gb: f64,
    ) -> Self {
        Self {
            min_zoom,
            max_zoom,
            estimated_tiles,
            estimated_memory_gb,
        }
    }

    /// 推定値を日本全域の範囲から計算して作る
    pub fn new(min_zoom: u8, max_zoom: u8) -> Self {
        Self {
            min_zoom,
            max_zoom,
            estimated_tiles: estimate_tile_count(min_zoom, max_zoom, None),
            estimated_memory_gb: estimate_memory_gb(min_zoom, max_zoom, None),
        }
    }

    /// "z0-10" や "z12"
    pub fn name(&self) -> String {
        if self.min_zoom == self.max_zoom {
            format!("z{}", self.min_zoom)
        } else {
            format!("z{}-{}", self.min_zoom, self.max_zoom)
        }
    }

    pub fn zooms(&self) -> std::ops::RangeInclusive<u8> {
        self.min_zoom..=self.max_zoom
    }
}

impl fmt::Display for ZoomGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ~{} tiles, ~{:.1}GB memory",
            self.name(),
            format_count(self.estimated_tiles),
            self.estimated_memory_gb
        )
    }
}

const SINGLE: &[ZoomGroup] = &[ZoomGroup::with_estimate(0, 16, 20_000_000, 40.0)];

const BALANCED: &[ZoomGroup] = &[
    ZoomGroup::with_estimate(0, 10, 55_000, 6.0),
    ZoomGroup::with_estimate(11, 12, 200_000, 8.0),
    ZoomGroup::with_estimate(13, 14, 1_000_000, 10.0),
    ZoomGroup::with_estimate(15, 16, 20_000_000, 10.0),
];

const SAFE: &[ZoomGroup] = &[
    ZoomGroup::with_estimate(0, 9, 14_000, 5.0),
    ZoomGroup::with_estimate(10, 11, 90_000, 6.0),
    ZoomGroup::with_estimate(12, 12, 130_000, 7.0),
    ZoomGroup::with_estimate(13, 13, 500_000, 8.0),
    ZoomGroup::with_estimate(14, 14, 2_000_000, 9.0),
    ZoomGroup::with_estimate(15, 16, 20_000_000, 10.0),
];

const FAST: &[ZoomGroup] = &[
    ZoomGroup::with_estimate(0, 11, 250_000, 8.0),
    ZoomGroup::with_estimate(12, 13, 1_500_000, 12.0),
    ZoomGroup::with_estimate(14, 16, 22_000_000, 12.0),
];

const INCREMENTAL: &[ZoomGroup] = &[
    ZoomGroup::with_estimate(0, 6, 5_000, 3.0),
    ZoomGroup::with_estimate(7, 9, 9_000, 4.0),
    ZoomGroup::with_estimate(10, 10, 40_000, 5.0),
    ZoomGroup::with_estimate(11, 11, 80_000, 6.0),
    ZoomGroup::with_estimate(12, 12, 130_000, 7.0),
    ZoomGroup::with_estimate(13, 13, 500_000, 8.0),
    ZoomGroup::with_estimate(14, 14, 2_000_000, 9.0),
    ZoomGroup::with_estimate(15, 15, 8_000_000, 10.0),
    ZoomGroup::with_estimate(16, 16, 12_000_000, 10.0),
];

pub const SPLIT_PATTERN_NAMES: [&str; 5] = ["single", "balanced", "safe", "fast", "incremental"];

pub fn get_split_pattern(name: &str) -> Result<Vec<ZoomGroup>> {
    let groups = match name {
        "single" => SINGLE,
        "balanced" => BALANCED,
        "safe" => SAFE,
        "fast" => FAST,
        "incremental" => INCREMENTAL,
        _ => {
            return Err(MosaicError::UnknownSplitPattern {
                name: name.to_string(),
                available: SPLIT_PATTERN_NAMES.join(", "),
            })
        }
    };
    Ok(groups.to_vec())
}

fn mercator_row(lat: f64, n: f64) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n
}

/// ズーム範囲のタイル数の概算 (bbox 省略時は日本全域)。最低1。
pub fn estimate_tile_count(min_zoom: u8, max_zoom: u8, bbox: Option<&LngLatBbox>) -> u64 {
    let bbox = bbox.unwrap_or(&JAPAN_BBOX);
    let mut total = 0u64;
    for z in min_zoom..=max_zoom {
        let n = (1u64 << z) as f64;
        let tiles_x = ((bbox.east - bbox.west) / 360.0 * n).ceil().max(1.0) as u64;
        let y_min = mercator_row(bbox.north, n);
        let y_max = mercator_row(bbox.south, n);
        let tiles_y = (y_max - y_min).abs().ceil().max(1.0) as u64;
        total += tiles_x * tiles_y;
    }
    total.max(1)
}

/// 基本 4GB + 100 万タイルあたり 2GB
pub fn estimate_memory_gb(min_zoom: u8, max_zoom: u8, bbox: Option<&LngLatBbox>) -> f64 {
    let tiles = estimate_tile_count(min_zoom, max_zoom, bbox);
    BASE_MEMORY_GB + tiles as f64 / 1_000_000.0 * MEMORY_PER_MILLION_TILES_GB
}

/// 推定メモリが目標に達するたびにグループを区切る
pub fn create_custom_split(
    max_zoom: u8,
    target_memory_gb: f64,
    bbox: Option<&LngLatBbox>,
) -> Vec<ZoomGroup> {
    let mut groups = Vec::new();
    let mut current_min = 0u8;

    for z in 0..=max_zoom {
        let memory = estimate_memory_gb(current_min, z, bbox);
        if memory >= target_memory_gb || z == max_zoom {
            groups.push(ZoomGroup {
                min_zoom: current_min,
                max_zoom: z,
                estimated_tiles: estimate_tile_count(current_min, z, bbox),
                estimated_memory_gb: memory,
            });
            current_min = z + 1;
        }
    }
    groups
}

/// 0 から始まり隙間なく `max_zoom` で終わっているかを確認する
pub fn validate_split_pattern(groups: &[ZoomGroup], max_zoom: u8) -> Result<()> {
    let Some(last) = groups.last() else {
        return Err(MosaicError::InvalidSplitPattern(
            "Split pattern is empty".to_string(),
        ));
    };

    let mut expected_next = 0u16;
    for (i, group) in groups.iter().enumerate() {
        if group.min_zoom as u16 != expected_next {
            return Err(MosaicError::InvalidSplitPattern(format!(
                "Gap in zoom levels: group {} starts at z{}, expected z{}",
                i, group.min_zoom, expected_next
            )));
        }
        if group.min_zoom > group.max_zoom {
            return Err(MosaicError::InvalidSplitPattern(format!(
                "Invalid zoom range in group {}: min_zoom ({}) > max_zoom ({})",
                i, group.min_zoom, group.max_zoom
            )));
        }
        expected_next = group.max_zoom as u16 + 1;
    }

    if last.max_zoom != max_zoom {
        return Err(MosaicError::InvalidSplitPattern(format!(
            "Split pattern does not cover all zooms: last group ends at z{}, expected z{}",
            last.max_zoom, max_zoom
        )));
    }
    Ok(())
}

pub fn split_summary(groups: &[ZoomGroup]) -> String {
    let rule = "-".repeat(60);
    let mut lines = vec![format!("Split pattern: {} groups", groups.len()), rule.clone()];
    for (i, group) in groups.iter().enumerate() {
        lines.push(format!("Group {}: {}", i + 1, group));
    }
    let total: u64 = groups.iter().map(|g| g.estimated_tiles).sum();
    let peak = groups
        .iter()
        .map(|g| g.estimated_memory_gb)
        .fold(0.0, f64::max);
    lines.push(rule);
    lines.push(format!("Total estimated tiles: {}", format_count(total)));
    lines.push(format!("Peak memory usage: ~{:.1}GB", peak));
    lines.join("\n")
}

/// 3桁ごとにカンマを入れる
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_patterns_are_valid() {
        for name in SPLIT_PATTERN_NAMES {
            let groups = get_split_pattern(name).unwrap();
            validate_split_pattern(&groups, DEFAULT_SPLIT_MAX_ZOOM).unwrap();
        }
    }

    #[test]
    fn test_unknown_pattern() {
        let err = get_split_pattern("tiny").unwrap_err();
        assert!(err.to_string().contains("Available patterns: single, balanced"));
    }

    #[test]
    fn test_group_names() {
        assert_eq!(ZoomGroup::with_estimate(0, 10, 0, 0.0).name(), "z0-10");
        assert_eq!(ZoomGroup::with_estimate(12, 12, 0, 0.0).name(), "z12");
    }

    #[test]
    fn test_validation_errors() {
        let gap = vec![ZoomGroup::new(0, 3), ZoomGroup::new(5, 6)];
        let err = validate_split_pattern(&gap, 6).unwrap_err();
        assert!(err.to_string().contains("group 1 starts at z5, expected z4"));

        let short = vec![ZoomGroup::new(0, 3)];
        assert!(validate_split_pattern(&short, 4).is_err());
        assert!(validate_split_pattern(&[], 4).is_err());

        let inverted = vec![ZoomGroup::with_estimate(0, 3, 0, 0.0), ZoomGroup::with_estimate(4, 2, 0, 0.0)];
        assert!(validate_split_pattern(&inverted, 2).is_err());
    }

    #[test]
    fn test_custom_split_covers_range() {
        let groups = create_custom_split(16, 10.0, None);
        validate_split_pattern(&groups, 16).unwrap();
        assert!(groups.len() > 1);
    }

    #[test]
    fn test_estimates() {
        let world = LngLatBbox::new(-180.0, -85.0, 180.0, 85.0);
        assert_eq!(estimate_tile_count(0, 0, Some(&world)), 1);
        assert!(estimate_tile_count(0, 16, None) > estimate_tile_count(0, 15, None));
        assert!((estimate_memory_gb(0, 0, None) - 4.000_002).abs() < 1e-9);
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(1234), "1,234");
        assert_eq!(format_count(20_000_000), "20,000,000");
    }
}

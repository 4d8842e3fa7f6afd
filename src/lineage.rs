//! ピクセルの供給元ソースを色で可視化する

use crate::codec::TileEncoder;
use crate::error::Result;
use crate::model::{ProvenanceRaster, RgbRaster};

/// no-data は白
pub const NO_SOURCE_COLOR: (u8, u8, u8) = (255, 255, 255);

const PALETTE: [(u8, u8, u8); 7] = [
    (0, 100, 0),
    (50, 205, 50),
    (152, 251, 152),
    (34, 139, 34),
    (60, 179, 113),
    (144, 238, 144),
    (193, 255, 193),
];

/// 優先度に対応する色。7番目以降は優先度から決まる色を使う。
pub fn color_for(priority: i32) -> (u8, u8, u8) {
    if priority < 0 {
        return NO_SOURCE_COLOR;
    }
    let idx = priority as usize;
    if let Some(&color) = PALETTE.get(idx) {
        return color;
    }
    (
        (200 - (idx % 60)) as u8,
        (120 + (idx * 37) % 120) as u8,
        (100 + (idx * 23) % 120) as u8,
    )
}

pub fn provenance_to_rgb(provenance: &ProvenanceRaster) -> RgbRaster {
    let mut rgb = RgbRaster::new(provenance.width, provenance.height);
    for (i, &priority) in provenance.values.iter().enumerate() {
        rgb.set_pixel(i, color_for(priority));
    }
    rgb
}

/// 1タイル分の供給元を色分けした画像に符号化する
pub fn lineage_tile(provenance: &ProvenanceRaster, encoder: &TileEncoder) -> Result<Vec<u8>> {
    encoder.encode(&provenance_to_rgb(provenance))
}

/// 色から優先度を引き戻す (パレットの範囲のみ)
pub fn priority_for_color(color: (u8, u8, u8)) -> Option<i32> {
    if color == NO_SOURCE_COLOR {
        return Some(ProvenanceRaster::NO_SOURCE);
    }
    PALETTE
        .iter()
        .position(|&c| c == color)
        .map(|i| i as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette() {
        assert_eq!(color_for(-1), (255, 255, 255));
        assert_eq!(color_for(0), (0, 100, 0));
        assert_eq!(color_for(1), (50, 205, 50));
        assert_eq!(color_for(7), (193, 139, 141));
        assert_eq!(priority_for_color((50, 205, 50)), Some(1));
        assert_eq!(priority_for_color((1, 2, 3)), None);
    }

    #[test]
    fn test_provenance_to_rgb() {
        let provenance = ProvenanceRaster {
            width: 2,
            height: 1,
            values: vec![0, -1],
        };
        let rgb = provenance_to_rgb(&provenance);
        assert_eq!(rgb.pixel(0, 0), (0, 100, 0));
        assert_eq!(rgb.pixel(0, 1), NO_SOURCE_COLOR);
    }

    #[test]
    fn test_lineage_tile_decodes_to_palette() {
        use crate::codec::{EncoderEffort, TileFormat};

        let provenance = ProvenanceRaster {
            width: 2,
            height: 2,
            values: vec![0, 1, -1, 1],
        };
        let encoder = TileEncoder::new(TileFormat::Png, EncoderEffort::Fast);
        let bytes = lineage_tile(&provenance, &encoder).unwrap();
        let rgb = TileEncoder::decode(&bytes).unwrap();
        assert_eq!(priority_for_color(rgb.pixel(0, 1)), Some(1));
        assert_eq!(priority_for_color(rgb.pixel(1, 0)), Some(-1));
    }
}

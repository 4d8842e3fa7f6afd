use std::fmt;
use std::str::FromStr;

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::RgbRaster;

/// タイル画像のフォーマット。どちらも可逆。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    #[default]
    Webp,
}

impl TileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Webp => "webp",
        }
    }

    /// PMTiles ヘッダーの tile_type
    pub fn pmtiles_tile_type(&self) -> u8 {
        match self {
            TileFormat::Png => 2,
            TileFormat::Webp => 4,
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(TileFormat::Png),
            "webp" => Ok(TileFormat::Webp),
            other => Err(format!("unsupported tile format: {other}")),
        }
    }
}

/// PNG の圧縮レベル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderEffort {
    Fast,
    #[default]
    Default,
    Best,
}

impl FromStr for EncoderEffort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(EncoderEffort::Fast),
            "default" => Ok(EncoderEffort::Default),
            "best" => Ok(EncoderEffort::Best),
            other => Err(format!("unknown encoder effort: {other}")),
        }
    }
}

impl EncoderEffort {
    fn png_compression(&self) -> CompressionType {
        match self {
            EncoderEffort::Fast => CompressionType::Fast,
            EncoderEffort::Default => CompressionType::Default,
            EncoderEffort::Best => CompressionType::Best,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TileEncoder {
    pub format: TileFormat,
    pub effort: EncoderEffort,
}

impl TileEncoder {
    pub fn new(format: TileFormat, effort: EncoderEffort) -> Self {
        Self { format, effort }
    }

    pub fn encode(&self, rgb: &RgbRaster) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let (w, h) = (rgb.width as u32, rgb.height as u32);
        match self.format {
            TileFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    &mut buf,
                    self.effort.png_compression(),
                    FilterType::Adaptive,
                );
                encoder.write_image(&rgb.data, w, h, ExtendedColorType::Rgb8)?;
            }
            TileFormat::Webp => {
                let encoder = WebPEncoder::new_lossless(&mut buf);
                encoder.write_image(&rgb.data, w, h, ExtendedColorType::Rgb8)?;
            }
        }
        Ok(buf)
    }

    /// フォーマットはバイト列から判定する
    pub fn decode(bytes: &[u8]) -> Result<RgbRaster> {
        let img = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = img.dimensions();
        Ok(RgbRaster {
            width: width as usize,
            height: height as usize,
            data: img.into_raw(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(size: usize) -> RgbRaster {
        let mut rgb = RgbRaster::new(size, size);
        for i in 0..size * size {
            rgb.set_pixel(i, ((i % 256) as u8, (i / 7 % 256) as u8, (i * 13 % 256) as u8));
        }
        rgb
    }

    #[test]
    fn test_lossless_png_and_webp() {
        let rgb = gradient(16);
        for format in [TileFormat::Png, TileFormat::Webp] {
            let encoder = TileEncoder::new(format, EncoderEffort::Fast);
            let bytes = encoder.encode(&rgb).unwrap();
            let decoded = TileEncoder::decode(&bytes).unwrap();
            assert_eq!(decoded, rgb, "{format} is not lossless");
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("PNG".parse::<TileFormat>().unwrap(), TileFormat::Png);
        assert_eq!(TileFormat::default(), TileFormat::Webp);
        assert!("jpeg".parse::<TileFormat>().is_err());
        assert_eq!("best".parse::<EncoderEffort>().unwrap(), EncoderEffort::Best);
    }
}

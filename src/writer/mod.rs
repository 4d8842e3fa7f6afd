pub mod convert;
pub mod mbtiles;
pub mod pmtiles;
pub mod spool;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::TileFormat;
use crate::error::Result;
use crate::generator::GeneratedTile;
use crate::model::TileExtent;

pub use convert::{find_native_converter, mbtiles_to_pmtiles, ConversionMethod, ConvertOptions};
pub use mbtiles::{MbtilesReader, MbtilesWriter};
pub use pmtiles::{PmtilesReader, PmtilesWriter};
pub use spool::TileSpool;

pub const DEFAULT_ATTRIBUTION: &str = "国土地理院 (GSI Japan)";
pub const DEFAULT_ENCODING: &str = "terrarium";

/// アーカイブに書く記述的なメタデータ。範囲やズームは書き込んだタイルから計算する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub format: TileFormat,
    pub attribution: String,
    pub encoding: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ArchiveInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: TileFormat::default(),
            attribution: DEFAULT_ATTRIBUTION.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            extra: BTreeMap::new(),
        }
    }

    /// ファイル名 (拡張子なし) を name にする
    pub fn for_path(path: &Path) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tiles".to_string());
        Self::new(name)
    }

    pub fn with_format(mut self, format: TileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = attribution.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// MBTiles の metadata テーブルから復元する。無い項目は既定値。
    pub fn from_metadata(metadata: &BTreeMap<String, String>, fallback_name: &str) -> Self {
        let mut info = Self::new(
            metadata
                .get("name")
                .cloned()
                .unwrap_or_else(|| fallback_name.to_string()),
        );
        if let Some(format) = metadata.get("format") {
            match format.parse() {
                Ok(format) => info.format = format,
                Err(e) => warn!("{}; keeping {}", e, info.format),
            }
        }
        if let Some(attribution) = metadata.get("attribution") {
            info.attribution = attribution.clone();
        }
        if let Some(encoding) = metadata.get("encoding") {
            info.encoding = encoding.clone();
        }
        info
    }
}

/// 書き込み完了時の集計
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// アーカイブ内のタイル数
    pub tiles: u64,
    pub extent: TileExtent,
}

/// 生成タイルを順に sink へ渡す。最初のエラーで止まる。
pub(crate) fn stream_tiles<I, F>(tiles: I, mut sink: F) -> Result<()>
where
    I: IntoIterator<Item = Result<GeneratedTile>>,
    F: FnMut(GeneratedTile) -> Result<()>,
{
    for item in tiles {
        sink(item?)?;
    }
    Ok(())
}

/// 生成済みタイルを MBTiles に流し込む。
///
/// 途中でエラー (中断や書き込み失敗を含む) が起きたら、保存できた分のメタデータを書いてから返す。
pub fn write_tiles<I>(
    tiles: I,
    writer: MbtilesWriter,
    lineage: Option<MbtilesWriter>,
) -> Result<(ArchiveSummary, Option<ArchiveSummary>)>
where
    I: IntoIterator<Item = Result<GeneratedTile>>,
{
    let mut writer = writer;
    let mut lineage = lineage;

    let streamed = stream_tiles(tiles, |tile| {
        if let (Some(lineage_writer), Some(bytes)) = (lineage.as_mut(), tile.lineage) {
            lineage_writer.add_tile(tile.coord, bytes)?;
        }
        writer.add_tile(tile.coord, tile.data)
    });
    if let Err(e) = streamed {
        finalize_best_effort(writer);
        if let Some(lineage) = lineage {
            finalize_best_effort(lineage);
        }
        return Err(e);
    }

    let summary = writer.finalize()?;
    let lineage_summary = lineage.map(MbtilesWriter::finalize).transpose()?;
    Ok((summary, lineage_summary))
}

pub(crate) fn finalize_best_effort(writer: MbtilesWriter) {
    let path = writer.path().to_path_buf();
    match writer.finalize_partial() {
        Ok(summary) => warn!(
            "Wrote partial metadata to {} ({} tiles)",
            path.display(),
            summary.tiles
        ),
        Err(e) => warn!("Failed to finalize {}: {}", path.display(), e),
    }
}

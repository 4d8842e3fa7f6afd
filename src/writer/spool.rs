//! 順不同で届くタイルをタイル ID 順に並べ替えて PMTiles に書き出す外部ソート

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::mbtiles::MbtilesWriter;
use super::pmtiles::{PmtilesMetadata, PmtilesSummary, PmtilesWriter};
use super::{finalize_best_effort, stream_tiles, ArchiveInfo, ArchiveSummary};
use crate::error::{MosaicError, Result};
use crate::generator::GeneratedTile;
use crate::mercator::tile_id_to_zxy;
use crate::model::{LngLatBbox, TileCoord, TileExtent};

/// メモリに溜めるタイルデータの上限 (これを超えたらランとして書き出す)
pub const DEFAULT_RUN_BYTES: usize = 256 * 1024 * 1024;

/// ラン上のレコード: [tile_id u64 LE][len u32 LE][bytes]
fn write_record<W: Write>(out: &mut W, tile_id: u64, data: &[u8]) -> Result<()> {
    out.write_all(&tile_id.to_le_bytes())?;
    out.write_all(&(data.len() as u32).to_le_bytes())?;
    out.write_all(data)?;
    Ok(())
}

fn read_record<R: Read>(input: &mut R) -> Result<Option<(u64, Vec<u8>)>> {
    let mut id = [0u8; 8];
    match input.read_exact(&mut id) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
    input.read_exact(&mut data)?;
    Ok(Some((u64::from_le_bytes(id), data)))
}

/// 書き込み済みタイルの範囲と ArchiveInfo からヘッダー値を作る
pub fn pmtiles_metadata(info: &ArchiveInfo, extent: &TileExtent) -> PmtilesMetadata {
    let mut json = json!({
        "name": info.name,
        "format": info.format.as_str(),
        "attribution": info.attribution,
        "encoding": info.encoding,
    });
    if let Value::Object(map) = &mut json {
        for (key, value) in &info.extra {
            map.insert(key.clone(), Value::String(value.clone()));
        }
    }

    let bounds = extent
        .bbox
        .unwrap_or_else(|| LngLatBbox::new(0.0, 0.0, 0.0, 0.0));
    PmtilesMetadata {
        min_zoom: extent.min_zoom.unwrap_or(0),
        max_zoom: extent.max_zoom.unwrap_or(0),
        bounds,
        center: extent.center().unwrap_or((0.0, 0.0, 0)),
        tile_type: info.format.pmtiles_tile_type(),
        json,
    }
}

pub struct TileSpool {
    dir: TempDir,
    run_bytes: usize,
    buffer: Vec<(u64, Vec<u8>)>,
    buffered_bytes: usize,
    runs: Vec<PathBuf>,
    count: u64,
    extent: TileExtent,
}

impl TileSpool {
    /// `temp_root` の下に作業ディレクトリを作る。drop で消える。
    pub fn new(temp_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(temp_root)?;
        let dir = tempfile::Builder::new()
            .prefix("dem-mosaic-spool-")
            .tempdir_in(temp_root)?;
        debug!("Spooling tiles under {}", dir.path().display());
        Ok(Self {
            dir,
            run_bytes: DEFAULT_RUN_BYTES,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
            count: 0,
            extent: TileExtent::default(),
        })
    }

    pub fn with_run_bytes(mut self, run_bytes: usize) -> Self {
        self.run_bytes = run_bytes.max(1);
        self
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn extent(&self) -> &TileExtent {
        &self.extent
    }

    pub fn push(&mut self, tile: TileCoord, data: Vec<u8>) -> Result<()> {
        self.buffered_bytes += data.len() + 12;
        self.buffer.push((tile.tile_id(), data));
        self.extent.add(tile);
        self.count += 1;
        if self.buffered_bytes >= self.run_bytes {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by_key(|(id, _)| *id);

        let path = self.dir.path().join(format!("run-{:05}.bin", self.runs.len()));
        let mut out = BufWriter::new(File::create(&path)?);
        for (id, data) in self.buffer.drain(..) {
            write_record(&mut out, id, &data)?;
        }
        out.flush()?;
        debug!(
            "Spilled run {} ({} bytes buffered)",
            path.display(),
            self.buffered_bytes
        );
        self.buffered_bytes = 0;
        self.runs.push(path);
        Ok(())
    }

    /// 全ランを k-way マージして PMTiles を書く
    pub fn finish(mut self, output: &Path, info: &ArchiveInfo) -> Result<PmtilesSummary> {
        self.spill()?;
        info!(
            "Sorting {} tiles from {} spool runs into {}",
            self.count,
            self.runs.len(),
            output.display()
        );

        let mut writer = PmtilesWriter::create(output, self.dir.path())?;
        let mut readers = self
            .runs
            .iter()
            .map(|p| Ok(BufReader::new(File::open(p)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut heads: Vec<Option<Vec<u8>>> = vec![None; readers.len()];
        let mut heap = BinaryHeap::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            if let Some((id, data)) = read_record(reader)? {
                heads[i] = Some(data);
                heap.push(Reverse((id, i)));
            }
        }

        let mut previous: Option<u64> = None;
        while let Some(Reverse((id, i))) = heap.pop() {
            if previous == Some(id) {
                let tile = tile_id_to_zxy(id);
                return Err(MosaicError::DuplicateSpoolTile {
                    z: tile.z,
                    x: tile.x,
                    y: tile.y,
                });
            }
            previous = Some(id);

            if let Some(data) = heads[i].take() {
                writer.add_tile(id, &data)?;
            }
            if let Some((next_id, data)) = read_record(&mut readers[i])? {
                heads[i] = Some(data);
                heap.push(Reverse((next_id, i)));
            }
        }

        writer.finalize(&pmtiles_metadata(info, &self.extent))
    }
}

/// 生成タイルをスプール経由で PMTiles に書く。lineage は MBTiles に直接書く。
///
/// 途中でエラーになった場合は、それまでのタイルで両方を閉じてからエラーを返す。
pub fn write_pmtiles<I>(
    tiles: I,
    mut spool: TileSpool,
    output: &Path,
    info: &ArchiveInfo,
    lineage: Option<MbtilesWriter>,
) -> Result<(PmtilesSummary, Option<ArchiveSummary>)>
where
    I: IntoIterator<Item = Result<GeneratedTile>>,
{
    let mut lineage = lineage;
    let streamed = stream_tiles(tiles, |tile| {
        if let (Some(lineage_writer), Some(bytes)) = (lineage.as_mut(), tile.lineage) {
            lineage_writer.add_tile(tile.coord, bytes)?;
        }
        spool.push(tile.coord, tile.data)
    });
    if let Err(e) = streamed {
        if !spool.is_empty() {
            match spool.finish(output, info) {
                Ok(summary) => warn!(
                    "Wrote partial archive {} ({} tiles)",
                    output.display(),
                    summary.addressed_tiles
                ),
                Err(finish_err) => {
                    warn!("Failed to finish {}: {}", output.display(), finish_err)
                }
            }
        }
        if let Some(lineage) = lineage {
            finalize_best_effort(lineage);
        }
        return Err(e);
    }

    let summary = spool.finish(output, info)?;
    let lineage_summary = lineage.map(MbtilesWriter::finalize).transpose()?;
    Ok((summary, lineage_summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::mbtiles::MbtilesReader;
    use crate::writer::pmtiles::PmtilesReader;

    #[test]
    fn test_out_of_order_tiles_are_sorted_across_runs() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("sorted.pmtiles");
        // 小さなランにして複数ファイルのマージを通す
        let mut spool = TileSpool::new(dir.path()).unwrap().with_run_bytes(40);

        let tiles = [
            TileCoord::new(2, 3, 3),
            TileCoord::new(0, 0, 0),
            TileCoord::new(2, 0, 1),
            TileCoord::new(1, 1, 0),
            TileCoord::new(2, 2, 2),
        ];
        for (i, tile) in tiles.iter().enumerate() {
            spool.push(*tile, vec![i as u8; 8]).unwrap();
        }
        assert!(spool.run_count() >= 2);

        let summary = spool.finish(&output, &ArchiveInfo::new("sorted")).unwrap();
        assert_eq!(summary.addressed_tiles, 5);

        let mut reader = PmtilesReader::open(&output).unwrap();
        let ids: Vec<u64> = reader.entries().unwrap().iter().map(|e| e.tile_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(reader.header().min_zoom, 0);
        assert_eq!(reader.header().max_zoom, 2);
        assert_eq!(
            reader.get(TileCoord::new(2, 2, 2).tile_id()).unwrap(),
            Some(vec![4u8; 8])
        );
    }

    #[test]
    fn test_duplicate_tile_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut spool = TileSpool::new(dir.path()).unwrap();
        spool.push(TileCoord::new(5, 10, 12), vec![1]).unwrap();
        spool.push(TileCoord::new(5, 10, 12), vec![2]).unwrap();

        let err = spool
            .finish(&dir.path().join("dup.pmtiles"), &ArchiveInfo::new("dup"))
            .unwrap_err();
        assert!(matches!(
            err,
            MosaicError::DuplicateSpoolTile { z: 5, x: 10, y: 12 }
        ));
    }

    #[test]
    fn test_failed_stream_leaves_partial_archive() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("partial.pmtiles");
        let lineage_path = dir.path().join("partial_lineage.mbtiles");
        let spool = TileSpool::new(dir.path()).unwrap();
        let lineage =
            MbtilesWriter::create(&lineage_path, ArchiveInfo::for_path(&lineage_path), false).unwrap();

        let tile = |z, x, y| {
            Ok(GeneratedTile {
                coord: TileCoord::new(z, x, y),
                data: vec![z; 4],
                lineage: Some(vec![1]),
            })
        };
        let tiles = vec![
            tile(6, 56, 25),
            tile(6, 57, 25),
            Err(MosaicError::GroupFailed {
                index: 0,
                name: "z6".to_string(),
                reason: "encoder crashed".to_string(),
            }),
            tile(6, 58, 25),
        ];
        let err = write_pmtiles(tiles, spool, &output, &ArchiveInfo::new("partial"), Some(lineage))
            .unwrap_err();
        assert!(matches!(err, MosaicError::GroupFailed { .. }));

        let mut reader = PmtilesReader::open(&output).unwrap();
        assert_eq!(reader.header().addressed_tiles_count, 2);
        assert_eq!(reader.header().min_zoom, 6);
        assert_eq!(reader.metadata().unwrap()["name"], "partial");

        let lineage = MbtilesReader::open(&lineage_path).unwrap();
        assert_eq!(lineage.tile_count().unwrap(), 2);
        assert_eq!(lineage.metadata().unwrap()["minzoom"], "6");
    }

    #[test]
    fn test_metadata_json_carries_attribution() {
        let mut extent = TileExtent::default();
        extent.add(TileCoord::new(8, 227, 100));
        let info = ArchiveInfo::new("japan").with_extra("version", "1");
        let metadata = pmtiles_metadata(&info, &extent);

        assert_eq!(metadata.min_zoom, 8);
        assert_eq!(metadata.tile_type, 4);
        assert_eq!(metadata.json["attribution"], "国土地理院 (GSI Japan)");
        assert_eq!(metadata.json["encoding"], "terrarium");
        assert_eq!(metadata.json["version"], "1");
    }
}

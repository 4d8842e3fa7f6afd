//! PMTiles v3 コンテナの書き込みと読み取り
//!
//! レイアウト: ヘッダー (127 byte) | ルートディレクトリ | JSON メタデータ |
//! リーフディレクトリ | タイルデータ。ディレクトリと JSON は gzip 圧縮、
//! タイル本体は無圧縮のまま格納する。

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{MosaicError, Result};
use crate::model::LngLatBbox;

const MAGIC: &[u8; 7] = b"PMTiles";
const VERSION: u8 = 3;
pub const HEADER_SIZE: usize = 127;
/// ヘッダーと合わせて最初の 16 KiB に収める
const MAX_ROOT_DIR_BYTES: usize = 16_384 - HEADER_SIZE;
const INITIAL_LEAF_SIZE: usize = 4096;

pub const COMPRESSION_NONE: u8 = 1;
pub const COMPRESSION_GZIP: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub tile_id: u64,
    pub offset: u64,
    pub length: u32,
    /// 0 はリーフディレクトリへの参照
    pub run_length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub root_dir_offset: u64,
    pub root_dir_length: u64,
    pub json_metadata_offset: u64,
    pub json_metadata_length: u64,
    pub leaf_dirs_offset: u64,
    pub leaf_dirs_length: u64,
    pub tile_data_offset: u64,
    pub tile_data_length: u64,
    pub addressed_tiles_count: u64,
    pub tile_entries_count: u64,
    pub tile_contents_count: u64,
    pub clustered: bool,
    pub internal_compression: u8,
    pub tile_compression: u8,
    pub tile_type: u8,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds: LngLatBbox,
    pub center_zoom: u8,
    pub center_lon: f64,
    pub center_lat: f64,
}

fn e7(v: f64) -> [u8; 4] {
    ((v * 10_000_000.0).round() as i32).to_le_bytes()
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..7].copy_from_slice(MAGIC);
        buf[7] = VERSION;

        let words = [
            self.root_dir_offset,
            self.root_dir_length,
            self.json_metadata_offset,
            self.json_metadata_length,
            self.leaf_dirs_offset,
            self.leaf_dirs_length,
            self.tile_data_offset,
            self.tile_data_length,
            self.addressed_tiles_count,
            self.tile_entries_count,
            self.tile_contents_count,
        ];
        for (i, word) in words.iter().enumerate() {
            let start = 8 + i * 8;
            buf[start..start + 8].copy_from_slice(&word.to_le_bytes());
        }

        buf[96] = u8::from(self.clustered);
        buf[97] = self.internal_compression;
        buf[98] = self.tile_compression;
        buf[99] = self.tile_type;
        buf[100] = self.min_zoom;
        buf[101] = self.max_zoom;
        buf[102..106].copy_from_slice(&e7(self.bounds.west));
        buf[106..110].copy_from_slice(&e7(self.bounds.south));
        buf[110..114].copy_from_slice(&e7(self.bounds.east));
        buf[114..118].copy_from_slice(&e7(self.bounds.north));
        buf[118] = self.center_zoom;
        buf[119..123].copy_from_slice(&e7(self.center_lon));
        buf[123..127].copy_from_slice(&e7(self.center_lat));
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || &buf[0..7] != MAGIC || buf[7] != VERSION {
            return None;
        }
        let word = |i: usize| {
            let start = 8 + i * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[start..start + 8]);
            u64::from_le_bytes(bytes)
        };
        let coord = |start: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[start..start + 4]);
            i32::from_le_bytes(bytes) as f64 / 10_000_000.0
        };

        Some(Self {
            root_dir_offset: word(0),
            root_dir_length: word(1),
            json_metadata_offset: word(2),
            json_metadata_length: word(3),
            leaf_dirs_offset: word(4),
            leaf_dirs_length: word(5),
            tile_data_offset: word(6),
            tile_data_length: word(7),
            addressed_tiles_count: word(8),
            tile_entries_count: word(9),
            tile_contents_count: word(10),
            clustered: buf[96] == 1,
            internal_compression: buf[97],
            tile_compression: buf[98],
            tile_type: buf[99],
            min_zoom: buf[100],
            max_zoom: buf[101],
            bounds: LngLatBbox::new(coord(102), coord(106), coord(110), coord(114)),
            center_zoom: buf[118],
            center_lon: coord(119),
            center_lat: coord(123),
        })
    }
}

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn decode_varint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    while let Some(&byte) = data.get(*pos) {
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// 列指向・差分符号化のディレクトリ
pub fn encode_directory(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_varint(entries.len() as u64, &mut buf);

    let mut last_id = 0;
    for entry in entries {
        encode_varint(entry.tile_id - last_id, &mut buf);
        last_id = entry.tile_id;
    }
    for entry in entries {
        encode_varint(entry.run_length as u64, &mut buf);
    }
    for entry in entries {
        encode_varint(entry.length as u64, &mut buf);
    }
    for (i, entry) in entries.iter().enumerate() {
        // 直前のエントリの直後に続く場合は 0
        if i > 0 && entry.offset == entries[i - 1].offset + entries[i - 1].length as u64 {
            encode_varint(0, &mut buf);
        } else {
            encode_varint(entry.offset + 1, &mut buf);
        }
    }
    buf
}

pub fn decode_directory(data: &[u8]) -> Option<Vec<DirEntry>> {
    let mut pos = 0;
    let count = decode_varint(data, &mut pos)? as usize;
    let mut entries = vec![
        DirEntry {
            tile_id: 0,
            offset: 0,
            length: 0,
            run_length: 0,
        };
        count
    ];

    let mut last_id = 0;
    for entry in entries.iter_mut() {
        last_id += decode_varint(data, &mut pos)?;
        entry.tile_id = last_id;
    }
    for entry in entries.iter_mut() {
        entry.run_length = decode_varint(data, &mut pos)? as u32;
    }
    for entry in entries.iter_mut() {
        entry.length = decode_varint(data, &mut pos)? as u32;
    }
    for i in 0..count {
        let value = decode_varint(data, &mut pos)?;
        entries[i].offset = if value == 0 && i > 0 {
            entries[i - 1].offset + entries[i - 1].length as u64
        } else {
            value.checked_sub(1)?
        };
    }
    Some(entries)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// ルートが上限に収まるまでリーフの大きさを倍にしていく
fn build_directories(entries: &[DirEntry]) -> Result<(Vec<u8>, Vec<u8>, usize)> {
    let root = gzip(&encode_directory(entries))?;
    if root.len() <= MAX_ROOT_DIR_BYTES {
        return Ok((root, Vec::new(), 0));
    }

    let mut leaf_size = INITIAL_LEAF_SIZE;
    loop {
        let mut root_entries = Vec::new();
        let mut leaves = Vec::new();
        for chunk in entries.chunks(leaf_size) {
            let leaf = gzip(&encode_directory(chunk))?;
            root_entries.push(DirEntry {
                tile_id: chunk[0].tile_id,
                offset: leaves.len() as u64,
                length: leaf.len() as u32,
                run_length: 0,
            });
            leaves.extend_from_slice(&leaf);
        }
        let root = gzip(&encode_directory(&root_entries))?;
        if root.len() <= MAX_ROOT_DIR_BYTES {
            return Ok((root, leaves, root_entries.len()));
        }
        leaf_size *= 2;
    }
}

/// finalize 時にヘッダーへ書く値
#[derive(Debug, Clone, PartialEq)]
pub struct PmtilesMetadata {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds: LngLatBbox,
    pub center: (f64, f64, u8),
    pub tile_type: u8,
    /// JSON メタデータ (attribution, encoding など)
    pub json: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtilesSummary {
    pub path: PathBuf,
    pub addressed_tiles: u64,
    pub tile_entries: u64,
    pub tile_contents: u64,
    pub leaf_directories: usize,
}

/// タイル ID の昇順でタイルを受け取るライター。
///
/// タイル本体はテンポラリファイルへ追記し、ディレクトリは finalize でまとめて作る。
/// 直前と同一内容で ID が連続するタイルは run_length でまとめる。
pub struct PmtilesWriter {
    output: PathBuf,
    data: BufWriter<NamedTempFile>,
    entries: Vec<DirEntry>,
    last_id: Option<u64>,
    last_payload: Vec<u8>,
    offset: u64,
    contents: u64,
}

impl PmtilesWriter {
    pub fn create(output: &Path, temp_dir: &Path) -> Result<Self> {
        let data = NamedTempFile::new_in(temp_dir)?;
        Ok(Self {
            output: output.to_path_buf(),
            data: BufWriter::new(data),
            entries: Vec::new(),
            last_id: None,
            last_payload: Vec::new(),
            offset: 0,
            contents: 0,
        })
    }

    pub fn tile_count(&self) -> u64 {
        self.entries.iter().map(|e| e.run_length as u64).sum()
    }

    pub fn add_tile(&mut self, tile_id: u64, data: &[u8]) -> Result<()> {
        if let Some(previous) = self.last_id {
            if tile_id <= previous {
                return Err(MosaicError::TileOrder { tile_id, previous });
            }
        }
        self.last_id = Some(tile_id);

        if let Some(last) = self.entries.last_mut() {
            let contiguous = last.tile_id + last.run_length as u64 == tile_id;
            if contiguous && self.last_payload.as_slice() == data && last.run_length < u32::MAX {
                last.run_length += 1;
                return Ok(());
            }
        }

        self.data.write_all(data)?;
        self.entries.push(DirEntry {
            tile_id,
            offset: self.offset,
            length: data.len() as u32,
            run_length: 1,
        });
        self.offset += data.len() as u64;
        self.contents += 1;
        self.last_payload.clear();
        self.last_payload.extend_from_slice(data);
        Ok(())
    }

    pub fn finalize(self, metadata: &PmtilesMetadata) -> Result<PmtilesSummary> {
        let (root, leaves, leaf_count) = build_directories(&self.entries)?;
        let json = gzip(&serde_json::to_vec(&metadata.json)?)?;

        let root_dir_offset = HEADER_SIZE as u64;
        let json_metadata_offset = root_dir_offset + root.len() as u64;
        let leaf_dirs_offset = json_metadata_offset + json.len() as u64;
        let tile_data_offset = leaf_dirs_offset + leaves.len() as u64;

        let header = Header {
            root_dir_offset,
            root_dir_length: root.len() as u64,
            json_metadata_offset,
            json_metadata_length: json.len() as u64,
            leaf_dirs_offset,
            leaf_dirs_length: leaves.len() as u64,
            tile_data_offset,
            tile_data_length: self.offset,
            addressed_tiles_count: self.tile_count(),
            tile_entries_count: self.entries.len() as u64,
            tile_contents_count: self.contents,
            clustered: true,
            internal_compression: COMPRESSION_GZIP,
            tile_compression: COMPRESSION_NONE,
            tile_type: metadata.tile_type,
            min_zoom: metadata.min_zoom,
            max_zoom: metadata.max_zoom,
            bounds: metadata.bounds,
            center_zoom: metadata.center.2,
            center_lon: metadata.center.0,
            center_lat: metadata.center.1,
        };

        let mut tile_data = self
            .data
            .into_inner()
            .map_err(|e| MosaicError::Io(e.into_error()))?;
        tile_data.as_file_mut().flush()?;
        tile_data.as_file_mut().seek(SeekFrom::Start(0))?;

        let mut out = BufWriter::new(File::create(&self.output)?);
        out.write_all(&header.to_bytes())?;
        out.write_all(&root)?;
        out.write_all(&json)?;
        out.write_all(&leaves)?;
        std::io::copy(tile_data.as_file_mut(), &mut out)?;
        out.flush()?;

        debug!(
            "PMTiles layout: root {} bytes, {} leaves ({} bytes), data {} bytes",
            root.len(),
            leaf_count,
            leaves.len(),
            self.offset
        );
        info!(
            "Wrote {} ({} tiles, {} unique)",
            self.output.display(),
            header.addressed_tiles_count,
            self.contents
        );

        Ok(PmtilesSummary {
            path: self.output,
            addressed_tiles: header.addressed_tiles_count,
            tile_entries: header.tile_entries_count,
            tile_contents: self.contents,
            leaf_directories: leaf_count,
        })
    }
}

/// 検証用の PMTiles リーダー
pub struct PmtilesReader {
    path: PathBuf,
    file: File,
    header: Header,
}

impl PmtilesReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MosaicError::InputNotFound(path.to_path_buf()));
        }
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = Header::from_bytes(&buf).ok_or_else(|| MosaicError::MalformedArchive {
            path: path.to_path_buf(),
            reason: "not a PMTiles v3 header".to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    fn read_range(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn malformed(&self, reason: &str) -> MosaicError {
        MosaicError::MalformedArchive {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn read_directory(&mut self, offset: u64, length: u64) -> Result<Vec<DirEntry>> {
        let compressed = self.read_range(offset, length)?;
        let raw = if self.header.internal_compression == COMPRESSION_GZIP {
            gunzip(&compressed)?
        } else {
            compressed
        };
        decode_directory(&raw).ok_or_else(|| self.malformed("corrupt directory"))
    }

    pub fn metadata(&mut self) -> Result<Value> {
        let (offset, length) = (
            self.header.json_metadata_offset,
            self.header.json_metadata_length,
        );
        let raw = self.read_range(offset, length)?;
        let json = if self.header.internal_compression == COMPRESSION_GZIP {
            gunzip(&raw)?
        } else {
            raw
        };
        Ok(serde_json::from_slice(&json)?)
    }

    /// リーフを展開した全タイルエントリ (タイル ID 昇順)
    pub fn entries(&mut self) -> Result<Vec<DirEntry>> {
        let root = self.read_directory(self.header.root_dir_offset, self.header.root_dir_length)?;
        let mut entries = Vec::new();
        for entry in root {
            if entry.run_length > 0 {
                entries.push(entry);
            } else {
                let leaf = self.read_directory(
                    self.header.leaf_dirs_offset + entry.offset,
                    entry.length as u64,
                )?;
                entries.extend(leaf);
            }
        }
        Ok(entries)
    }

    pub fn get(&mut self, tile_id: u64) -> Result<Option<Vec<u8>>> {
        let mut offset = self.header.root_dir_offset;
        let mut length = self.header.root_dir_length;

        // ルート -> リーフの順にたどる (リーフの入れ子は3段まで)
        for _ in 0..4 {
            let directory = self.read_directory(offset, length)?;
            let idx = directory.partition_point(|e| e.tile_id <= tile_id);
            if idx == 0 {
                return Ok(None);
            }
            let entry = directory[idx - 1];
            if entry.run_length == 0 {
                offset = self.header.leaf_dirs_offset + entry.offset;
                length = entry.length as u64;
                continue;
            }
            if tile_id >= entry.tile_id + entry.run_length as u64 {
                return Ok(None);
            }
            let data = self.read_range(
                self.header.tile_data_offset + entry.offset,
                entry.length as u64,
            )?;
            return Ok(Some(data));
        }
        Err(self.malformed("directory nesting too deep"))
    }
}

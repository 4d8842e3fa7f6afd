use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::error::{MosaicError, Result};
use crate::model::{TileCoord, TileExtent};
use crate::writer::{ArchiveInfo, ArchiveSummary};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10_000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metadata (
        name TEXT PRIMARY KEY,
        value TEXT
    );
    CREATE TABLE IF NOT EXISTS tiles (
        zoom_level INTEGER,
        tile_column INTEGER,
        tile_row INTEGER,
        tile_data BLOB,
        UNIQUE(zoom_level, tile_column, tile_row)
    );
    CREATE INDEX IF NOT EXISTS idx_tiles_zxy
        ON tiles(zoom_level, tile_column, tile_row);
";

const INSERT_TILE: &str = "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)";

/// 出力済みファイルを消す。WAL の残骸 (-wal / -shm) も一緒に消す。
pub fn remove_mbtiles(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        let target = PathBuf::from(name);
        if target.exists() {
            fs::remove_file(&target)?;
        }
    }
    Ok(())
}

/// 保存形式のキーを XYZ に戻す。グリッド外の行は壊れたアーカイブとして扱う。
fn tile_key(path: &Path, z: u8, column: u32, row: u32) -> Result<TileCoord> {
    TileCoord::try_from_tms(z, column, row).ok_or_else(|| MosaicError::MalformedArchive {
        path: path.to_path_buf(),
        reason: format!("tile z{z} column {column} row {row} lies outside the tile grid"),
    })
}

fn count_rows(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// 保存されている行から (min/max zoom, 経緯度範囲) を求める
pub(crate) fn scan_extent(conn: &Connection, path: &Path) -> Result<TileExtent> {
    let mut stmt = conn.prepare(
        "SELECT zoom_level, MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row)
         FROM tiles GROUP BY zoom_level",
    )?;
    let mut rows = stmt.query([])?;
    let mut extent = TileExtent::default();
    while let Some(row) = rows.next()? {
        let z: u8 = row.get(0)?;
        let min_col: u32 = row.get(1)?;
        let max_col: u32 = row.get(2)?;
        let min_row: u32 = row.get(3)?;
        let max_row: u32 = row.get(4)?;
        // TMS の行番号が最大のものが北端
        extent.add(tile_key(path, z, min_col, max_row)?);
        extent.add(tile_key(path, z, max_col, min_row)?);
    }
    Ok(extent)
}

/// バッチ単位でトランザクションを確定しながら書き込む MBTiles ライター
pub struct MbtilesWriter {
    path: PathBuf,
    conn: Connection,
    info: ArchiveInfo,
    batch: Vec<(TileCoord, Vec<u8>)>,
    batch_size: usize,
    checkpoint_interval: u64,
    next_checkpoint: u64,
    inserted: u64,
    extent: TileExtent,
}

impl MbtilesWriter {
    /// 新規作成。既存ファイルは overwrite 指定時のみ削除する。
    pub fn create(path: &Path, info: ArchiveInfo, overwrite: bool) -> Result<Self> {
        if path.exists() {
            if !overwrite {
                return Err(MosaicError::OutputExists(path.to_path_buf()));
            }
            remove_mbtiles(path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Self::open_inner(path, info, TileExtent::default())
    }

    /// 既存ファイルへの追記。最終メタデータは既存の行も含めて計算する。
    pub fn open_append(path: &Path, info: ArchiveInfo) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, info, false);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        let extent = scan_extent(&conn, path)?;
        drop(conn);
        Self::open_inner(path, info, extent)
    }

    fn open_inner(path: &Path, info: ArchiveInfo, extent: TileExtent) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        if let Err(e) = conn.pragma_update(None, "wal_autocheckpoint", 1000) {
            debug!("wal_autocheckpoint not applied: {}", e);
        }
        conn.execute_batch(SCHEMA)?;

        debug!("Opened MBTiles writer at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            info,
            batch: Vec::with_capacity(DEFAULT_BATCH_SIZE),
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            next_checkpoint: DEFAULT_CHECKPOINT_INTERVAL,
            inserted: 0,
            extent,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval.max(1);
        self.next_checkpoint = self.inserted + self.checkpoint_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    /// 確定済みの行数 (バッチに残っている分は含まない)
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// XYZ 座標で受け取り、TMS の行番号で保存する
    pub fn add_tile(&mut self, tile: TileCoord, data: Vec<u8>) -> Result<()> {
        if !tile.is_valid() {
            return Err(MosaicError::TileOutOfRange(tile));
        }
        self.extent.add(tile);
        self.batch.push((tile, data));
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// 保存形式 (TMS 行番号) のままの行を追加する
    pub(crate) fn add_row(&mut self, z: u8, column: u32, row: u32, data: Vec<u8>) -> Result<()> {
        let tile = tile_key(&self.path, z, column, row)?;
        self.add_tile(tile, data)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_TILE)?;
            for (tile, data) in &self.batch {
                stmt.execute(params![tile.z, tile.x, tile.tms_row(), data])?;
            }
        }
        tx.commit()?;

        self.inserted += self.batch.len() as u64;
        self.batch.clear();

        if self.inserted >= self.next_checkpoint {
            self.checkpoint();
            while self.next_checkpoint <= self.inserted {
                self.next_checkpoint += self.checkpoint_interval;
            }
        }
        Ok(())
    }

    /// WAL を切り詰める。失敗しても finalize で再試行するので警告だけ出す。
    fn checkpoint(&self) {
        match self
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        {
            Ok(()) => debug!("WAL checkpoint after {} tiles", self.inserted),
            Err(e) => warn!("WAL checkpoint failed: {}", e),
        }
    }

    fn write_metadata(&self) -> Result<()> {
        let mut metadata: Vec<(String, String)> = vec![
            ("name".into(), self.info.name.clone()),
            ("format".into(), self.info.format.as_str().into()),
            ("attribution".into(), self.info.attribution.clone()),
            ("encoding".into(), self.info.encoding.clone()),
        ];
        if let (Some(min_z), Some(max_z), Some(bbox)) =
            (self.extent.min_zoom, self.extent.max_zoom, self.extent.bbox)
        {
            let (lon, lat, zoom) = self.extent.center().unwrap_or((0.0, 0.0, min_z));
            metadata.push(("bounds".into(), bbox.to_string()));
            metadata.push(("minzoom".into(), min_z.to_string()));
            metadata.push(("maxzoom".into(), max_z.to_string()));
            metadata.push(("center".into(), format!("{lon},{lat},{zoom}")));
        }
        for (key, value) in &self.info.extra {
            metadata.push((key.clone(), value.clone()));
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)")?;
            for (key, value) in &metadata {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// 残りのバッチを書き、メタデータを保存して通常のジャーナルモードに戻す
    pub fn finalize(mut self) -> Result<ArchiveSummary> {
        self.flush()?;
        self.complete()
    }

    /// 書き込み途中で失敗したときの後始末。
    ///
    /// 書けなかったバッチは捨て、範囲は実際に保存された行から計算し直してメタデータを書く。
    pub fn finalize_partial(mut self) -> Result<ArchiveSummary> {
        if let Err(e) = self.flush() {
            warn!(
                "Dropping {} unflushed tiles for {}: {}",
                self.batch.len(),
                self.path.display(),
                e
            );
            self.batch.clear();
        }
        self.extent = scan_extent(&self.conn, &self.path)?;
        self.complete()
    }

    fn complete(self) -> Result<ArchiveSummary> {
        self.write_metadata()?;
        self.checkpoint();
        self.conn
            .query_row("PRAGMA journal_mode=DELETE", [], |_| Ok(()))?;

        // 同じキーの書き直しは行数に数えない
        let tiles = count_rows(&self.conn)?;
        info!(
            "Finalized {} ({} tiles, {} rows written)",
            self.path.display(),
            tiles,
            self.inserted
        );
        Ok(ArchiveSummary {
            path: self.path.clone(),
            tiles,
            extent: self.extent,
        })
    }
}

/// MBTiles の読み取り専用ハンドル
pub struct MbtilesReader {
    path: PathBuf,
    conn: Connection,
}

impl MbtilesReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MosaicError::InputNotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT name, value FROM metadata")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut metadata = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            metadata.insert(name, value.unwrap_or_default());
        }
        Ok(metadata)
    }

    pub fn tile_count(&self) -> Result<u64> {
        count_rows(&self.conn)
    }

    /// 行から再計算したズーム範囲と経緯度範囲
    pub fn extent(&self) -> Result<TileExtent> {
        scan_extent(&self.conn, &self.path)
    }

    pub fn get_tile(&self, tile: TileCoord) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
        )?;
        let mut rows = stmt.query(params![tile.z, tile.x, tile.tms_row()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// 保存形式 (z, column, TMS row) のまま全行を走査する。グリッド外の行はエラー。
    pub fn for_each_row<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u8, u32, u32, Vec<u8>) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(
            "SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles
             ORDER BY zoom_level, tile_column, tile_row",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (z, column, tile_row) = (row.get(0)?, row.get(1)?, row.get(2)?);
            tile_key(&self.path, z, column, tile_row)?;
            f(z, column, tile_row, row.get(3)?)?;
        }
        Ok(())
    }

    /// 行番号を XYZ に戻して全タイルを走査する
    pub fn for_each_tile<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(TileCoord, Vec<u8>) -> Result<()>,
    {
        self.for_each_row(|z, column, row, data| f(TileCoord::from_tms(z, column, row), data))
    }

    /// タイルキー (z, column, TMS row) だけを走査する
    pub fn for_each_key<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u8, u32, u32),
    {
        let mut stmt = self
            .conn
            .prepare("SELECT zoom_level, tile_column, tile_row FROM tiles")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (z, column, tile_row) = (row.get(0)?, row.get(1)?, row.get(2)?);
            tile_key(&self.path, z, column, tile_row)?;
            f(z, column, tile_row);
        }
        Ok(())
    }
}

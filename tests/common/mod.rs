//! 結合テスト用のソースストアとラスタサービス

use std::collections::HashMap;
use std::path::Path;

use dem_mosaic::catalog::{MANIFEST_COLUMNS, MANIFEST_FILE};
use dem_mosaic::model::{Bounds, TileGrid};
use dem_mosaic::raster::Footprint;
use dem_mosaic::{ElevationRaster, RasterService, SkipReason, SourceRecord, TileCoord};

/// ソース名ごとの一定値で、フットプリントに掛かるセルを埋める
#[derive(Debug, Default)]
pub struct FlatRasterService {
    values: HashMap<String, f32>,
}

impl FlatRasterService {
    pub fn new(values: &[(&str, f32)]) -> Self {
        Self {
            values: values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }
}

impl RasterService for FlatRasterService {
    fn read_window(
        &self,
        record: &SourceRecord,
        grid: &TileGrid,
    ) -> Result<Option<ElevationRaster>, SkipReason> {
        let value = self.values.get(&record.source).copied().unwrap_or(0.0);
        let res_x = grid.bounds.width() / grid.width as f64;
        let res_y = grid.bounds.height() / grid.height as f64;

        let mut raster = ElevationRaster::nodata(grid.width, grid.height);
        for row in 0..grid.height {
            for col in 0..grid.width {
                let left = grid.bounds.left + col as f64 * res_x;
                let top = grid.bounds.top - row as f64 * res_y;
                if record
                    .bounds
                    .intersects(&Bounds::new(left, top - res_y, left + res_x, top))
                {
                    raster.values[row * grid.width + col] = value;
                }
            }
        }
        Ok((!raster.is_all_nodata()).then_some(raster))
    }

    fn footprint(&self, path: &Path) -> Result<Footprint, SkipReason> {
        Err(SkipReason::ReadFailed {
            path: path.to_path_buf(),
            message: "footprints are not available".to_string(),
        })
    }
}

/// 左右に並んだ z8 タイル。dem1a は左だけ、dem5a は両方を覆う。
pub const LEFT: TileCoord = TileCoord { z: 8, x: 227, y: 100 };
pub const RIGHT: TileCoord = TileCoord { z: 8, x: 228, y: 100 };

pub fn write_store(root: &Path) {
    let left = LEFT.xy_bounds();
    let both = left.union(&RIGHT.xy_bounds());
    write_source(root, "dem1a", &[("dem1a_0001.tif", left)]);
    write_source(root, "dem5a", &[("dem5a_0001.tif", both)]);
}

fn write_source(root: &Path, name: &str, rasters: &[(&str, Bounds)]) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = format!("{}\n", MANIFEST_COLUMNS.join(","));
    for (file, b) in rasters {
        std::fs::write(dir.join(file), b"").unwrap();
        manifest.push_str(&format!(
            "{},{},{},{},{},512,512\n",
            file, b.left, b.bottom, b.right, b.top
        ));
    }
    std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
}

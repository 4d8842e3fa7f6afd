use std::path::{Path, PathBuf};

use gdal::raster::reproject;
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use tracing::debug;

use crate::error::{Result, SkipReason};
use crate::model::{Bounds, ElevationRaster, SourceRecord, TileGrid};

/// ソースラスタの Web Mercator での範囲とピクセル数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Footprint {
    pub bounds: Bounds,
    pub width: usize,
    pub height: usize,
}

/// 1枚のソースラスタを出力グリッドへ再投影・リサンプリングする外部サービス。
///
/// 返すラスタでは no-data を必ず非有限値で表す。
pub trait RasterService {
    /// グリッドへ読み込む。有効値が1つもなければ `Ok(None)`。
    fn read_window(
        &self,
        record: &SourceRecord,
        grid: &TileGrid,
    ) -> std::result::Result<Option<ElevationRaster>, SkipReason>;

    fn footprint(&self, path: &Path) -> std::result::Result<Footprint, SkipReason>;
}

/// GDAL の MEM データセットと GDALReprojectImage (bilinear) による実装
#[derive(Debug)]
pub struct GdalRasterService {
    threads: usize,
}

impl GdalRasterService {
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        gdal::config::set_config_option("GDAL_NUM_THREADS", &threads.to_string())?;
        Ok(Self { threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn warp(&self, record: &SourceRecord, grid: &TileGrid) -> Result<Option<ElevationRaster>> {
        let src = Dataset::open(&record.path)?;
        let src_nodata = src.rasterband(1)?.no_data_value();

        // 出力先は NaN で初期化しておき、ソースが無い場所は NaN のまま残す
        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut dst = driver.create_with_band_type::<f32, _>("", grid.width, grid.height, 1)?;
        dst.set_geo_transform(&grid.geo_transform())?;
        let srs = SpatialRef::from_epsg(3857)?;
        dst.set_projection(&srs.to_wkt()?)?;
        {
            let mut band = dst.rasterband(1)?;
            band.set_no_data_value(Some(f64::NAN))?;
            band.fill(f64::NAN, None)?;
        }

        reproject(&src, &dst)?;

        let band = dst.rasterband(1)?;
        let buffer = band.read_as::<f32>(
            (0, 0),
            (grid.width, grid.height),
            (grid.width, grid.height),
            None,
        )?;
        let (_, mut values) = buffer.into_shape_and_vec();

        // ソースの no-data 値がそのまま補間されて残った画素も NaN にする
        if let Some(nodata) = src_nodata.filter(|v| v.is_finite()) {
            let nodata = nodata as f32;
            for v in values.iter_mut() {
                if *v == nodata {
                    *v = f32::NAN;
                }
            }
        }

        let raster = ElevationRaster::new(grid.width, grid.height, values);
        if raster.is_all_nodata() {
            return Ok(None);
        }
        Ok(Some(raster))
    }

    fn read_footprint(&self, path: &Path) -> Result<Footprint> {
        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();
        let gt = dataset.geo_transform()?;

        let x0 = gt[0];
        let y0 = gt[3];
        let x1 = gt[0] + width as f64 * gt[1] + height as f64 * gt[2];
        let y1 = gt[3] + width as f64 * gt[4] + height as f64 * gt[5];
        let native = [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)];

        let mut source_srs = dataset.spatial_ref()?;
        source_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let mut mercator = SpatialRef::from_epsg(3857)?;
        mercator.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

        let transform = CoordTransform::new(&source_srs, &mercator)?;
        let [left, bottom, right, top] = transform.transform_bounds(&native, 21)?;

        Ok(Footprint {
            bounds: Bounds::new(left, bottom, right, top),
            width,
            height,
        })
    }
}

impl RasterService for GdalRasterService {
    fn read_window(
        &self,
        record: &SourceRecord,
        grid: &TileGrid,
    ) -> std::result::Result<Option<ElevationRaster>, SkipReason> {
        self.warp(record, grid).map_err(|e| {
            debug!("GDAL read failed for {}: {}", record.path.display(), e);
            SkipReason::ReadFailed {
                path: record.path.clone(),
                message: e.to_string(),
            }
        })
    }

    fn footprint(&self, path: &Path) -> std::result::Result<Footprint, SkipReason> {
        self.read_footprint(path)
            .map_err(|e| SkipReason::ReadFailed {
                path: PathBuf::from(path),
                message: e.to_string(),
            })
    }
}

/// テスト用のラスタサービス。ソースごとに一定値でフットプリントに掛かるセルを埋める。
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::path::Path;

    use super::{Footprint, RasterService};
    use crate::catalog::{MANIFEST_COLUMNS, MANIFEST_FILE};
    use crate::error::SkipReason;
    use crate::model::{Bounds, ElevationRaster, SourceRecord, TileGrid};

    #[derive(Debug, Default)]
    pub struct ConstantRasterService {
        values: HashMap<String, f32>,
        footprints: HashMap<String, Footprint>,
    }

    impl ConstantRasterService {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_source(mut self, source: &str, value: f32) -> Self {
            self.values.insert(source.to_string(), value);
            self
        }

        pub fn with_footprint(mut self, file_name: &str, bounds: Bounds) -> Self {
            self.footprints.insert(
                file_name.to_string(),
                Footprint {
                    bounds,
                    width: 256,
                    height: 256,
                },
            );
            self
        }
    }

    impl RasterService for ConstantRasterService {
        fn read_window(
            &self,
            record: &SourceRecord,
            grid: &TileGrid,
        ) -> Result<Option<ElevationRaster>, SkipReason> {
            let Some(&value) = self.values.get(&record.source) else {
                return Err(SkipReason::ReadFailed {
                    path: record.path.clone(),
                    message: "unknown source".to_string(),
                });
            };
            // セルの矩形がフットプリントに重なれば埋める
            let res_x = grid.bounds.width() / grid.width as f64;
            let res_y = grid.bounds.height() / grid.height as f64;
            let mut raster = ElevationRaster::nodata(grid.width, grid.height);
            for row in 0..grid.height {
                for col in 0..grid.width {
                    let left = grid.bounds.left + col as f64 * res_x;
                    let top = grid.bounds.top - row as f64 * res_y;
                    let cell = Bounds::new(left, top - res_y, left + res_x, top);
                    if record.bounds.intersects(&cell) {
                        raster.values[row * grid.width + col] = value;
                    }
                }
            }
            Ok((!raster.is_all_nodata()).then_some(raster))
        }

        fn footprint(&self, path: &Path) -> Result<Footprint, SkipReason> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.footprints
                .get(&name)
                .copied()
                .ok_or_else(|| SkipReason::ReadFailed {
                    path: path.to_path_buf(),
                    message: "not a raster".to_string(),
                })
        }
    }

    /// `<store_root>/<source>/` に空のラスタファイルと bounds.csv を置く
    pub fn write_source(store_root: &Path, source: &str, rasters: &[(&str, Bounds)]) {
        let dir = store_root.join(source);
        std::fs::create_dir_all(&dir).unwrap();
        let mut manifest = MANIFEST_COLUMNS.join(",");
        manifest.push('\n');
        for (name, b) in rasters {
            std::fs::write(dir.join(name), b"").unwrap();
            manifest.push_str(&format!(
                "{},{},{},{},{},256,256\n",
                name, b.left, b.bottom, b.right, b.top
            ));
        }
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }
}

//! MBTiles から PMTiles への変換

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use super::mbtiles::MbtilesReader;
use super::pmtiles::PmtilesSummary;
use super::spool::TileSpool;
use super::ArchiveInfo;
use crate::error::{MosaicError, Result};

const NATIVE_CONVERTERS: [&str; 2] = ["pmtiles", "pmtiles-cli"];

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// PATH 上の pmtiles コマンドを使うか
    pub allow_native: bool,
    pub overwrite: bool,
    pub temp_root: PathBuf,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            allow_native: true,
            overwrite: false,
            temp_root: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionMethod {
    Native(PathBuf),
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub method: ConversionMethod,
    /// 組み込み変換のときだけ埋まる
    pub summary: Option<PmtilesSummary>,
}

pub fn find_native_converter() -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    find_in_paths(std::env::split_paths(&paths))
}

fn find_in_paths<I>(dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    let dirs: Vec<PathBuf> = dirs.into_iter().collect();
    NATIVE_CONVERTERS.iter().find_map(|name| {
        dirs.iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

pub fn mbtiles_to_pmtiles(
    input: &Path,
    output: &Path,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    if !input.exists() {
        return Err(MosaicError::InputNotFound(input.to_path_buf()));
    }
    if output.exists() {
        if !options.overwrite {
            return Err(MosaicError::OutputExists(output.to_path_buf()));
        }
        std::fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    if options.allow_native {
        if let Some(program) = find_native_converter() {
            match convert_native(&program, input, output) {
                Ok(()) => {
                    return Ok(ConversionReport {
                        output: output.to_path_buf(),
                        method: ConversionMethod::Native(program),
                        summary: None,
                    })
                }
                Err(e) => warn!(
                    "{} failed ({}); falling back to built-in conversion",
                    program.display(),
                    e
                ),
            }
        }
    }

    let summary = convert_builtin(input, output, &options.temp_root)?;
    Ok(ConversionReport {
        output: output.to_path_buf(),
        method: ConversionMethod::Builtin,
        summary: Some(summary),
    })
}

fn convert_native(program: &Path, input: &Path, output: &Path) -> Result<()> {
    info!(
        "Converting {} -> {} with {}",
        input.display(),
        output.display(),
        program.display()
    );
    let result = Command::new(program)
        .arg("convert")
        .arg(input)
        .arg(output)
        .output()?;
    if result.status.success() {
        return Ok(());
    }

    // 失敗したら中途半端な出力を残さない
    if output.exists() {
        std::fs::remove_file(output)?;
    }
    Err(MosaicError::Io(std::io::Error::other(format!(
        "exit status {}: {}",
        result.status,
        String::from_utf8_lossy(&result.stderr).trim()
    ))))
}

/// 行を読み出して行番号を反転し、スプール経由で書く。
/// ズーム範囲と範囲は実際の行から計算し直す。
fn convert_builtin(input: &Path, output: &Path, temp_root: &Path) -> Result<PmtilesSummary> {
    info!(
        "Converting {} -> {} (built-in)",
        input.display(),
        output.display()
    );
    let reader = MbtilesReader::open(input)?;
    let fallback_name = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tiles".to_string());
    let archive_info = ArchiveInfo::from_metadata(&reader.metadata()?, &fallback_name);

    let mut spool = TileSpool::new(temp_root)?;
    reader.for_each_tile(|tile, data| spool.push(tile, data))?;
    spool.finish(output, &archive_info)
}

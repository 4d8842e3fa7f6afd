use std::path::PathBuf;

use tracing::warn;

use crate::codec::EncoderEffort;

pub const ENV_ENCODER_EFFORT: &str = "DEM_MOSAIC_ENCODER_EFFORT";
pub const ENV_TMPDIR: &str = "DEM_MOSAIC_TMPDIR";
pub const ENV_FORCE_PROGRESS: &str = "DEM_MOSAIC_FORCE_PROGRESS";

/// 環境変数による上書き。起動時に一度だけ読む。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub encoder_effort: Option<EncoderEffort>,
    pub temp_dir: Option<PathBuf>,
    pub force_progress: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let encoder_effort = lookup(ENV_ENCODER_EFFORT).and_then(|v| match v.parse() {
            Ok(effort) => Some(effort),
            Err(e) => {
                warn!("Ignoring {}: {}", ENV_ENCODER_EFFORT, e);
                None
            }
        });

        let temp_dir = lookup(ENV_TMPDIR)
            .or_else(|| lookup("TMPDIR"))
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let force_progress = lookup(ENV_FORCE_PROGRESS)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            encoder_effort,
            temp_dir,
            force_progress,
        }
    }

    /// スプール用ディレクトリ。指定がなければ OS の既定。
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dem_mosaic::catalog::write_manifest;
use dem_mosaic::codec::TileFormat;
use dem_mosaic::model::LngLatBbox;
use dem_mosaic::monitor::WatchdogLimits;
use dem_mosaic::orchestrator::{run_group, GroupExecution, GroupJob, SplitAggregate, SplitAggregateOptions};
use dem_mosaic::split::{
    create_custom_split, get_split_pattern, split_summary, validate_split_pattern,
    DEFAULT_SPLIT_MAX_ZOOM,
};
use dem_mosaic::writer::convert::{mbtiles_to_pmtiles, ConvertOptions};
use dem_mosaic::writer::DEFAULT_ATTRIBUTION;
use dem_mosaic::{
    merge_mbtiles, run_aggregate, AggregateOptions, CancelToken, EnvOverrides, GdalRasterService,
    MergeOptions, MosaicError,
};
use rayon::ThreadPoolBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 並列処理スレッド数（デフォルト: CPUコア数）
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// ソースコレクションを優先度順に合成して1つのアーカイブを作る
    Generate(AggregateArgs),

    /// ズームを分割して処理し、最後にマージして変換する
    SplitAggregate(SplitArgs),

    /// 複数の MBTiles を重複チェックしながら1つにまとめる
    Merge {
        /// 入力 MBTiles
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,

        /// 出力 MBTiles
        #[arg(short, long)]
        output: PathBuf,

        /// 重複チェックを省略する
        #[arg(long)]
        no_verify: bool,

        #[arg(long)]
        overwrite: bool,
    },

    /// MBTiles を PMTiles に変換する
    Convert {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        overwrite: bool,

        /// pmtiles コマンドを使わず組み込みの変換を使う
        #[arg(long)]
        builtin: bool,
    },

    /// 分割パターンと推定値を表示する
    Patterns {
        #[arg(long, default_value = "balanced")]
        pattern: String,

        /// 目標メモリからパターンを作る
        #[arg(long)]
        custom: bool,

        /// グループあたりの目標メモリ (GB)
        #[arg(long, default_value_t = 10.0)]
        target_memory: f64,

        #[arg(long, default_value_t = DEFAULT_SPLIT_MAX_ZOOM)]
        max_zoom: u8,

        #[arg(long, num_args = 4, value_names = ["WEST", "SOUTH", "EAST", "NORTH"], allow_negative_numbers = true)]
        bbox: Option<Vec<f64>>,
    },

    /// GeoTIFF ディレクトリの bounds.csv を作る
    Bounds {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// 1グループ分を実行する (split-aggregate が起動する)
    #[command(hide = true)]
    RunGroup {
        #[arg(long)]
        job: PathBuf,
    },
}

#[derive(Args, Debug)]
struct AggregateArgs {
    /// 優先度の高い順に並べたソースコレクション名
    #[arg(value_name = "SOURCE", required = true)]
    sources: Vec<String>,

    /// 出力ファイル (.mbtiles または .pmtiles)
    #[arg(short, long)]
    output: PathBuf,

    /// ソースコレクションを置いたディレクトリ
    #[arg(long, default_value = "source-store")]
    store_root: PathBuf,

    #[arg(long, default_value_t = 0)]
    min_zoom: u8,

    /// 省略時はソースの解像度から決める
    #[arg(long)]
    max_zoom: Option<u8>,

    #[arg(long, num_args = 4, value_names = ["WEST", "SOUTH", "EAST", "NORTH"], allow_negative_numbers = true)]
    bbox: Option<Vec<f64>>,

    #[arg(long, default_value = "webp")]
    format: TileFormat,

    #[arg(long, default_value = DEFAULT_ATTRIBUTION)]
    attribution: String,

    /// 供給元ソースの可視化タイルも出力する
    #[arg(long)]
    lineage: bool,

    #[arg(long)]
    overwrite: bool,

    /// 既存の MBTiles に追記する
    #[arg(long)]
    append: bool,

    /// GDAL の warp スレッド数
    #[arg(long, default_value_t = 1)]
    warp_threads: usize,

    #[arg(long, default_value_t = 500)]
    progress_interval: u64,

    /// タイルごとのスリープ (ミリ秒)
    #[arg(long)]
    io_sleep_ms: Option<u64>,

    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// スプールや作業ファイルの置き場所
    #[arg(long)]
    tmpdir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SplitArgs {
    #[command(flatten)]
    aggregate: AggregateArgs,

    /// 分割パターン (single, balanced, safe, fast, incremental)
    #[arg(long, default_value = "balanced")]
    split_pattern: String,

    /// 指定したグループから再開する (0 始まり)
    #[arg(long)]
    resume_from: Option<usize>,

    /// 中間 MBTiles を残す
    #[arg(long)]
    keep_intermediates: bool,

    /// グループを子プロセスに分けずに実行する
    #[arg(long)]
    no_spawn: bool,

    #[arg(long)]
    watchdog_memory_mb: Option<u64>,

    #[arg(long)]
    watchdog_time_seconds: Option<u64>,

    #[arg(long, default_value_t = 0.5)]
    watchdog_interval_seconds: f64,

    /// Ctrl-C 後、子プロセスが自分で終了するのを待つ秒数
    #[arg(long, default_value_t = 30)]
    interrupt_grace_seconds: u64,

    /// pmtiles コマンドを使わず組み込みの変換を使う
    #[arg(long)]
    builtin_convert: bool,
}

fn parse_bbox(values: Option<&[f64]>) -> Result<Option<LngLatBbox>> {
    match values {
        None => Ok(None),
        Some([west, south, east, north]) => {
            if west >= east || south >= north {
                anyhow::bail!("Invalid bbox: {west},{south},{east},{north}");
            }
            Ok(Some(LngLatBbox::new(*west, *south, *east, *north)))
        }
        Some(other) => anyhow::bail!("--bbox needs 4 values, got {}", other.len()),
    }
}

impl AggregateArgs {
    fn to_options(&self, env: &EnvOverrides) -> Result<AggregateOptions> {
        let mut options = AggregateOptions {
            store_root: self.store_root.clone(),
            sources: self.sources.clone(),
            output: self.output.clone(),
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            bbox: parse_bbox(self.bbox.as_deref())?,
            format: self.format,
            attribution: self.attribution.clone(),
            lineage: self.lineage,
            overwrite: self.overwrite,
            append: self.append,
            gdal_threads: self.warp_threads,
            progress_interval: self.progress_interval,
            io_sleep_ms: self.io_sleep_ms,
            batch_size: self.batch_size,
            temp_dir: self.tmpdir.clone(),
            ..AggregateOptions::default()
        };
        options.apply_env(env);
        Ok(options)
    }
}

fn main() -> ExitCode {
    // ログの初期化
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Ctrl-C で中断フラグを立てる。ループ側が見て後始末をする。
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupt received, finishing current tile...");
        handler_token.cancel();
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let start_time = std::time::Instant::now();
    match run(cli, &cancel) {
        Ok(()) => {
            info!("Total processing time: {:?}", start_time.elapsed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            let interrupted = e
                .downcast_ref::<MosaicError>()
                .is_some_and(MosaicError::is_interrupted);
            if interrupted {
                ExitCode::from(130)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli, cancel: &CancelToken) -> Result<()> {
    // スレッドプールの設定
    if let Some(threads) = cli.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to build thread pool")?;
    }
    let env = EnvOverrides::from_env();

    match cli.command {
        Command::Generate(args) => generate(&args, &env, cancel),
        Command::SplitAggregate(args) => split_aggregate(&args, &env, cancel),
        Command::Merge {
            inputs,
            output,
            no_verify,
            overwrite,
        } => {
            let summary = merge_mbtiles(
                &inputs,
                &output,
                &MergeOptions {
                    verify: !no_verify,
                    overwrite,
                    ..MergeOptions::default()
                },
            )
            .with_context(|| format!("Failed to merge into {}", output.display()))?;
            info!(
                "Merged {} tiles into {}",
                summary.total_tiles,
                summary.output.display()
            );
            Ok(())
        }
        Command::Convert {
            input,
            output,
            overwrite,
            builtin,
        } => {
            let options = ConvertOptions {
                allow_native: !builtin,
                overwrite,
                temp_root: env.temp_root(),
            };
            let report = mbtiles_to_pmtiles(&input, &output, &options)
                .with_context(|| format!("Failed to convert {}", input.display()))?;
            info!("PMTiles created: {} ({:?})", report.output.display(), report.method);
            Ok(())
        }
        Command::Patterns {
            pattern,
            custom,
            target_memory,
            max_zoom,
            bbox,
        } => {
            let bbox = parse_bbox(bbox.as_deref())?;
            let groups = if custom {
                println!("Custom split pattern (target: {target_memory}GB per group):");
                create_custom_split(max_zoom, target_memory, bbox.as_ref())
            } else {
                println!("Split pattern: {pattern}");
                get_split_pattern(&pattern)?
            };
            validate_split_pattern(&groups, max_zoom)?;
            println!("{}", split_summary(&groups));
            Ok(())
        }
        Command::Bounds { dir } => {
            let service = GdalRasterService::new(1)?;
            let count = write_manifest(&dir, &service)
                .with_context(|| format!("Failed to write bounds for {}", dir.display()))?;
            info!("Wrote {} entries to {}", count, dir.join("bounds.csv").display());
            Ok(())
        }
        Command::RunGroup { job } => {
            let job = GroupJob::read(&job)
                .with_context(|| format!("Failed to read job file {}", job.display()))?;
            let service = GdalRasterService::new(job.aggregate.gdal_threads)?;
            let report = run_group(&job, &service, cancel)?;
            info!(
                "Group {} finished: {} tiles in {}",
                job.group.name(),
                report.tiles,
                report.output.display()
            );
            Ok(())
        }
    }
}

fn generate(args: &AggregateArgs, env: &EnvOverrides, cancel: &CancelToken) -> Result<()> {
    let options = args.to_options(env)?;
    let service = GdalRasterService::new(options.gdal_threads)?;
    let report = run_aggregate(&options, &service, cancel)
        .with_context(|| format!("Failed to generate {}", options.output.display()))?;

    info!(
        "Generated {} tiles (z{}-{}) into {}",
        report.tiles,
        options.min_zoom,
        report.max_zoom,
        report.output.display()
    );
    if let Some(lineage) = report.lineage {
        info!("Lineage tiles: {} ({} tiles)", lineage.path.display(), lineage.tiles);
    }
    Ok(())
}

fn worker_execution(no_spawn: bool) -> Result<GroupExecution> {
    if no_spawn {
        return Ok(GroupExecution::InProcess);
    }
    let program = std::env::current_exe().context("Failed to locate the current executable")?;
    Ok(GroupExecution::Spawn {
        program,
        args: vec!["run-group".to_string()],
    })
}

fn split_aggregate(args: &SplitArgs, env: &EnvOverrides, cancel: &CancelToken) -> Result<()> {
    let aggregate = args.aggregate.to_options(env)?;
    let groups = get_split_pattern(&args.split_pattern)?;

    let mut options = SplitAggregateOptions::new(aggregate, groups);
    options.resume_from = args.resume_from;
    options.keep_intermediates = args.keep_intermediates;
    options.execution = worker_execution(args.no_spawn)?;
    options.native_converter = !args.builtin_convert;
    options.interrupt_grace = Duration::from_secs(args.interrupt_grace_seconds);
    options.watchdog = WatchdogLimits {
        max_memory_bytes: args.watchdog_memory_mb.map(|mb| mb * 1024 * 1024),
        max_duration: args.watchdog_time_seconds.map(Duration::from_secs),
        interval: Duration::from_secs_f64(args.watchdog_interval_seconds.max(0.1)),
    };

    let service = GdalRasterService::new(options.aggregate.gdal_threads)?;
    let output = options.aggregate.output.clone();
    let report = SplitAggregate::new(options, &service, cancel.clone())
        .run()
        .with_context(|| format!("Split aggregate failed for {}", output.display()))?;

    info!("Output: {}", report.output.display());
    if report.merged != report.output && Path::new(&report.merged).exists() {
        info!("MBTiles: {}", report.merged.display());
    }
    info!(
        "{} tiles from {} groups ({} resumed), telemetry in {}",
        report.total_tiles,
        report.groups_run + report.groups_skipped,
        report.groups_skipped,
        report.telemetry.display()
    );
    Ok(())
}

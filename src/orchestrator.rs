//! ズーム分割による集約処理
//!
//! ズームグループごとに中間 MBTiles を作り、最後にマージして変換する。
//! グループは順番に1つずつ処理する。子プロセスで実行すればグループ終了時にメモリが確実に OS へ戻る。

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::{build_records_from_sources, coverage_bbox};
use crate::error::{MosaicError, Result};
use crate::generator::CancelToken;
use crate::merge::{merge_mbtiles, MergeOptions};
use crate::model::LngLatBbox;
use crate::monitor::{current_rss, format_bytes, Breach, Watchdog, WatchdogLimits, WatchdogReport};
use crate::pipeline::{run_aggregate, AggregateOptions, AggregateReport, OutputKind};
use crate::raster::RasterService;
use crate::split::{split_summary, validate_split_pattern, ZoomGroup, DEFAULT_SPLIT_MAX_ZOOM};
use crate::writer::convert::{mbtiles_to_pmtiles, ConversionMethod, ConvertOptions};
use crate::writer::mbtiles::remove_mbtiles;

/// Ctrl-C で終了したワーカーの終了コード
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

pub const TELEMETRY_HEADER: &str = "timestamp,group_index,group_name,min_zoom,max_zoom,rss_before_bytes,rss_after_bytes,rss_delta_bytes,uss_peak_bytes,uss_tier,elapsed_seconds,outcome";

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// 中断後、ワーカーが部分メタデータを書いて自分で終了するまで待つ時間
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(30);

/// ワーカーに渡す1グループ分の仕事
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupJob {
    pub index: usize,
    pub group: ZoomGroup,
    pub aggregate: AggregateOptions,
}

impl GroupJob {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// ワーカー側の処理本体
pub fn run_group(
    job: &GroupJob,
    service: &dyn RasterService,
    cancel: &CancelToken,
) -> Result<AggregateReport> {
    info!(
        "Running group {} ({}) into {}",
        job.index,
        job.group.name(),
        job.aggregate.output.display()
    );
    run_aggregate(&job.aggregate, service, cancel)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupExecution {
    InProcess,
    /// `program args... --job <json>` を子プロセスとして起動する
    Spawn { program: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Loading,
    Group(usize),
    Merging,
    Converting,
    Cleanup,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Loading => write!(f, "loading"),
            RunPhase::Group(i) => write!(f, "group {i}"),
            RunPhase::Merging => write!(f, "merging"),
            RunPhase::Converting => write!(f, "converting"),
            RunPhase::Cleanup => write!(f, "cleanup"),
            RunPhase::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    Ok,
    Failed,
    ResourceLimit,
    Interrupted,
}

impl GroupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupOutcome::Ok => "ok",
            GroupOutcome::Failed => "failed",
            GroupOutcome::ResourceLimit => "resource_limit",
            GroupOutcome::Interrupted => "interrupted",
        }
    }

    fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => GroupOutcome::Ok,
            Err(MosaicError::Interrupted) => GroupOutcome::Interrupted,
            Err(MosaicError::ResourceLimit { .. }) => GroupOutcome::ResourceLimit,
            Err(_) => GroupOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub group_index: usize,
    pub group: ZoomGroup,
    pub rss_before: Option<u64>,
    pub rss_after: Option<u64>,
    pub watchdog: WatchdogReport,
    pub elapsed: Duration,
    pub outcome: GroupOutcome,
}

impl TelemetryRow {
    pub fn to_csv(&self, timestamp: &str) -> String {
        let opt = |v: Option<u64>| v.map(|b| b.to_string()).unwrap_or_default();
        let delta = match (self.rss_before, self.rss_after) {
            (Some(before), Some(after)) => (after as i64 - before as i64).to_string(),
            _ => String::new(),
        };
        let (peak, tier) = match self.watchdog.peak {
            Some(sample) => (sample.bytes.to_string(), sample.tier.as_str()),
            None => ("0".to_string(), ""),
        };
        format!(
            "{},{},{},{},{},{},{},{},{},{},{:.3},{}",
            timestamp,
            self.group_index,
            self.group.name(),
            self.group.min_zoom,
            self.group.max_zoom,
            opt(self.rss_before),
            opt(self.rss_after),
            delta,
            peak,
            tier,
            self.elapsed.as_secs_f64(),
            self.outcome.as_str()
        )
    }
}

/// グループごとのメモリ・時間の記録 (`<stem>_uss_summary.csv`)
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
}

impl TelemetryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &TelemetryRow) -> Result<()> {
        let write_header = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if write_header {
            writeln!(file, "{TELEMETRY_HEADER}")?;
        }
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        writeln!(file, "{}", row.to_csv(&timestamp))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SplitAggregateOptions {
    /// output は最終出力 (.pmtiles なら変換まで行う)
    pub aggregate: AggregateOptions,
    pub groups: Vec<ZoomGroup>,
    /// 0 始まりのグループ番号。これより前は既存の中間ファイルを使う。
    pub resume_from: Option<usize>,
    pub keep_intermediates: bool,
    pub execution: GroupExecution,
    pub watchdog: WatchdogLimits,
    pub native_converter: bool,
    pub interrupt_grace: Duration,
}

impl SplitAggregateOptions {
    pub fn new(aggregate: AggregateOptions, groups: Vec<ZoomGroup>) -> Self {
        Self {
            aggregate,
            groups,
            resume_from: None,
            keep_intermediates: false,
            execution: GroupExecution::InProcess,
            watchdog: WatchdogLimits::default(),
            native_converter: true,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
        }
    }

    fn output_dir(&self) -> PathBuf {
        self.aggregate
            .output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn stem(&self) -> String {
        self.aggregate
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tiles".to_string())
    }

    /// `<stem>_<group>.mbtiles`
    pub fn intermediate_path(&self, group: &ZoomGroup) -> PathBuf {
        self.output_dir()
            .join(format!("{}_{}.mbtiles", self.stem(), group.name()))
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.output_dir()
            .join(format!("{}_uss_summary.csv", self.stem()))
    }

    /// マージ結果。出力が .mbtiles ならそれ自身。
    pub fn merged_path(&self) -> PathBuf {
        self.aggregate.output.with_extension("mbtiles")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitAggregateReport {
    pub output: PathBuf,
    pub merged: PathBuf,
    pub groups_run: usize,
    pub groups_skipped: usize,
    pub total_tiles: u64,
    /// 変換しなかった、または失敗した場合は None
    pub conversion: Option<ConversionMethod>,
    pub telemetry: PathBuf,
}

pub struct SplitAggregate<'a> {
    options: SplitAggregateOptions,
    service: &'a dyn RasterService,
    cancel: CancelToken,
    phase: RunPhase,
}

impl<'a> SplitAggregate<'a> {
    pub fn new(
        options: SplitAggregateOptions,
        service: &'a dyn RasterService,
        cancel: CancelToken,
    ) -> Self {
        Self {
            options,
            service,
            cancel,
            phase: RunPhase::Loading,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        info!("Phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    pub fn run(&mut self) -> Result<SplitAggregateReport> {
        let max_zoom = self
            .options
            .aggregate
            .max_zoom
            .unwrap_or(DEFAULT_SPLIT_MAX_ZOOM);
        validate_split_pattern(&self.options.groups, max_zoom)?;
        let groups = self.options.groups.clone();
        let start = self.options.resume_from.unwrap_or(0);
        if start >= groups.len() {
            return Err(MosaicError::ResumeOutOfRange {
                index: start,
                groups: groups.len(),
            });
        }

        info!("Output: {}", self.options.aggregate.output.display());
        info!("Sources: {}", self.options.aggregate.sources.join(", "));
        info!("{}", split_summary(&groups));
        info!(
            "Spawn-per-group is {}",
            match self.options.execution {
                GroupExecution::InProcess => "disabled",
                GroupExecution::Spawn { .. } => "enabled",
            }
        );

        // Loading: 前提条件をここで確認してからグループに入る
        if self.options.aggregate.sources.is_empty() {
            return Err(MosaicError::NoSources);
        }
        if !self.options.aggregate.overwrite {
            for path in [self.options.aggregate.output.clone(), self.options.merged_path()] {
                if path.exists() {
                    return Err(MosaicError::OutputExists(path));
                }
            }
        }
        std::fs::create_dir_all(self.options.output_dir())?;
        let records = build_records_from_sources(
            &self.options.aggregate.store_root,
            &self.options.aggregate.sources,
        )?;
        let bbox = coverage_bbox(&records, self.options.aggregate.bbox)?;
        info!("Loaded {} source records", records.len());
        drop(records);

        let mut intermediates = Vec::with_capacity(groups.len());
        for (index, group) in groups.iter().enumerate().take(start) {
            let path = self.options.intermediate_path(group);
            if !path.exists() {
                return Err(MosaicError::ResumeFileMissing(path));
            }
            info!(
                "Skipping group {}/{} (resume): {}",
                index + 1,
                groups.len(),
                group.name()
            );
            intermediates.push(path);
        }

        let telemetry = TelemetryLog::new(self.options.telemetry_path());
        for (index, group) in groups.iter().enumerate().skip(start) {
            self.enter(RunPhase::Group(index));
            info!("Processing group {}/{}: {}", index + 1, groups.len(), group);

            let job = self.job_for(index, group, bbox);
            let rss_before = current_rss();
            let started = Instant::now();

            let (result, report) = match &self.options.execution {
                GroupExecution::InProcess => self.run_in_process(&job),
                GroupExecution::Spawn { program, args } => {
                    let (program, args) = (program.clone(), args.clone());
                    self.run_spawned(&job, &program, &args)
                }
            };

            let row = TelemetryRow {
                group_index: index,
                group: *group,
                rss_before,
                rss_after: current_rss(),
                watchdog: report,
                elapsed: started.elapsed(),
                outcome: GroupOutcome::of(&result),
            };
            if let Some(peak) = row.watchdog.peak {
                info!(
                    "Peak {} during group {}: {}",
                    peak.tier.as_str(),
                    index + 1,
                    format_bytes(peak.bytes)
                );
            }
            if let Err(e) = telemetry.append(&row) {
                warn!("Failed to write telemetry to {}: {}", telemetry.path().display(), e);
            }

            if let Err(e) = result {
                error!(
                    "Error processing group {}/{} ({}): {}",
                    index + 1,
                    groups.len(),
                    group.name(),
                    e
                );
                error!("To resume from this group, use: --resume-from {}", index);
                return Err(e);
            }
            info!(
                "Group {}/{} completed in {:.1} minutes",
                index + 1,
                groups.len(),
                row.elapsed.as_secs_f64() / 60.0
            );
            intermediates.push(job.aggregate.output.clone());
        }

        self.enter(RunPhase::Merging);
        let merged = self.options.merged_path();
        let merge_summary = merge_mbtiles(
            &intermediates,
            &merged,
            &MergeOptions {
                verify: true,
                overwrite: self.options.aggregate.overwrite,
                batch_size: self.options.aggregate.batch_size,
            },
        )?;

        let mut conversion = None;
        if OutputKind::for_path(&self.options.aggregate.output) == OutputKind::Pmtiles {
            self.enter(RunPhase::Converting);
            let convert_options = ConvertOptions {
                allow_native: self.options.native_converter,
                overwrite: self.options.aggregate.overwrite,
                temp_root: self.options.aggregate.temp_root(),
            };
            match mbtiles_to_pmtiles(&merged, &self.options.aggregate.output, &convert_options) {
                Ok(report) => {
                    info!("PMTiles created: {}", report.output.display());
                    conversion = Some(report.method);
                }
                Err(e @ MosaicError::OutputExists(_)) => return Err(e),
                Err(e) => {
                    warn!("PMTiles conversion failed: {}", e);
                    warn!("MBTiles is available at: {}", merged.display());
                }
            }
        }

        self.enter(RunPhase::Cleanup);
        if conversion.is_some() && merged != self.options.aggregate.output {
            let size = std::fs::metadata(&merged).map(|m| m.len()).unwrap_or(0);
            info!(
                "Merged MBTiles is kept next to the PMTiles archive: {} ({})",
                merged.display(),
                format_bytes(size)
            );
        }
        if self.options.keep_intermediates {
            info!("Keeping {} intermediate files", intermediates.len());
        } else {
            for path in intermediates.iter().filter(|p| **p != merged) {
                match remove_mbtiles(path) {
                    Ok(()) => debug!("Removed {}", path.display()),
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        self.enter(RunPhase::Done);
        Ok(SplitAggregateReport {
            output: self.options.aggregate.output.clone(),
            merged,
            groups_run: groups.len() - start,
            groups_skipped: start,
            total_tiles: merge_summary.total_tiles,
            conversion,
            telemetry: telemetry.path().to_path_buf(),
        })
    }

    /// 中間ファイルはこの実行の持ち物なので常に作り直す
    fn job_for(&self, index: usize, group: &ZoomGroup, bbox: LngLatBbox) -> GroupJob {
        let mut aggregate = self.options.aggregate.clone();
        aggregate.output = self.options.intermediate_path(group);
        aggregate.min_zoom = group.min_zoom;
        aggregate.max_zoom = Some(group.max_zoom);
        aggregate.bbox = Some(bbox);
        aggregate.overwrite = true;
        aggregate.append = false;
        if aggregate.lineage {
            warn!("Lineage output is not produced in split mode");
            aggregate.lineage = false;
        }
        GroupJob {
            index,
            group: *group,
            aggregate,
        }
    }

    fn resource_error(job: &GroupJob, breach: &Breach) -> MosaicError {
        MosaicError::ResourceLimit {
            index: job.index,
            name: job.group.name(),
            breach: breach.to_string(),
        }
    }

    fn run_in_process(&self, job: &GroupJob) -> (Result<()>, WatchdogReport) {
        // 同一プロセス内ではキャンセルで協調的に止める
        let group_cancel = self.cancel.child();
        let breach_cancel = group_cancel.clone();
        let watchdog = Watchdog::spawn(std::process::id(), self.options.watchdog, move |_| {
            breach_cancel.cancel()
        });

        let result = run_group(job, self.service, &group_cancel).map(|_| ());
        let report = watchdog.stop();

        let stopped_by_watchdog =
            matches!(result, Err(MosaicError::Interrupted)) && !self.cancel.is_cancelled();
        let result = match report.breach {
            Some(breach) if stopped_by_watchdog => Err(Self::resource_error(job, &breach)),
            _ => result,
        };
        (result, report)
    }

    fn run_spawned(
        &self,
        job: &GroupJob,
        program: &Path,
        args: &[String],
    ) -> (Result<()>, WatchdogReport) {
        let job_path = self
            .options
            .aggregate
            .temp_root()
            .join(format!("{}_{}_job.json", self.options.stem(), job.group.name()));
        let written = job_path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .map_err(MosaicError::from)
            .and_then(|()| job.write(&job_path));
        if let Err(e) = written {
            return (Err(e), WatchdogReport::default());
        }

        let result = spawn_worker(
            program,
            args,
            &job_path,
            self.options.watchdog,
            &self.cancel,
            self.options.interrupt_grace,
        );
        if let Err(e) = std::fs::remove_file(&job_path) {
            debug!("Failed to remove {}: {}", job_path.display(), e);
        }

        match result {
            Ok((status, report)) => {
                let outcome = if let Some(breach) = report.breach {
                    Err(Self::resource_error(job, &breach))
                } else {
                    status_to_result(job, status, &self.cancel)
                };
                (outcome, report)
            }
            Err(e) => (Err(e), WatchdogReport::default()),
        }
    }
}

/// 子プロセスを起動して終了を待つ。
///
/// ウォッチドッグが上限超過を検出したら子プロセスを kill する。
/// 中断時は同じ Ctrl-C を受けた子プロセスが後始末を終えるまで `grace` だけ待ち、
/// それでも残っていれば kill する。
pub fn spawn_worker(
    program: &Path,
    args: &[String],
    job_path: &Path,
    limits: WatchdogLimits,
    cancel: &CancelToken,
    grace: Duration,
) -> Result<(ExitStatus, WatchdogReport)> {
    info!(
        "Spawning worker: {} {} --job {}",
        program.display(),
        args.join(" "),
        job_path.display()
    );
    let child = Command::new(program)
        .args(args)
        .arg("--job")
        .arg(job_path)
        .spawn()?;
    let pid = child.id();
    let child = Arc::new(Mutex::new(child));

    let killer = child.clone();
    let watchdog = Watchdog::spawn(pid, limits, move |breach| {
        warn!("Terminating worker {}: {}", pid, breach);
        if let Ok(mut child) = killer.lock() {
            if let Err(e) = child.kill() {
                warn!("Failed to kill worker {}: {}", pid, e);
            }
        }
    });

    let status = wait_for_child(&child, cancel, grace);
    let report = watchdog.stop();
    Ok((status?, report))
}

fn wait_for_child(
    child: &Arc<Mutex<Child>>,
    cancel: &CancelToken,
    grace: Duration,
) -> Result<ExitStatus> {
    let mut interrupted_at: Option<Instant> = None;
    let mut kill_sent = false;
    loop {
        {
            let mut guard = child
                .lock()
                .map_err(|_| std::io::Error::other("worker handle poisoned"))?;
            if let Some(status) = guard.try_wait()? {
                return Ok(status);
            }
            if cancel.is_cancelled() && !kill_sent {
                let pid = guard.id();
                let since = *interrupted_at.get_or_insert_with(|| {
                    warn!(
                        "Interrupt received; waiting up to {:.0?} for worker {} to exit",
                        grace, pid
                    );
                    Instant::now()
                });
                if since.elapsed() >= grace {
                    warn!("Worker {} is still running; killing it", pid);
                    guard.kill()?;
                    kill_sent = true;
                }
            }
        }
        std::thread::sleep(WAIT_SLICE);
    }
}

fn status_to_result(job: &GroupJob, status: ExitStatus, cancel: &CancelToken) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    if cancel.is_cancelled() || status.code() == Some(INTERRUPTED_EXIT_CODE) {
        return Err(MosaicError::Interrupted);
    }
    Err(MosaicError::GroupFailed {
        index: job.index,
        name: job.group.name(),
        reason: format!("worker exited with {status}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MemorySample, MemoryTier};

    fn job() -> GroupJob {
        GroupJob {
            index: 2,
            group: ZoomGroup::with_estimate(12, 12, 130_000, 7.0),
            aggregate: AggregateOptions {
                sources: vec!["dem1a".to_string(), "dem5a".to_string()],
                output: PathBuf::from("out/japan_z12.mbtiles"),
                ..AggregateOptions::default()
            },
        }
    }

    #[test]
    fn test_job_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        let job = job();
        job.write(&path).unwrap();
        assert_eq!(GroupJob::read(&path).unwrap(), job);
    }

    #[test]
    fn test_paths() {
        let aggregate = AggregateOptions {
            output: PathBuf::from("output/fusi.pmtiles"),
            ..AggregateOptions::default()
        };
        let options = SplitAggregateOptions::new(aggregate, vec![]);
        let group = ZoomGroup::with_estimate(0, 10, 0, 0.0);
        assert_eq!(
            options.intermediate_path(&group),
            PathBuf::from("output/fusi_z0-10.mbtiles")
        );
        assert_eq!(
            options.telemetry_path(),
            PathBuf::from("output/fusi_uss_summary.csv")
        );
        assert_eq!(options.merged_path(), PathBuf::from("output/fusi.mbtiles"));
    }

    #[test]
    fn test_telemetry_row() {
        let row = TelemetryRow {
            group_index: 1,
            group: ZoomGroup::with_estimate(11, 12, 0, 0.0),
            rss_before: Some(1000),
            rss_after: Some(400),
            watchdog: WatchdogReport {
                peak: Some(MemorySample {
                    bytes: 2048,
                    tier: MemoryTier::Unique,
                }),
                breach: None,
                samples: 3,
            },
            elapsed: Duration::from_millis(1500),
            outcome: GroupOutcome::Ok,
        };
        assert_eq!(
            row.to_csv("2024-01-01T00:00:00.000Z"),
            "2024-01-01T00:00:00.000Z,1,z11-12,11,12,1000,400,-600,2048,uss,1.500,ok"
        );
        assert_eq!(TELEMETRY_HEADER.split(',').count(), row.to_csv("t").split(',').count());
    }

    #[test]
    fn test_telemetry_header_written_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = TelemetryLog::new(dir.path().join("t_uss_summary.csv"));
        let row = TelemetryRow {
            group_index: 0,
            group: ZoomGroup::with_estimate(0, 1, 0, 0.0),
            rss_before: None,
            rss_after: None,
            watchdog: WatchdogReport::default(),
            elapsed: Duration::ZERO,
            outcome: GroupOutcome::Failed,
        };
        log.append(&row).unwrap();
        log.append(&row).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TELEMETRY_HEADER);
        assert!(lines[1].ends_with(",0,,0.000,failed"));
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_exit_codes() {
        let dir = tempfile::TempDir::new().unwrap();
        let job_path = dir.path().join("job.json");
        let cancel = CancelToken::new();
        let run = |code: i32| {
            let args = vec!["-c".to_string(), format!("exit {code}"), "sh".to_string()];
            let (status, _) = spawn_worker(
                Path::new("/bin/sh"),
                &args,
                &job_path,
                WatchdogLimits::default(),
                &cancel,
                DEFAULT_INTERRUPT_GRACE,
            )
            .unwrap();
            status_to_result(&job(), status, &cancel)
        };

        assert!(run(0).is_ok());
        assert!(matches!(run(130), Err(MosaicError::Interrupted)));
        let err = run(3).unwrap_err();
        assert!(matches!(err, MosaicError::GroupFailed { index: 2, .. }));
        assert!(err.to_string().contains("resume from group 2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_interrupted_worker_gets_grace_period() {
        let dir = tempfile::TempDir::new().unwrap();
        let job_path = dir.path().join("job.json");
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = |grace: Duration| {
            // Ctrl-C を受けたワーカーが後始末をしてから 130 で終わる
            let args = vec!["-c".to_string(), "sleep 0.5; exit 130".to_string(), "sh".to_string()];
            let (status, _) = spawn_worker(
                Path::new("/bin/sh"),
                &args,
                &job_path,
                WatchdogLimits::default(),
                &cancel,
                grace,
            )
            .unwrap();
            status
        };

        assert_eq!(run(Duration::from_secs(10)).code(), Some(INTERRUPTED_EXIT_CODE));
        // 猶予なしなら待たずに kill する
        assert_eq!(run(Duration::ZERO).code(), None);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RunPhase::Group(3).to_string(), "group 3");
        assert_eq!(RunPhase::Converting.to_string(), "converting");
    }

    fn split_options(root: &Path) -> SplitAggregateOptions {
        use crate::codec::TileFormat;
        use crate::model::TileCoord;
        use crate::raster::fake::write_source;

        let left = TileCoord::new(8, 100, 100).xy_bounds();
        let right = TileCoord::new(8, 101, 100).xy_bounds();
        write_source(root, "dem1a", &[("primary.tif", left)]);
        write_source(root, "dem5a", &[("fallback.tif", left.union(&right))]);

        let aggregate = AggregateOptions {
            store_root: root.to_path_buf(),
            sources: vec!["dem1a".to_string(), "dem5a".to_string()],
            output: root.join("out").join("japan.pmtiles"),
            max_zoom: Some(8),
            format: TileFormat::Png,
            tile_size: 8,
            lineage: true,
            temp_dir: Some(root.join("tmp")),
            ..AggregateOptions::default()
        };
        let mut options =
            SplitAggregateOptions::new(aggregate, vec![ZoomGroup::new(0, 4), ZoomGroup::new(5, 8)]);
        options.native_converter = false;
        options
    }

    #[test]
    fn test_split_run_and_resume_in_process() {
        use crate::raster::fake::ConstantRasterService;
        use crate::writer::{MbtilesReader, PmtilesReader};

        let dir = tempfile::TempDir::new().unwrap();
        let service = ConstantRasterService::new()
            .with_source("dem1a", 96.0)
            .with_source("dem5a", 48.0);

        let mut options = split_options(dir.path());
        options.keep_intermediates = true;
        let first = options.intermediate_path(&options.groups[0]);
        let second = options.intermediate_path(&options.groups[1]);

        let mut run = SplitAggregate::new(options.clone(), &service, CancelToken::new());
        let report = run.run().unwrap();
        assert_eq!(run.phase(), RunPhase::Done);
        assert_eq!(report.groups_run, 2);
        assert_eq!(report.conversion, Some(ConversionMethod::Builtin));
        assert!(first.exists() && second.exists());
        assert!(!dir.path().join("out").join("japan_lineage.mbtiles").exists());

        let merged = MbtilesReader::open(&report.merged).unwrap();
        assert_eq!(merged.tile_count().unwrap(), report.total_tiles);
        let extent = merged.extent().unwrap();
        assert_eq!((extent.min_zoom, extent.max_zoom), (Some(0), Some(8)));
        let pmtiles = PmtilesReader::open(&report.output).unwrap();
        assert_eq!(pmtiles.header().max_zoom, 8);

        // 2番目のグループだけやり直す
        options.resume_from = Some(1);
        options.keep_intermediates = false;
        options.aggregate.overwrite = true;
        let report = SplitAggregate::new(options.clone(), &service, CancelToken::new())
            .run()
            .unwrap();
        assert_eq!((report.groups_run, report.groups_skipped), (1, 1));
        assert!(!first.exists() && !second.exists());

        let telemetry = std::fs::read_to_string(&report.telemetry).unwrap();
        let lines: Vec<&str> = telemetry.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], TELEMETRY_HEADER);
        assert!(lines[3].contains(",1,z5-8,5,8,"));
        assert!(lines.iter().skip(1).all(|l| l.ends_with(",ok")));

        // 中間ファイルが消えた後の再開はエラー
        let err = SplitAggregate::new(options.clone(), &service, CancelToken::new())
            .run()
            .unwrap_err();
        assert!(matches!(err, MosaicError::ResumeFileMissing(path) if path == first));

        options.resume_from = Some(2);
        let err = SplitAggregate::new(options, &service, CancelToken::new())
            .run()
            .unwrap_err();
        assert!(matches!(err, MosaicError::ResumeOutOfRange { index: 2, groups: 2 }));
    }

    #[test]
    fn test_existing_output_stops_before_any_group() {
        use crate::raster::fake::ConstantRasterService;

        let dir = tempfile::TempDir::new().unwrap();
        let service = ConstantRasterService::new()
            .with_source("dem1a", 96.0)
            .with_source("dem5a", 48.0);
        let options = split_options(dir.path());
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(&options.aggregate.output, b"stale").unwrap();

        let mut run = SplitAggregate::new(options.clone(), &service, CancelToken::new());
        let err = run.run().unwrap_err();
        assert!(matches!(err, MosaicError::OutputExists(ref path) if *path == options.aggregate.output));
        assert_eq!(run.phase(), RunPhase::Loading);
        for group in &options.groups {
            assert!(!options.intermediate_path(group).exists());
        }
        assert!(!options.telemetry_path().exists());
        assert!(!options.merged_path().exists());
        assert_eq!(std::fs::read(&options.aggregate.output).unwrap(), b"stale");

        // 最終出力が無くてもマージ先の MBTiles が残っていれば同じ扱い
        std::fs::remove_file(&options.aggregate.output).unwrap();
        std::fs::write(options.merged_path(), b"stale").unwrap();
        let err = SplitAggregate::new(options.clone(), &service, CancelToken::new())
            .run()
            .unwrap_err();
        assert!(matches!(err, MosaicError::OutputExists(path) if path == options.merged_path()));
        assert!(!options.telemetry_path().exists());
    }

    #[test]
    fn test_watchdog_breach_stops_in_process_group() {
        use crate::raster::fake::ConstantRasterService;

        let dir = tempfile::TempDir::new().unwrap();
        let service = ConstantRasterService::new()
            .with_source("dem1a", 96.0)
            .with_source("dem5a", 48.0);
        let mut options = split_options(dir.path());
        options.aggregate.io_sleep_ms = Some(200);
        options.watchdog = WatchdogLimits {
            max_memory_bytes: Some(1),
            max_duration: None,
            interval: Duration::from_millis(10),
        };

        let err = SplitAggregate::new(options.clone(), &service, CancelToken::new())
            .run()
            .unwrap_err();
        assert!(matches!(err, MosaicError::ResourceLimit { index: 0, .. }));

        let telemetry = std::fs::read_to_string(options.telemetry_path()).unwrap();
        assert!(telemetry.lines().nth(1).unwrap().ends_with(",resource_limit"));
    }
}

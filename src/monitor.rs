//! メモリ使用量の計測とウォッチドッグ
//!
//! 計測は2段階。Linux では `/proc/<pid>/smaps_rollup` の private ページ (USS) を読み、
//! 読めなければ sysinfo の RSS に落とす。どちらで測ったかは `MemoryTier` で返す。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tracing::{debug, warn};

const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    /// プロセス固有のページ (USS)
    Unique,
    /// 共有ページを含む常駐サイズ (RSS)
    Resident,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Unique => "uss",
            MemoryTier::Resident => "rss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub bytes: u64,
    pub tier: MemoryTier,
}

/// smaps_rollup の Private_Clean + Private_Dirty (kB) をバイトで返す
pub fn parse_private_bytes(smaps: &str) -> Option<u64> {
    let mut total_kb = 0u64;
    let mut found = false;
    for line in smaps.lines() {
        let Some(rest) = line
            .strip_prefix("Private_Clean:")
            .or_else(|| line.strip_prefix("Private_Dirty:"))
        else {
            continue;
        };
        let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        total_kb += kb;
        found = true;
    }
    found.then_some(total_kb * 1024)
}

fn read_unique_bytes(pid: u32) -> Option<u64> {
    let smaps = std::fs::read_to_string(format!("/proc/{pid}/smaps_rollup")).ok()?;
    parse_private_bytes(&smaps)
}

fn read_resident_bytes(system: &mut System, pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|p| p.memory())
}

/// プロセスのメモリを1回測る。プロセスが無ければ None。
pub fn sample_process(system: &mut System, pid: u32) -> Option<MemorySample> {
    if let Some(bytes) = read_unique_bytes(pid) {
        return Some(MemorySample {
            bytes,
            tier: MemoryTier::Unique,
        });
    }
    read_resident_bytes(system, pid).map(|bytes| MemorySample {
        bytes,
        tier: MemoryTier::Resident,
    })
}

/// 自プロセスの RSS
pub fn current_rss() -> Option<u64> {
    memory_stats::memory_stats().map(|stats| stats.physical_mem as u64)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_duration: Option<Duration>,
    pub interval: Duration,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: None,
            max_duration: None,
            interval: Duration::from_millis(500),
        }
    }
}

impl WatchdogLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_memory_bytes.is_none() && self.max_duration.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Memory { observed: u64, limit: u64 },
    Time { elapsed: Duration, limit: Duration },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breach::Memory { observed, limit } => write!(
                f,
                "memory limit ({} > {})",
                format_bytes(*observed),
                format_bytes(*limit)
            ),
            Breach::Time { elapsed, limit } => write!(
                f,
                "time limit ({:.0}s > {:.0}s)",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub peak: Option<MemorySample>,
    pub breach: Option<Breach>,
    pub samples: u64,
}

/// 別スレッドでメモリと経過時間を監視し、上限を超えたら一度だけコールバックを呼ぶ
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WatchdogReport>>,
}

impl Watchdog {
    pub fn spawn<F>(pid: u32, limits: WatchdogLimits, on_breach: F) -> Self
    where
        F: FnMut(&Breach) + Send + 'static,
    {
        let mut system = System::new();
        Self::spawn_with_sampler(limits, move || sample_process(&mut system, pid), on_breach)
    }

    pub fn spawn_with_sampler<S, F>(limits: WatchdogLimits, mut sampler: S, mut on_breach: F) -> Self
    where
        S: FnMut() -> Option<MemorySample> + Send + 'static,
        F: FnMut(&Breach) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let mut report = WatchdogReport::default();

            while !stop_flag.load(Ordering::SeqCst) {
                if let Some(sample) = sampler() {
                    report.samples += 1;
                    if report.peak.map_or(true, |p| sample.bytes > p.bytes) {
                        report.peak = Some(sample);
                    }
                    if let (None, Some(limit)) = (report.breach, limits.max_memory_bytes) {
                        if sample.bytes > limit {
                            let breach = Breach::Memory {
                                observed: sample.bytes,
                                limit,
                            };
                            warn!("Watchdog: {}", breach);
                            on_breach(&breach);
                            report.breach = Some(breach);
                        }
                    }
                }

                if let (None, Some(limit)) = (report.breach, limits.max_duration) {
                    let elapsed = started.elapsed();
                    if elapsed > limit {
                        let breach = Breach::Time { elapsed, limit };
                        warn!("Watchdog: {}", breach);
                        on_breach(&breach);
                        report.breach = Some(breach);
                    }
                }

                // 停止要求にすぐ応じられるよう短く区切って待つ
                let mut waited = Duration::ZERO;
                while waited < limits.interval && !stop_flag.load(Ordering::SeqCst) {
                    let slice = POLL_SLICE.min(limits.interval - waited);
                    std::thread::sleep(slice);
                    waited += slice;
                }
            }

            debug!("Watchdog stopped after {} samples", report.samples);
            report
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) -> WatchdogReport {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    const SMAPS: &str = "\
55d0c0a00000-7ffd1b5fe000 ---p 00000000 00:00 0                          [rollup]
Rss:               10240 kB
Pss:                8000 kB
Shared_Clean:       2048 kB
Shared_Dirty:          0 kB
Private_Clean:      1024 kB
Private_Dirty:      7168 kB
Referenced:        10240 kB
";

    #[test]
    fn test_parse_private_bytes() {
        assert_eq!(parse_private_bytes(SMAPS), Some(8192 * 1024));
        assert_eq!(parse_private_bytes("Rss: 10 kB\n"), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_sample_current_process() {
        let mut system = System::new();
        let sample = sample_process(&mut system, std::process::id()).unwrap();
        assert!(sample.bytes > 0);
    }

    #[test]
    fn test_memory_breach_fires_once() {
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        let limits = WatchdogLimits {
            max_memory_bytes: Some(100),
            max_duration: None,
            interval: Duration::from_millis(10),
        };
        let watchdog = Watchdog::spawn_with_sampler(
            limits,
            || {
                Some(MemorySample {
                    bytes: 500,
                    tier: MemoryTier::Resident,
                })
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(100));
        let report = watchdog.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.breach,
            Some(Breach::Memory {
                observed: 500,
                limit: 100
            })
        );
        assert_eq!(report.peak.map(|p| p.tier), Some(MemoryTier::Resident));
    }

    #[test]
    fn test_time_breach() {
        let limits = WatchdogLimits {
            max_memory_bytes: None,
            max_duration: Some(Duration::from_millis(20)),
            interval: Duration::from_millis(10),
        };
        let watchdog = Watchdog::spawn_with_sampler(limits, || None, |_| {});
        std::thread::sleep(Duration::from_millis(150));
        let report = watchdog.stop();
        assert!(matches!(report.breach, Some(Breach::Time { .. })));
        assert_eq!(report.peak, None);
    }
}

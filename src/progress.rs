use std::io::IsTerminal;
use std::time::{Duration, Instant};

use tracing::info;

/// タイル生成ループから呼ばれる進捗ログ。
///
/// 端末に繋がっていなければ出力間隔を 10 倍に間引く。
#[derive(Debug)]
pub struct ProgressReporter {
    label: String,
    expected: u64,
    interval: u64,
    started: Instant,
    last_reported: u64,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, expected: u64, interval: u64, force: bool) -> Self {
        let interval = interval.max(1);
        let interactive = force || std::io::stderr().is_terminal();
        Self {
            label: label.into(),
            expected,
            interval: if interactive { interval } else { interval * 10 },
            started: Instant::now(),
            last_reported: 0,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `checked` は走査済み、`emitted` は書き出したタイル数
    pub fn update(&mut self, checked: u64, emitted: u64) {
        if emitted == 0 || emitted < self.last_reported + self.interval {
            return;
        }
        self.last_reported = emitted;

        let secs = self.elapsed().as_secs_f64().max(1e-3);
        let rate = checked as f64 / secs;
        let eta = eta(checked, self.expected, rate);
        info!(
            "[{}] {} tiles written ({} checked / ~{}) {:.1} tiles/s ETA {}",
            self.label,
            emitted,
            checked,
            self.expected,
            emitted as f64 / secs,
            format_duration(eta)
        );
    }

    pub fn finish(&self, checked: u64, emitted: u64) {
        info!(
            "[{}] done: {} tiles written, {} checked in {}",
            self.label,
            emitted,
            checked,
            format_duration(Some(self.elapsed()))
        );
    }
}

/// 走査速度から残り時間を見積もる
pub fn eta(checked: u64, expected: u64, rate: f64) -> Option<Duration> {
    if rate <= 0.0 || !rate.is_finite() || checked >= expected {
        return None;
    }
    Some(Duration::from_secs_f64((expected - checked) as f64 / rate))
}

pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(d) = duration else {
        return "--:--:--".to_string();
    };
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

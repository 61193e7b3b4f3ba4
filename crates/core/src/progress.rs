//! Progress aggregation and event fan-out for a single in-flight migration.
//!
//! [`ProgressManager`] owns one [`MigrationProgress`] snapshot. Callers feed it
//! partial updates; it recomputes the derived fields (percentages, speeds,
//! ETA) and hands the full snapshot to every subscriber, in registration
//! order. Each update and its fan-out run under one notify lock, so
//! subscribers observe updates in the order they were applied even when
//! several tasks report progress. The state lock is released before any
//! subscriber runs: a subscriber may read [`ProgressManager::snapshot`], but
//! must not feed updates back into the manager that is notifying it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ETA_CALCULATING: &str = "Calculating...";
pub const ETA_COMPLETE: &str = "Complete";

const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const SPEED_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    #[default]
    Idle,
    Preparing,
    Downloading,
    Uploading,
    Completed,
    Error,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    #[default]
    Preparing,
    Download,
    Upload,
    Completed,
    Error,
}

impl MigrationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Preparing => "preparing",
            MigrationPhase::Download => "download",
            MigrationPhase::Upload => "upload",
            MigrationPhase::Completed => "completed",
            MigrationPhase::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

/// Snapshot of one migration. Every field is always present: an empty
/// `current_file` means no unit is in flight, `total_shards == 0` means the
/// destination write is not sharded, and `end_time == 0` means the migration
/// has not reached a terminal state. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub status: MigrationStatus,
    pub phase: MigrationPhase,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub remaining_files: u64,
    pub downloaded_bytes: u64,
    pub total_download_bytes: u64,
    pub uploaded_bytes: u64,
    pub total_upload_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub phase_percentage: f64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub estimated_time_remaining: String,
    pub current_file: String,
    pub current_shard_index: u32,
    pub total_shards: u32,
    pub errors: Vec<FileError>,
    pub start_time: u64,
    pub end_time: u64,
}

impl MigrationProgress {
    fn started_at(start_time: u64) -> Self {
        Self {
            status: MigrationStatus::Idle,
            phase: MigrationPhase::Preparing,
            total_files: 0,
            completed_files: 0,
            failed_files: 0,
            remaining_files: 0,
            downloaded_bytes: 0,
            total_download_bytes: 0,
            uploaded_bytes: 0,
            total_upload_bytes: 0,
            total_bytes: 0,
            percentage: 0.0,
            phase_percentage: 0.0,
            download_speed: 0.0,
            upload_speed: 0.0,
            estimated_time_remaining: ETA_CALCULATING.to_string(),
            current_file: String::new(),
            current_shard_index: 0,
            total_shards: 0,
            errors: Vec::new(),
            start_time,
            end_time: 0,
        }
    }
}

impl Default for MigrationProgress {
    fn default() -> Self {
        Self::started_at(0)
    }
}

/// Partial update merged into the snapshot by [`ProgressManager::update_progress`].
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<MigrationStatus>,
    pub phase: Option<MigrationPhase>,
    pub total_files: Option<u64>,
    pub downloaded_bytes: Option<u64>,
    pub total_download_bytes: Option<u64>,
    pub uploaded_bytes: Option<u64>,
    pub total_upload_bytes: Option<u64>,
    pub current_file: Option<String>,
    pub current_shard_index: Option<u32>,
    pub total_shards: Option<u32>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &MigrationProgress);
}

pub trait ErrorSink: Send + Sync {
    fn on_error(&self, error: &str, file: Option<&str>);
}

struct FnProgressSink<F>(F);

impl<F> ProgressSink for FnProgressSink<F>
where
    F: Fn(&MigrationProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &MigrationProgress) {
        (self.0)(progress)
    }
}

struct FnErrorSink<F>(F);

impl<F> ErrorSink for FnErrorSink<F>
where
    F: Fn(&str, Option<&str>) + Send + Sync,
{
    fn on_error(&self, error: &str, file: Option<&str>) {
        (self.0)(error, file)
    }
}

type FileCompleteFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    progress: Vec<Arc<dyn ProgressSink>>,
    error: Vec<Arc<dyn ErrorSink>>,
    file_complete: Vec<FileCompleteFn>,
}

/// Windowed throughput estimate. Samples are taken at most once per
/// [`SPEED_SAMPLE_INTERVAL`]; the reported speed is the mean of the last
/// [`SPEED_WINDOW`] samples.
#[derive(Debug, Default)]
struct SpeedMeter {
    baseline: Option<(Instant, u64)>,
    samples: VecDeque<f64>,
}

impl SpeedMeter {
    fn observe(&mut self, now: Instant, bytes: u64) -> f64 {
        match self.baseline {
            None => self.baseline = Some((now, bytes)),
            Some((at, prev)) if bytes < prev => {
                // Transfer restarted (retry); keep the clock, rebase the bytes.
                self.baseline = Some((at, bytes));
            }
            Some((at, prev)) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed >= SPEED_SAMPLE_INTERVAL {
                    let rate = (bytes - prev) as f64 / elapsed.as_secs_f64();
                    self.samples.push_back(rate);
                    while self.samples.len() > SPEED_WINDOW {
                        self.samples.pop_front();
                    }
                    self.baseline = Some((now, bytes));
                }
            }
        }
        self.average()
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

struct ProgressState {
    snapshot: MigrationProgress,
    download_meter: SpeedMeter,
    upload_meter: SpeedMeter,
}

impl ProgressState {
    fn fresh() -> Self {
        Self {
            snapshot: MigrationProgress::started_at(unix_ms()),
            download_meter: SpeedMeter::default(),
            upload_meter: SpeedMeter::default(),
        }
    }
}

pub struct ProgressManager {
    state: Mutex<ProgressState>,
    subscribers: Mutex<Subscribers>,
    // Taken before `state`; held across subscriber fan-out.
    notify: Mutex<()>,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState::fresh()),
            subscribers: Mutex::new(Subscribers::default()),
            notify: Mutex::new(()),
        }
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&MigrationProgress) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnProgressSink(callback)));
    }

    pub fn subscribe(&self, sink: Arc<dyn ProgressSink>) {
        self.subscribers().progress.push(sink);
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.subscribe_errors(Arc::new(FnErrorSink(callback)));
    }

    pub fn subscribe_errors(&self, sink: Arc<dyn ErrorSink>) {
        self.subscribers().error.push(sink);
    }

    pub fn on_file_complete<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers().file_complete.push(Arc::new(callback));
    }

    pub fn snapshot(&self) -> MigrationProgress {
        self.state().snapshot.clone()
    }

    /// Discards the previous migration's snapshot. Does not notify.
    pub fn reset(&self) {
        *self.state() = ProgressState::fresh();
    }

    pub fn update_progress(&self, update: ProgressUpdate) {
        self.update_progress_at(update, Instant::now());
    }

    pub(crate) fn update_progress_at(&self, update: ProgressUpdate, now: Instant) {
        let _notify = self.notifier();
        let snapshot = {
            let mut state = self.state();
            if state.snapshot.status.is_terminal() {
                debug!(
                    event = "progress.ignored_after_terminal",
                    status = ?state.snapshot.status,
                    "progress.ignored_after_terminal"
                );
                return;
            }
            apply_update(&mut state, update, now);
            state.snapshot.clone()
        };
        self.notify_progress(&snapshot);
    }

    /// Sets the byte counters of `phase` (download or upload) for the unit
    /// `file_key` and the matching status.
    pub fn update_file_progress(
        &self,
        file_key: &str,
        bytes_processed: u64,
        total_bytes: u64,
        phase: MigrationPhase,
    ) {
        let mut update = ProgressUpdate {
            phase: Some(phase),
            current_file: Some(file_key.to_string()),
            ..ProgressUpdate::default()
        };
        match phase {
            MigrationPhase::Download => {
                update.status = Some(MigrationStatus::Downloading);
                update.downloaded_bytes = Some(bytes_processed);
                update.total_download_bytes = Some(total_bytes);
            }
            MigrationPhase::Upload => {
                update.status = Some(MigrationStatus::Uploading);
                update.uploaded_bytes = Some(bytes_processed);
                update.total_upload_bytes = Some(total_bytes);
            }
            _ => {}
        }
        self.update_progress(update);
    }

    /// Records a successfully transferred unit. Reaching `total_files`
    /// completions forces the terminal `completed` state.
    pub fn file_complete(&self, file_key: &str) {
        let _notify = self.notifier();
        let snapshot = {
            let mut state = self.state();
            if state.snapshot.status.is_terminal() {
                return;
            }
            state.snapshot.completed_files += 1;

            let s = &state.snapshot;
            let all_done = s.total_files > 0 && s.completed_files >= s.total_files;
            let update = if all_done {
                ProgressUpdate {
                    status: Some(MigrationStatus::Completed),
                    ..ProgressUpdate::default()
                }
            } else {
                ProgressUpdate::default()
            };
            apply_update(&mut state, update, Instant::now());
            state.snapshot.clone()
        };

        let callbacks = self.subscribers().file_complete.clone();
        for callback in callbacks {
            callback(file_key);
        }
        self.notify_progress(&snapshot);
    }

    /// Records a failed unit. Does not terminate the migration.
    pub fn record_error(&self, error: &str, file_key: Option<&str>) {
        let _notify = self.notifier();
        let snapshot = {
            let mut state = self.state();
            if state.snapshot.status.is_terminal() {
                return;
            }
            state.snapshot.failed_files += 1;
            state.snapshot.errors.push(FileError {
                file: file_key.unwrap_or_default().to_string(),
                error: error.to_string(),
            });
            apply_update(&mut state, ProgressUpdate::default(), Instant::now());
            state.snapshot.clone()
        };

        let sinks = self.subscribers().error.clone();
        for sink in sinks {
            sink.on_error(error, file_key);
        }
        self.notify_progress(&snapshot);
    }

    fn notify_progress(&self, snapshot: &MigrationProgress) {
        let sinks = self.subscribers().progress.clone();
        for sink in sinks {
            sink.on_progress(snapshot);
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notifier(&self) -> MutexGuard<'_, ()> {
        self.notify.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply_update(state: &mut ProgressState, update: ProgressUpdate, now: Instant) {
    let s = &mut state.snapshot;

    if let Some(v) = update.total_files {
        s.total_files = v;
    }
    if let Some(v) = update.total_download_bytes {
        s.total_download_bytes = v;
    }
    if let Some(v) = update.downloaded_bytes {
        s.downloaded_bytes = v;
    }
    if let Some(v) = update.total_upload_bytes {
        s.total_upload_bytes = v;
    }
    if let Some(v) = update.uploaded_bytes {
        s.uploaded_bytes = v;
    }
    if let Some(v) = update.current_file {
        s.current_file = v;
    }
    if let Some(v) = update.current_shard_index {
        s.current_shard_index = v;
    }
    if let Some(v) = update.total_shards {
        s.total_shards = v;
    }
    if let Some(v) = update.phase {
        s.phase = v;
    }
    if let Some(v) = update.status {
        s.status = v;
    }

    if s.total_download_bytes > 0 {
        s.downloaded_bytes = s.downloaded_bytes.min(s.total_download_bytes);
    }
    if s.total_upload_bytes > 0 {
        s.uploaded_bytes = s.uploaded_bytes.min(s.total_upload_bytes);
    }
    s.total_bytes = s.total_download_bytes.saturating_add(s.total_upload_bytes);

    match s.status {
        MigrationStatus::Completed => {
            s.phase = MigrationPhase::Completed;
            s.remaining_files = 0;
            s.downloaded_bytes = s.total_download_bytes;
            s.uploaded_bytes = s.total_upload_bytes;
            s.percentage = 100.0;
            s.phase_percentage = 100.0;
            s.estimated_time_remaining = ETA_COMPLETE.to_string();
            s.download_speed = 0.0;
            s.upload_speed = 0.0;
            s.end_time = unix_ms();
            return;
        }
        MigrationStatus::Error => {
            s.phase = MigrationPhase::Error;
            s.remaining_files = remaining_files(s);
            s.download_speed = 0.0;
            s.upload_speed = 0.0;
            s.end_time = unix_ms();
            return;
        }
        _ => {}
    }

    s.remaining_files = remaining_files(s);

    let download_pct = percent(s.downloaded_bytes, s.total_download_bytes);
    let upload_pct = percent(s.uploaded_bytes, s.total_upload_bytes);
    match s.phase {
        MigrationPhase::Download => s.phase_percentage = download_pct,
        MigrationPhase::Upload => s.phase_percentage = upload_pct,
        MigrationPhase::Preparing => s.phase_percentage = 0.0,
        MigrationPhase::Completed | MigrationPhase::Error => {}
    }

    let overall = if s.total_bytes > 0 {
        let total = s.total_bytes as f64;
        let download_weight = s.total_download_bytes as f64 / total;
        let upload_weight = s.total_upload_bytes as f64 / total;
        download_pct * download_weight + upload_pct * upload_weight
    } else {
        percent(s.completed_files, s.total_files)
    };
    s.percentage = s.percentage.max(overall.clamp(0.0, 100.0));

    match s.phase {
        MigrationPhase::Download => {
            s.download_speed = state.download_meter.observe(now, s.downloaded_bytes);
        }
        MigrationPhase::Upload => {
            s.upload_speed = state.upload_meter.observe(now, s.uploaded_bytes);
        }
        _ => {}
    }

    s.estimated_time_remaining = if s.percentage >= 100.0 {
        ETA_COMPLETE.to_string()
    } else {
        let (speed, phase_total) = match s.phase {
            MigrationPhase::Download => (s.download_speed, s.total_download_bytes),
            MigrationPhase::Upload => (s.upload_speed, s.total_upload_bytes),
            _ => (0.0, 0),
        };
        let remaining_bytes = s.total_download_bytes.saturating_sub(s.downloaded_bytes)
            + s.total_upload_bytes.saturating_sub(s.uploaded_bytes);
        // An unknown phase total gives no basis for an estimate.
        if speed > 0.0 && phase_total > 0 {
            format_eta(remaining_bytes as f64 / speed)
        } else {
            ETA_CALCULATING.to_string()
        }
    };
}

fn remaining_files(s: &MigrationProgress) -> u64 {
    s.total_files
        .saturating_sub(s.completed_files.saturating_add(s.failed_files))
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return ETA_CALCULATING.to_string();
    }
    let secs = seconds.ceil() as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collect(manager: &ProgressManager) -> Arc<StdMutex<Vec<MigrationProgress>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_progress(move |p| sink.lock().unwrap().push(p.clone()));
        seen
    }

    #[test]
    fn weighted_blend_of_download_and_upload() {
        let m = ProgressManager::new();
        m.update_progress(ProgressUpdate {
            phase: Some(MigrationPhase::Upload),
            total_download_bytes: Some(100),
            downloaded_bytes: Some(100),
            total_upload_bytes: Some(300),
            uploaded_bytes: Some(150),
            ..ProgressUpdate::default()
        });
        let s = m.snapshot();
        assert!((s.percentage - 62.5).abs() < 1e-9);
        assert!((s.phase_percentage - 50.0).abs() < 1e-9);
        assert_eq!(s.total_bytes, 400);
    }

    #[test]
    fn zero_upload_total_never_produces_nan() {
        let m = ProgressManager::new();
        m.update_progress(ProgressUpdate {
            phase: Some(MigrationPhase::Upload),
            status: Some(MigrationStatus::Uploading),
            total_upload_bytes: Some(0),
            uploaded_bytes: Some(0),
            ..ProgressUpdate::default()
        });
        let s = m.snapshot();
        assert_eq!(s.percentage, 0.0);
        assert_eq!(s.phase_percentage, 0.0);
        assert_eq!(s.upload_speed, 0.0);
        assert!(s.percentage.is_finite());
        assert_eq!(s.estimated_time_remaining, ETA_CALCULATING);
    }

    #[test]
    fn byte_less_progress_falls_back_to_file_counts() {
        let m = ProgressManager::new();
        m.update_progress(ProgressUpdate {
            total_files: Some(4),
            ..ProgressUpdate::default()
        });
        m.file_complete("a");
        let s = m.snapshot();
        assert!((s.percentage - 25.0).abs() < 1e-9);
        assert_eq!(s.remaining_files, 3);
    }

    #[test]
    fn completed_status_forces_consistency() {
        let m = ProgressManager::new();
        m.update_progress(ProgressUpdate {
            total_files: Some(3),
            phase: Some(MigrationPhase::Download),
            total_download_bytes: Some(1000),
            downloaded_bytes: Some(10),
            ..ProgressUpdate::default()
        });
        m.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Completed),
            ..ProgressUpdate::default()
        });
        let s = m.snapshot();
        assert_eq!(s.percentage, 100.0);
        assert_eq!(s.remaining_files, 0);
        assert_eq!(s.estimated_time_remaining, ETA_COMPLETE);
        assert_eq!(s.downloaded_bytes, 1000);
        assert_eq!(s.phase, MigrationPhase::Completed);
        assert_eq!(s.download_speed, 0.0);
        assert!(s.end_time >= s.start_time);
    }

    #[test]
    fn percentage_never_regresses_within_a_migration() {
        let m = ProgressManager::new();
        let seen = collect(&m);
        m.update_file_progress("k", 800, 1000, MigrationPhase::Download);
        // A retried download restarts from zero.
        m.update_file_progress("k", 100, 1000, MigrationPhase::Download);
        // A larger total discovered late would otherwise drop the ratio.
        m.update_progress(ProgressUpdate {
            total_upload_bytes: Some(1000),
            ..ProgressUpdate::default()
        });
        m.update_file_progress("k", 1000, 1000, MigrationPhase::Download);

        let values: Vec<f64> = seen.lock().unwrap().iter().map(|p| p.percentage).collect();
        assert_eq!(values.len(), 4);
        assert!(values.windows(2).all(|w| w[1] >= w[0]), "{values:?}");
    }

    #[test]
    fn reset_starts_from_zero() {
        let m = ProgressManager::new();
        m.update_file_progress("k", 10, 10, MigrationPhase::Download);
        m.record_error("boom", Some("k"));
        assert_eq!(m.snapshot().percentage, 100.0);

        m.reset();
        let s = m.snapshot();
        assert_eq!(s.percentage, 0.0);
        assert!(s.errors.is_empty());
        assert_eq!(s.downloaded_bytes, 0);
        assert_eq!(s.status, MigrationStatus::Idle);
    }

    #[test]
    fn negative_style_overshoot_is_clamped() {
        let m = ProgressManager::new();
        m.update_file_progress("k", 5000, 1000, MigrationPhase::Download);
        let s = m.snapshot();
        assert_eq!(s.downloaded_bytes, 1000);
        assert_eq!(s.phase_percentage, 100.0);
    }

    #[test]
    fn errors_append_and_do_not_terminate() {
        let m = ProgressManager::new();
        let errors = Arc::new(StdMutex::new(Vec::<(String, Option<String>)>::new()));
        let sink = errors.clone();
        m.on_error(move |e, f| {
            sink.lock()
                .unwrap()
                .push((e.to_string(), f.map(str::to_string)))
        });

        m.update_progress(ProgressUpdate {
            total_files: Some(3),
            ..ProgressUpdate::default()
        });
        m.record_error("export failed", Some("orders"));
        m.file_complete("users");

        let s = m.snapshot();
        assert_eq!(s.failed_files, 1);
        assert_eq!(s.completed_files, 1);
        assert_eq!(s.remaining_files, 1);
        assert_eq!(
            s.errors,
            vec![FileError {
                file: "orders".to_string(),
                error: "export failed".to_string(),
            }]
        );
        assert!(!s.status.is_terminal());
        assert_eq!(
            errors.lock().unwrap().as_slice(),
            &[("export failed".to_string(), Some("orders".to_string()))]
        );
    }

    #[test]
    fn completing_every_file_forces_terminal_state() {
        let m = ProgressManager::new();
        let completed = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = completed.clone();
        m.on_file_complete(move |k| sink.lock().unwrap().push(k.to_string()));

        m.update_progress(ProgressUpdate {
            total_files: Some(2),
            ..ProgressUpdate::default()
        });
        m.file_complete("a");
        assert_eq!(m.snapshot().status, MigrationStatus::Idle);
        m.file_complete("b");

        let s = m.snapshot();
        assert_eq!(s.status, MigrationStatus::Completed);
        assert_eq!(s.percentage, 100.0);
        assert_eq!(completed.lock().unwrap().as_slice(), &["a", "b"]);
    }

    #[test]
    fn terminal_snapshot_is_immutable() {
        let m = ProgressManager::new();
        let seen = collect(&m);
        m.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Error),
            ..ProgressUpdate::default()
        });
        m.update_file_progress("late", 1, 2, MigrationPhase::Upload);
        m.record_error("late", None);

        assert_eq!(seen.lock().unwrap().len(), 1);
        let s = m.snapshot();
        assert_eq!(s.phase, MigrationPhase::Error);
        assert_eq!(s.uploaded_bytes, 0);
        assert!(s.errors.is_empty());
    }

    #[test]
    fn subscribers_fire_in_registration_order() {
        let m = ProgressManager::new();
        let order = Arc::new(StdMutex::new(Vec::<u8>::new()));
        for id in 0..3u8 {
            let sink = order.clone();
            m.on_progress(move |_| sink.lock().unwrap().push(id));
        }
        m.update_progress(ProgressUpdate::default());
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn speed_is_windowed_and_sampled_per_second() {
        let m = ProgressManager::new();
        let t0 = Instant::now();
        let update = |bytes: u64, at: Instant| {
            m.update_progress_at(
                ProgressUpdate {
                    phase: Some(MigrationPhase::Download),
                    downloaded_bytes: Some(bytes),
                    total_download_bytes: Some(100_000),
                    ..ProgressUpdate::default()
                },
                at,
            )
        };

        update(0, t0);
        assert_eq!(m.snapshot().estimated_time_remaining, ETA_CALCULATING);

        // Sub-second updates do not produce samples.
        update(500, t0 + Duration::from_millis(300));
        assert_eq!(m.snapshot().download_speed, 0.0);

        update(1000, t0 + Duration::from_secs(1));
        assert!((m.snapshot().download_speed - 1000.0).abs() < 1e-6);

        update(4000, t0 + Duration::from_secs(2));
        // Mean of 1000 B/s and 3000 B/s.
        assert!((m.snapshot().download_speed - 2000.0).abs() < 1e-6);
        // 96_000 bytes left at 2000 B/s.
        assert_eq!(m.snapshot().estimated_time_remaining, "48s");
    }

    #[test]
    fn speed_window_keeps_last_five_samples() {
        let mut meter = SpeedMeter::default();
        let t0 = Instant::now();
        meter.observe(t0, 0);
        let mut bytes = 0;
        for i in 1..=7u64 {
            bytes += if i <= 2 { 10_000 } else { 100 };
            meter.observe(t0 + Duration::from_secs(i), bytes);
        }
        assert_eq!(meter.samples.len(), SPEED_WINDOW);
        assert!((meter.average() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_phase_total_keeps_eta_calculating() {
        let m = ProgressManager::new();
        m.update_progress(ProgressUpdate {
            total_files: Some(3),
            ..ProgressUpdate::default()
        });
        let t0 = Instant::now();
        for (i, bytes) in [0u64, 1000, 2000, 3000].into_iter().enumerate() {
            m.update_progress_at(
                ProgressUpdate {
                    status: Some(MigrationStatus::Downloading),
                    phase: Some(MigrationPhase::Download),
                    downloaded_bytes: Some(bytes),
                    ..ProgressUpdate::default()
                },
                t0 + Duration::from_millis(1100 * i as u64),
            );
            let s = m.snapshot();
            assert_eq!(s.estimated_time_remaining, ETA_CALCULATING, "at {bytes}");
            assert_eq!(s.percentage, 0.0);
        }
        assert!(m.snapshot().download_speed > 0.0);
    }

    #[test]
    fn subscribers_can_read_the_snapshot() {
        let m = Arc::new(ProgressManager::new());
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = {
            let m = m.clone();
            std::thread::spawn(move || {
                let seen = Arc::new(StdMutex::new(Vec::new()));

                let (inner, sink) = (Arc::downgrade(&m), seen.clone());
                m.on_progress(move |_| {
                    if let Some(inner) = inner.upgrade() {
                        sink.lock().unwrap().push(inner.snapshot().completed_files);
                    }
                });
                let (inner, sink) = (Arc::downgrade(&m), seen.clone());
                m.on_file_complete(move |_| {
                    if let Some(inner) = inner.upgrade() {
                        sink.lock().unwrap().push(inner.snapshot().completed_files);
                    }
                });
                let (inner, sink) = (Arc::downgrade(&m), seen.clone());
                m.on_error(move |_, _| {
                    if let Some(inner) = inner.upgrade() {
                        sink.lock().unwrap().push(inner.snapshot().failed_files);
                    }
                });

                m.update_progress(ProgressUpdate {
                    total_files: Some(3),
                    ..ProgressUpdate::default()
                });
                m.file_complete("a");
                m.record_error("boom", Some("b"));
                let _ = tx.send(seen.lock().unwrap().clone());
            })
        };

        let seen = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("subscriber reading the snapshot blocked the update");
        worker.join().unwrap();
        // progress(0), file_complete(1), progress(1), error(1), progress(1)
        assert_eq!(seen, vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(0.2), "1s");
        assert_eq!(format_eta(59.0), "59s");
        assert_eq!(format_eta(125.0), "2m 5s");
        assert_eq!(format_eta(7260.0), "2h 1m");
        assert_eq!(format_eta(f64::INFINITY), ETA_CALCULATING);
    }

    #[test]
    fn snapshot_serializes_with_camel_case_field_names() {
        let json = serde_json::to_value(MigrationProgress::default()).unwrap();
        for key in [
            "status",
            "phase",
            "totalFiles",
            "completedFiles",
            "failedFiles",
            "remainingFiles",
            "downloadedBytes",
            "totalDownloadBytes",
            "uploadedBytes",
            "totalUploadBytes",
            "totalBytes",
            "percentage",
            "downloadSpeed",
            "uploadSpeed",
            "estimatedTimeRemaining",
            "currentFile",
            "currentShardIndex",
            "totalShards",
            "errors",
            "startTime",
            "endTime",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["status"], "idle");
        assert_eq!(json["phase"], "preparing");
    }
}

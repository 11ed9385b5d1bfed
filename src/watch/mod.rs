//! Event intake, filtering, debouncing, and adaptive polling (C6).
//!
//! Wraps `notify`'s OS-native watcher and reduces its raw event stream
//! down to the two things the rest of the pipeline cares about:
//! "compare this file now" and "this file's lock sentinel appeared or
//! disappeared". The polling loop that follows every recognized change
//! event lives here too, as a small state machine driven by repeated
//! `(mtime, size)` samples rather than by the raw notify stream.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::Config;

/// What C6 asks the compare queue to do for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// The very first event on a path: compare immediately, event-driven.
    Immediate,
    /// A polling-loop tick found K stable samples: compare with `polling_flag = true`.
    Polling,
}

/// Office's own lock sentinel / save-temp family. These drive the
/// open/close tracker; they never trigger a comparison directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfficeTempKind {
    /// `~$<basename>`: the lock sentinel for `<basename>`.
    LockSentinel { basename: String },
    /// `<basename>.tmp` or `~WRL????.tmp`: an in-progress atomic save.
    SaveTemp,
}

/// Recognizes Office's lock-sentinel and atomic-save temp file naming.
pub fn office_temp_kind(path: &Path) -> Option<OfficeTempKind> {
    let name = path.file_name()?.to_str()?;
    if let Some(basename) = name.strip_prefix("~$") {
        return Some(OfficeTempKind::LockSentinel { basename: basename.to_string() });
    }
    if let Some(digits) = name.strip_prefix("~WRL").and_then(|r| r.strip_suffix(".tmp")) {
        if digits.len() == 4 && digits.chars().all(|c| c.is_ascii_digit()) {
            return Some(OfficeTempKind::SaveTemp);
        }
    }
    if name.ends_with(".tmp") {
        return Some(OfficeTempKind::SaveTemp);
    }
    None
}

/// The lock-sentinel sibling path for `path` (e.g. `report.xlsx` ->
/// `~$report.xlsx`).
pub fn lock_sentinel_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    dir.join(format!("~${basename}"))
}

fn path_is_under(path: &Path, root: &Path) -> bool {
    let canon_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let canon_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    canon_path.starts_with(canon_root)
}

/// Filters applied before any event reaches the debouncer: drop
/// self-triggered events under the cache/log roots, drop paths under an
/// excluded directory, drop unsupported extensions.
pub struct EventFilter {
    pub cache_root: PathBuf,
    pub log_root: PathBuf,
    pub exclude_paths: Vec<PathBuf>,
    pub supported_extensions: HashSet<String>,
}

impl EventFilter {
    pub fn from_config(config: &Config) -> Self {
        EventFilter {
            cache_root: config.cache_root.clone(),
            log_root: config.log_root.clone(),
            exclude_paths: config.exclude_paths.clone(),
            supported_extensions: config.supported_extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    pub fn is_self_triggered(&self, path: &Path) -> bool {
        path_is_under(path, &self.cache_root) || path_is_under(path, &self.log_root)
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_paths.iter().any(|excluded| path_is_under(path, excluded))
    }

    pub fn has_supported_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.supported_extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Whether a raw filesystem path is worth looking at at all: not
    /// under the cache/log roots, not under an excluded directory, and
    /// not an Office temp/lock file (those are handled separately by the
    /// open/close tracker).
    pub fn accepts(&self, path: &Path) -> bool {
        if self.is_self_triggered(path) {
            return false;
        }
        if self.is_excluded(path) {
            return false;
        }
        if office_temp_kind(path).is_some() {
            return false;
        }
        self.has_supported_extension(path)
    }
}

/// Collapses events arriving within `interval` of the last dispatch for
/// the same path.
pub struct Debouncer {
    interval: Duration,
    last_dispatch: Mutex<HashMap<PathBuf, Instant>>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Debouncer { interval, last_dispatch: Mutex::new(HashMap::new()) }
    }

    /// True if an event for `path` arriving at `now` should be admitted
    /// (not within `interval` of the last admitted event for this path).
    pub fn admit(&self, path: &Path, now: Instant) -> bool {
        let mut last = self.last_dispatch.lock().unwrap();
        match last.get(path) {
            Some(prev) if now.duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(path.to_path_buf(), now);
                true
            }
        }
    }
}

/// Tracks Office's lock-sentinel appearance/disappearance as "file F open
/// by user U" / "file F closed after duration D". Never itself triggers a
/// comparison.
pub struct OpenCloseTracker {
    open_since: Mutex<HashMap<PathBuf, (Instant, Option<String>)>>,
}

impl OpenCloseTracker {
    pub fn new() -> Self {
        OpenCloseTracker { open_since: Mutex::new(HashMap::new()) }
    }

    pub fn mark_open(&self, target_path: &Path, opened_by: Option<String>, now: Instant) {
        self.open_since.lock().unwrap().insert(target_path.to_path_buf(), (now, opened_by));
    }

    /// Returns how long the file was open, if it was tracked as open.
    pub fn mark_closed(&self, target_path: &Path, now: Instant) -> Option<Duration> {
        self.open_since.lock().unwrap().remove(target_path).map(|(opened_at, _)| now.duration_since(opened_at))
    }

    pub fn opened_by(&self, target_path: &Path) -> Option<String> {
        self.open_since.lock().unwrap().get(target_path).and_then(|(_, author)| author.clone())
    }
}

impl Default for OpenCloseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub dense_interval: Duration,
    pub sparse_interval: Duration,
    pub size_threshold_bytes: u64,
    pub stable_checks: u32,
    pub cooldown: Duration,
}

impl PollingConfig {
    pub fn from_config(config: &Config) -> Self {
        PollingConfig {
            dense_interval: Duration::from_secs_f64(config.dense_polling_interval_seconds),
            sparse_interval: Duration::from_secs_f64(config.sparse_polling_interval_seconds),
            size_threshold_bytes: config.polling_size_threshold_mb * 1024 * 1024,
            stable_checks: config.polling_stable_checks,
            cooldown: Duration::from_secs_f64(config.polling_cooldown_seconds),
        }
    }

    pub fn interval_for(&self, size: u64) -> Duration {
        if size < self.size_threshold_bytes {
            self.dense_interval
        } else {
            self.sparse_interval
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Not enough stable samples yet, or still cooling down; keep polling.
    Continue,
    /// K consecutive stable samples: run a polling-mode comparison.
    Compare,
    /// A stable tick followed a comparison that reported no meaningful
    /// changes: stop polling this file.
    Terminate,
}

/// Per-file adaptive polling state, started after a recognized change
/// event and fed one `(mtime, size)` sample per tick.
pub struct PollingLoopState {
    last_sample: Option<(Option<SystemTime>, u64)>,
    stable_count: u32,
    cooldown_until: Option<Instant>,
    last_comparison_was_meaningful: Option<bool>,
}

impl PollingLoopState {
    pub fn new() -> Self {
        PollingLoopState { last_sample: None, stable_count: 0, cooldown_until: None, last_comparison_was_meaningful: None }
    }

    pub fn tick(&mut self, sample: (Option<SystemTime>, u64), now: Instant, config: &PollingConfig) -> PollAction {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return PollAction::Continue;
            }
            self.cooldown_until = None;
        }

        if self.last_sample == Some(sample) {
            self.stable_count += 1;
        } else {
            self.stable_count = 1;
            self.last_sample = Some(sample);
        }

        if self.stable_count < config.stable_checks.max(1) {
            return PollAction::Continue;
        }

        if self.last_comparison_was_meaningful == Some(false) {
            return PollAction::Terminate;
        }
        self.stable_count = 0;
        PollAction::Compare
    }

    /// Call after a polling-mode comparison triggered by `Compare` completes.
    pub fn record_comparison(&mut self, meaningful: bool, now: Instant, config: &PollingConfig) {
        self.last_comparison_was_meaningful = Some(meaningful);
        if meaningful {
            self.cooldown_until = Some(now + config.cooldown);
        }
    }
}

impl Default for PollingLoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin wrapper over `notify::RecommendedWatcher` that forwards every
/// `Create`/`Modify`/`Remove` event's primary path into a channel. Event
/// classification (Office temp file vs. real change) happens downstream
/// in `EventFilter` / `office_temp_kind`, not here.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<PathBuf>,
}

impl FsWatcher {
    pub fn new(roots: &[PathBuf]) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        })?;
        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
        Ok(FsWatcher { _watcher: watcher, events: rx })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PathBuf> {
        self.events.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<PathBuf> {
        self.events.try_recv().ok()
    }
}

fn stat_sample(path: &Path) -> Option<(Option<SystemTime>, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok(), meta.len()))
}

struct DispatcherShared {
    roots: Vec<PathBuf>,
    watcher: Mutex<Option<FsWatcher>>,
    filter: EventFilter,
    debouncer: Debouncer,
    open_close: OpenCloseTracker,
    polling_config: PollingConfig,
    polling: Mutex<HashMap<PathBuf, PollingLoopState>>,
    queue: Arc<crate::queue::CompareQueue>,
    stopping: AtomicBool,
    last_dispatch: Mutex<Option<Instant>>,
    last_raw_event: Mutex<Option<Instant>>,
    tick_interval: Duration,
    monitor_only_roots: Vec<PathBuf>,
    immediate_compare_on_first_event: bool,
    seen: Mutex<HashSet<PathBuf>>,
}

impl DispatcherShared {
    fn is_monitor_only(&self, path: &Path) -> bool {
        self.monitor_only_roots.iter().any(|root| path_is_under(path, root))
    }

    fn handle_event(&self, path: &Path) {
        let now = Instant::now();
        *self.last_raw_event.lock().unwrap() = Some(now);

        match office_temp_kind(path) {
            Some(OfficeTempKind::LockSentinel { basename }) => {
                let target = path.parent().unwrap_or_else(|| Path::new(".")).join(&basename);
                if path.exists() {
                    self.open_close.mark_open(&target, None, now);
                } else {
                    self.open_close.mark_closed(&target, now);
                }
            }
            Some(OfficeTempKind::SaveTemp) => {}
            None => {
                if !self.filter.accepts(path) {
                    return;
                }
                self.polling.lock().unwrap().entry(path.to_path_buf()).or_default();

                // A monitor-only root's first sighting only needs a baseline,
                // not an event-driven compare; the polling loop that just got
                // armed above will pick the file up on its own. Likewise if
                // the operator disabled first-event immediate comparison
                // entirely, every path (not just monitor-only ones) waits
                // for the polling loop instead of jumping the queue.
                let is_first_event = self.seen.lock().unwrap().insert(path.to_path_buf());
                if is_first_event && (self.is_monitor_only(path) || !self.immediate_compare_on_first_event) {
                    return;
                }

                if self.debouncer.admit(path, now) {
                    *self.last_dispatch.lock().unwrap() = Some(now);
                    self.queue.submit(crate::queue::CompareTask { path: path.to_path_buf(), kind: DispatchKind::Immediate });
                }
            }
        }
    }

    fn tick_polling(&self) {
        let now = Instant::now();
        let mut polling = self.polling.lock().unwrap();
        let mut to_remove = Vec::new();
        for (path, state) in polling.iter_mut() {
            let Some(sample) = stat_sample(path) else {
                to_remove.push(path.clone());
                continue;
            };
            match state.tick(sample, now, &self.polling_config) {
                PollAction::Continue => {}
                PollAction::Compare => {
                    self.queue.submit(crate::queue::CompareTask { path: path.clone(), kind: DispatchKind::Polling });
                }
                PollAction::Terminate => to_remove.push(path.clone()),
            }
        }
        for path in to_remove {
            polling.remove(&path);
        }
    }

    fn run_once(&self) {
        let event = {
            let watcher = self.watcher.lock().unwrap();
            watcher.as_ref().and_then(|w| w.recv_timeout(self.tick_interval))
        };
        if let Some(path) = event {
            self.handle_event(&path);
        }
        self.tick_polling();
    }
}

/// The assembled C6 event-to-compare pipeline: owns the OS watcher, the
/// filter/debounce/open-close primitives, and one adaptive polling loop
/// per file currently under suspicion of having changed. Runs on its own
/// background thread; `record_comparison_result` is the feedback path a
/// compare-queue worker uses to tell a polling-mode task's outcome back
/// to the `PollingLoopState` that spawned it.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(config: &Config, queue: Arc<crate::queue::CompareQueue>) -> notify::Result<Self> {
        let watcher = FsWatcher::new(&config.watch_roots)?;
        let shared = Arc::new(DispatcherShared {
            roots: config.watch_roots.clone(),
            watcher: Mutex::new(Some(watcher)),
            filter: EventFilter::from_config(config),
            debouncer: Debouncer::new(Duration::from_secs_f64(config.debounce_interval_seconds)),
            open_close: OpenCloseTracker::new(),
            polling_config: PollingConfig::from_config(config),
            polling: Mutex::new(HashMap::new()),
            queue,
            stopping: AtomicBool::new(false),
            last_dispatch: Mutex::new(None),
            last_raw_event: Mutex::new(None),
            tick_interval: Duration::from_millis(200),
            monitor_only_roots: config.monitor_only_roots.clone(),
            immediate_compare_on_first_event: config.immediate_compare_on_first_event,
            seen: Mutex::new(HashSet::new()),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("sheetwatch-dispatcher".to_string())
            .spawn(move || {
                while !loop_shared.stopping.load(Ordering::SeqCst) {
                    loop_shared.run_once();
                }
            })
            .expect("failed to spawn dispatcher thread");

        Ok(Dispatcher { shared, thread: Some(thread) })
    }

    /// Feedback path from a compare-queue worker: tells the polling state
    /// for `path`, if one is still active, whether its triggered
    /// comparison found meaningful changes.
    pub fn record_comparison_result(&self, path: &Path, meaningful: bool) {
        let mut polling = self.shared.polling.lock().unwrap();
        if let Some(state) = polling.get_mut(path) {
            state.record_comparison(meaningful, Instant::now(), &self.shared.polling_config);
        }
    }

    /// A cloneable handle suitable for handing to the supervisor.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn stop(mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Implements `supervisor::WatcherHandle` over a `Dispatcher`'s shared
/// state, so the supervisor can observe and restart it without owning it.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<DispatcherShared>,
}

impl crate::supervisor::WatcherHandle for DispatcherHandle {
    fn is_alive(&self) -> bool {
        self.shared.watcher.lock().unwrap().is_some()
    }

    fn time_since_last_dispatch(&self) -> Option<Duration> {
        self.shared.last_dispatch.lock().unwrap().map(|t| t.elapsed())
    }

    fn probe(&self, timeout: Duration) -> bool {
        let Some(root) = self.shared.roots.first() else { return false };
        let probe_path = root.join(format!(".sheetwatch-probe-{}", std::process::id()));
        let t0 = Instant::now();
        if std::fs::write(&probe_path, b"probe").is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let observed = loop {
            let seen = self.shared.last_raw_event.lock().unwrap().map(|t| t >= t0).unwrap_or(false);
            if seen {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        let _ = std::fs::remove_file(&probe_path);
        observed
    }

    fn restart(&self) {
        let new_watcher = FsWatcher::new(&self.shared.roots).ok();
        *self.shared.watcher.lock().unwrap() = new_watcher;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_lock_sentinel_and_save_temp() {
        assert_eq!(
            office_temp_kind(Path::new("/dir/~$report.xlsx")),
            Some(OfficeTempKind::LockSentinel { basename: "report.xlsx".to_string() })
        );
        assert_eq!(office_temp_kind(Path::new("/dir/~WRL0001.tmp")), Some(OfficeTempKind::SaveTemp));
        assert_eq!(office_temp_kind(Path::new("/dir/report.xlsx.tmp")), Some(OfficeTempKind::SaveTemp));
        assert_eq!(office_temp_kind(Path::new("/dir/report.xlsx")), None);
    }

    #[test]
    fn lock_sentinel_path_is_sibling_with_prefix() {
        assert_eq!(lock_sentinel_path(Path::new("/dir/report.xlsx")), PathBuf::from("/dir/~$report.xlsx"));
    }

    #[test]
    fn event_filter_rejects_unsupported_extensions_and_temp_files() {
        let filter = EventFilter {
            cache_root: PathBuf::from("/cache"),
            log_root: PathBuf::from("/logs"),
            exclude_paths: Vec::new(),
            supported_extensions: ["xlsx", "xlsm"].iter().map(|s| s.to_string()).collect(),
        };
        assert!(filter.accepts(Path::new("/data/report.xlsx")));
        assert!(!filter.accepts(Path::new("/data/report.csv")));
        assert!(!filter.accepts(Path::new("/data/~$report.xlsx")));
    }

    #[test]
    fn event_filter_rejects_excluded_paths() {
        let filter = EventFilter {
            cache_root: PathBuf::from("/cache"),
            log_root: PathBuf::from("/logs"),
            exclude_paths: vec![PathBuf::from("/data/archive")],
            supported_extensions: ["xlsx", "xlsm"].iter().map(|s| s.to_string()).collect(),
        };
        assert!(filter.accepts(Path::new("/data/report.xlsx")));
        assert!(!filter.accepts(Path::new("/data/archive/old.xlsx")));
    }

    #[test]
    fn debouncer_collapses_rapid_events() {
        let debouncer = Debouncer::new(Duration::from_secs(1));
        let path = Path::new("/data/report.xlsx");
        let t0 = Instant::now();
        assert!(debouncer.admit(path, t0));
        assert!(!debouncer.admit(path, t0 + Duration::from_millis(100)));
        assert!(debouncer.admit(path, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn open_close_tracker_reports_held_duration() {
        let tracker = OpenCloseTracker::new();
        let path = Path::new("/data/report.xlsx");
        let t0 = Instant::now();
        tracker.mark_open(path, Some("alice".to_string()), t0);
        assert_eq!(tracker.opened_by(path), Some("alice".to_string()));
        let held = tracker.mark_closed(path, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(held.as_secs(), 5);
        assert!(tracker.mark_closed(path, t0).is_none());
    }

    fn test_polling_config() -> PollingConfig {
        PollingConfig {
            dense_interval: Duration::from_millis(10),
            sparse_interval: Duration::from_millis(50),
            size_threshold_bytes: 1024,
            stable_checks: 2,
            cooldown: Duration::from_millis(100),
        }
    }

    #[test]
    fn polling_state_compares_after_stable_run_then_terminates_on_no_change() {
        let config = test_polling_config();
        let mut state = PollingLoopState::new();
        let t0 = Instant::now();
        let sample = (None, 100u64);

        assert_eq!(state.tick(sample, t0, &config), PollAction::Continue);
        assert_eq!(state.tick(sample, t0 + Duration::from_millis(10), &config), PollAction::Compare);

        state.record_comparison(false, t0 + Duration::from_millis(10), &config);

        assert_eq!(state.tick(sample, t0 + Duration::from_millis(20), &config), PollAction::Continue);
        assert_eq!(state.tick(sample, t0 + Duration::from_millis(30), &config), PollAction::Terminate);
    }

    #[test]
    fn polling_state_enters_cooldown_after_meaningful_change() {
        let config = test_polling_config();
        let mut state = PollingLoopState::new();
        let t0 = Instant::now();
        let sample = (None, 100u64);

        state.tick(sample, t0, &config);
        state.tick(sample, t0 + Duration::from_millis(10), &config);
        state.record_comparison(true, t0 + Duration::from_millis(10), &config);

        // Still within cooldown: further ticks don't advance toward Compare.
        assert_eq!(state.tick(sample, t0 + Duration::from_millis(20), &config), PollAction::Continue);
        assert_eq!(state.tick(sample, t0 + Duration::from_millis(50), &config), PollAction::Continue);
    }

    #[test]
    fn polling_state_resets_stable_count_on_change() {
        let config = test_polling_config();
        let mut state = PollingLoopState::new();
        let t0 = Instant::now();

        assert_eq!(state.tick((None, 100), t0, &config), PollAction::Continue);
        assert_eq!(state.tick((None, 150), t0 + Duration::from_millis(10), &config), PollAction::Continue);
        assert_eq!(state.tick((None, 150), t0 + Duration::from_millis(20), &config), PollAction::Compare);
    }
}

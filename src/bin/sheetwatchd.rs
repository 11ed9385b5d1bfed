//! C12: process entrypoint. Parses CLI flags, loads configuration,
//! initializes logging, wires the baseline store, copy pipeline, parser,
//! classifier, timeline sink, compare queue, dispatcher and supervisor
//! together, then blocks until asked to shut down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use clap::Parser;

use sheetwatch::baseline::BaselineStore;
use sheetwatch::config::{CliOverrides, Config};
use sheetwatch::copy::{CopyEngine, CopyOptions, NativeBufferedEngine};
use sheetwatch::diff::{self, ClassifierPolicy};
use sheetwatch::error::{ErrorKind, Result};
use sheetwatch::model::{Baseline, ChangeEvent, FileIdentity};
use sheetwatch::parser::{self, ParserOptions};
use sheetwatch::queue::{CompareQueue, CompareTask, QueueOptions};
use sheetwatch::supervisor::{Supervisor, SupervisorOptions, WatcherHandle};
use sheetwatch::timeline::TimelineSink;
use sheetwatch::logging;
use sheetwatch::watch::{DispatchKind, Dispatcher};

#[derive(Parser, Debug)]
#[command(
    name = "sheetwatchd",
    version,
    about = "Watches Excel workbooks for changes and records cell-level diffs without disturbing the open file"
)]
struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// A directory to watch; may be given more than once.
    #[arg(long = "watch-root")]
    watch_root: Vec<PathBuf>,

    #[arg(long)]
    cache_root: Option<PathBuf>,

    #[arg(long)]
    log_root: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    max_concurrent_compares: Option<usize>,

    #[arg(long)]
    strict_no_original_read: Option<bool>,
}

impl Args {
    fn into_overrides(self) -> (Option<PathBuf>, CliOverrides) {
        let cli = CliOverrides {
            watch_roots: (!self.watch_root.is_empty()).then_some(self.watch_root),
            cache_root: self.cache_root,
            log_root: self.log_root,
            log_level: self.log_level,
            max_concurrent_compares: self.max_concurrent_compares,
            strict_no_original_read: self.strict_no_original_read,
        };
        (self.config, cli)
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();
    let (config_path, cli) = args.into_overrides();

    let config = match Config::load(config_path.as_deref(), cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sheetwatchd: configuration error: {e}");
            return 2;
        }
    };

    let _logging_guard = match logging::init(&config.log_root, &config.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("sheetwatchd: failed to initialize logging: {e}");
            return 2;
        }
    };

    tracing::info!(target: "sheetwatch", watch_roots = ?config.watch_roots, "starting");

    match run_daemon(config) {
        Ok(()) => {
            tracing::info!(target: "sheetwatch", "clean shutdown");
            0
        }
        Err(e) => {
            tracing::error!(target: "sheetwatch", error = %e, "unrecoverable supervisor failure");
            1
        }
    }
}

/// Everything a compare-queue worker needs to run one comparison. Shared
/// read-only across all workers; the only mutable piece (the baseline
/// file itself) is serialized by `BaselineStore`'s per-key lock.
struct CompareContext {
    baselines: Arc<BaselineStore>,
    timeline: Arc<TimelineSink>,
    copy_options: CopyOptions,
    copy_engine: Box<dyn CopyEngine>,
    parser_options: ParserOptions,
    classifier_policy: ClassifierPolicy,
    mtime_tolerance: Duration,
    sequence: AtomicU64,
}

/// Runs one full compare pass for `task` and returns whether it produced
/// a meaningful, newly-emitted change event (feeds back into the
/// dispatcher's adaptive polling loop).
fn handle_compare_task(task: &CompareTask, ctx: &CompareContext) -> bool {
    let path = &task.path;
    let polling_flag = task.kind == DispatchKind::Polling;
    let identity = FileIdentity::new(path);
    let base_key = identity.base_key.clone();

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            log_outcome(path, 0, &ErrorKind::SourceGone { path: path.clone() });
            return false;
        }
    };
    let current_size = metadata.len();
    let current_mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let baseline = match ctx.baselines.load(&base_key) {
        Ok(b) => b,
        Err(e) => {
            log_outcome(path, 0, &e);
            None
        }
    };

    if diff::quick_skip(baseline.as_ref(), current_mtime, current_size, polling_flag, ctx.mtime_tolerance) {
        logging::log_compare_result(path, 0, "SKIP", Some("quick_skip"));
        return false;
    }

    let stable_path = match sheetwatch::copy::stabilize(path, &ctx.copy_options, ctx.copy_engine.as_ref()) {
        Ok(p) => p,
        Err(e) => {
            log_outcome(path, 0, &e);
            return false;
        }
    };

    let parsed = match parser::parse_isolated(&stable_path, &ctx.parser_options) {
        Ok(p) => p,
        Err(e) => {
            log_outcome(path, 0, &e);
            return false;
        }
    };

    // A file seen for the first time has nothing to diff against: the
    // lifecycle is "baseline created", not "every cell added". Save the
    // baseline and stop here without touching the timeline.
    let Some(baseline) = baseline else {
        let sequence = ctx.sequence.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = save_baseline(ctx, &base_key, parsed, current_mtime, current_size) {
            log_outcome(path, sequence, &e);
            return false;
        }
        logging::log_compare_result(path, sequence, "SKIP", Some("first_seen"));
        return false;
    };

    let diffs = diff::diff_grids(&baseline.cells, &parsed.cells, &ctx.classifier_policy, polling_flag);

    let sequence = ctx.sequence.fetch_add(1, Ordering::SeqCst);
    let event = ChangeEvent {
        sequence,
        base_key: base_key.clone(),
        file_path: path.clone(),
        event_time: chrono::Utc::now(),
        counters: ChangeEvent::count_counters(&diffs),
        diffs,
        snapshot_path: None,
        author: parsed.last_author.clone(),
    };
    let meaningful = event.is_meaningful();

    if meaningful {
        if let Err(e) = ctx.timeline.record(&event, &parsed.cells) {
            log_outcome(path, sequence, &e);
            return false;
        }
    }

    if let Err(e) = save_baseline(ctx, &base_key, parsed, current_mtime, current_size) {
        log_outcome(path, sequence, &e);
        return false;
    }

    let tag = if meaningful { "OK" } else { "SKIP" };
    logging::log_compare_result(path, sequence, tag, None);
    meaningful
}

fn save_baseline(
    ctx: &CompareContext,
    base_key: &str,
    parsed: parser::ParsedWorkbook,
    current_mtime: i64,
    current_size: u64,
) -> Result<()> {
    let new_baseline = Baseline::new(
        parsed.cells,
        current_mtime,
        current_size,
        parsed.last_author,
        format!("{current_mtime}"),
    );
    ctx.baselines.save(base_key, &new_baseline)
}

fn log_outcome(path: &std::path::Path, sequence: u64, error: &ErrorKind) {
    logging::log_compare_result(path, sequence, error.result_tag(), Some(&error.to_string()));
}

/// A trigger a signal handler flips once; `wait` blocks until it does.
struct ShutdownSignal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    fn new() -> Arc<Self> {
        Arc::new(ShutdownSignal { flag: Mutex::new(false), condvar: Condvar::new() })
    }

    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.condvar.wait(flag).unwrap();
        }
    }

    fn trigger(&self) {
        *self.flag.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

fn run_daemon(config: Config) -> Result<()> {
    let baselines = Arc::new(BaselineStore::new(config.log_root.clone(), config.baseline_profile()?));
    let timeline = Arc::new(TimelineSink::open(
        config.log_root.clone(),
        config.baseline_profile()?,
        Duration::from_secs_f64(config.log_dedup_window_seconds),
    )?);

    let compare_ctx = Arc::new(CompareContext {
        baselines,
        timeline,
        copy_options: CopyOptions::from_config(&config),
        copy_engine: Box::new(NativeBufferedEngine),
        parser_options: ParserOptions {
            timeout: Duration::from_secs(config.parser_timeout_seconds),
            enable_formula_value_check: config.enable_formula_value_check,
            max_formula_value_cells: config.max_formula_value_cells,
            always_fetch_value_for_external_refs: config.always_fetch_value_for_external_refs,
        },
        classifier_policy: ClassifierPolicy::from_config(&config),
        mtime_tolerance: Duration::from_secs_f64(config.mtime_tolerance_seconds),
        sequence: AtomicU64::new(0),
    });

    // `Dispatcher::new` needs the queue up front, but the queue's handler
    // needs the dispatcher to report polling feedback back — this cell
    // is populated once the dispatcher exists, just after construction.
    let dispatcher_cell: Arc<Mutex<Option<Arc<Dispatcher>>>> = Arc::new(Mutex::new(None));

    let queue = Arc::new(CompareQueue::new(QueueOptions::from_config(&config), {
        let ctx = Arc::clone(&compare_ctx);
        let dispatcher_cell = Arc::clone(&dispatcher_cell);
        move |task: CompareTask| {
            let meaningful = handle_compare_task(&task, &ctx);
            if let Some(dispatcher) = dispatcher_cell.lock().unwrap().as_ref() {
                dispatcher.record_comparison_result(&task.path, meaningful);
            }
        }
    }));

    let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&queue)).map_err(|e| {
        ErrorKind::ConfigError(format!("failed to start filesystem watcher: {e}"))
    })?);
    let watcher_handle: Arc<dyn WatcherHandle> = Arc::new(dispatcher.handle());
    *dispatcher_cell.lock().unwrap() = Some(dispatcher);

    let supervisor = Supervisor::start(SupervisorOptions::from_config(&config), watcher_handle, || {
        tracing::info!(target: "sheetwatch::supervisor", "heartbeat");
    });

    let shutdown = ShutdownSignal::new();
    let signal_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || signal_shutdown.trigger())
        .map_err(|e| ErrorKind::ConfigError(format!("failed to install shutdown signal handler: {e}")))?;

    shutdown.wait();
    tracing::info!(target: "sheetwatch", "shutdown requested, draining");

    supervisor.stop();

    // The dispatcher must be torn down before the queue: it holds the
    // queue's only other strong reference, so the queue can't be
    // reclaimed by value until that reference is gone.
    match Arc::try_unwrap(dispatcher_cell.lock().unwrap().take().expect("dispatcher was set above")) {
        Ok(dispatcher) => dispatcher.stop(),
        Err(_) => tracing::warn!(target: "sheetwatch", "dispatcher still referenced elsewhere at shutdown, leaking its thread"),
    }

    match Arc::try_unwrap(queue) {
        Ok(queue) => queue.stop(Duration::from_secs(30)),
        Err(_) => tracing::warn!(target: "sheetwatch", "compare queue still referenced elsewhere at shutdown, leaking its workers"),
    }

    Ok(())
}

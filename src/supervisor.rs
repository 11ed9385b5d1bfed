//! Supervisor (C9): three cooperating background threads layered over the
//! dispatcher and compare queue — a liveness heartbeat, a watcher
//! healthcheck (with an optional create/delete probe file), and a
//! rate-limited auto-restart. All three run orthogonally to C6/C7/C8.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub enable_heartbeat: bool,
    pub heartbeat_interval: Duration,
    pub enable_healthcheck: bool,
    pub stall_threshold: Duration,
    pub probe_enabled: bool,
    pub probe_timeout: Duration,
    pub enable_auto_restart: bool,
    pub max_recoveries: u32,
    pub recovery_window: Duration,
    pub poll_interval: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        SupervisorOptions {
            enable_heartbeat: config.enable_heartbeat,
            heartbeat_interval: Duration::from_secs_f64(config.heartbeat_interval_seconds),
            enable_healthcheck: config.enable_observer_healthcheck,
            stall_threshold: Duration::from_secs_f64(config.observer_stall_threshold_seconds),
            probe_enabled: config.observer_probe_enabled,
            probe_timeout: Duration::from_secs_f64(config.observer_probe_timeout_seconds),
            enable_auto_restart: config.enable_auto_restart_observer,
            max_recoveries: config.max_recoveries,
            recovery_window: Duration::from_secs_f64(config.recovery_window_seconds),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the supervisor observes about, and can do to, the watcher it's
/// guarding. Implemented by whatever owns the real C6 dispatcher.
pub trait WatcherHandle: Send + Sync {
    /// Whether the watcher's background thread is still alive.
    fn is_alive(&self) -> bool;
    /// How long since the dispatcher last forwarded an event, if ever.
    fn time_since_last_dispatch(&self) -> Option<Duration>;
    /// Creates then deletes a tiny probe file inside a watched root and
    /// reports whether the dispatcher observed an event for it within
    /// `timeout`.
    fn probe(&self, timeout: Duration) -> bool;
    /// Tears down and reconstructs the watcher over the current root set.
    fn restart(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthVerdict {
    Healthy,
    Stalled,
    Dead,
}

/// Tracks how many recovery attempts have landed within a sliding
/// `window`, capping at `max_recoveries`.
struct RecoveryBudget {
    max_recoveries: u32,
    window: Duration,
    attempts: Mutex<VecDeque<Instant>>,
}

impl RecoveryBudget {
    fn new(max_recoveries: u32, window: Duration) -> Self {
        RecoveryBudget { max_recoveries, window, attempts: Mutex::new(VecDeque::new()) }
    }

    /// Records an attempt at `now` and returns whether the budget still
    /// allows it. A denied attempt is not recorded, so the window doesn't
    /// fill up with attempts that never actually ran.
    fn try_consume(&self, now: Instant) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        while let Some(&front) = attempts.front() {
            if now.duration_since(front) > self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() as u32 >= self.max_recoveries {
            return false;
        }
        attempts.push_back(now);
        true
    }
}

fn assess(watcher: &dyn WatcherHandle, options: &SupervisorOptions) -> HealthVerdict {
    if !watcher.is_alive() {
        return HealthVerdict::Dead;
    }
    let stalled = watcher.time_since_last_dispatch().map(|d| d >= options.stall_threshold).unwrap_or(false);
    if !stalled {
        return HealthVerdict::Healthy;
    }
    if options.probe_enabled && watcher.probe(options.probe_timeout) {
        return HealthVerdict::Healthy;
    }
    HealthVerdict::Stalled
}

/// Handle to the running supervisor threads. Dropping without calling
/// `stop` leaves the threads running detached.
pub struct Supervisor {
    stopping: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn start<F>(options: SupervisorOptions, watcher: Arc<dyn WatcherHandle>, on_heartbeat: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let stopping = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        if options.enable_heartbeat {
            let stopping = Arc::clone(&stopping);
            let interval = options.heartbeat_interval;
            threads.push(
                std::thread::Builder::new()
                    .name("sheetwatch-heartbeat".to_string())
                    .spawn(move || {
                        while !stopping.load(Ordering::SeqCst) {
                            std::thread::sleep(interval);
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            on_heartbeat();
                        }
                    })
                    .expect("failed to spawn heartbeat thread"),
            );
        }

        if options.enable_healthcheck {
            let stopping = Arc::clone(&stopping);
            let budget = RecoveryBudget::new(options.max_recoveries, options.recovery_window);
            let opts = options.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("sheetwatch-healthcheck".to_string())
                    .spawn(move || {
                        while !stopping.load(Ordering::SeqCst) {
                            std::thread::sleep(opts.poll_interval);
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            let verdict = assess(&*watcher, &opts);
                            if verdict == HealthVerdict::Healthy || !opts.enable_auto_restart {
                                continue;
                            }
                            if budget.try_consume(Instant::now()) {
                                watcher.restart();
                            }
                        }
                    })
                    .expect("failed to spawn healthcheck thread"),
            );
        }

        Supervisor { stopping, threads }
    }

    pub fn stop(mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

//! Bounded-concurrency compare queue (C7): one worker pool keyed by file
//! path, with keep-latest-per-key submission semantics. A task that is
//! still pending (not yet picked up by a worker) is replaced in place by
//! a newer submission for the same path; a task that is already running
//! is never cancelled, and a resubmission for that path simply becomes
//! the next pending task for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::watch::DispatchKind;

#[derive(Debug, Clone)]
pub struct CompareTask {
    pub path: PathBuf,
    pub kind: DispatchKind,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_workers: usize,
    /// When false, submissions for the same path are never collapsed:
    /// every `submit` call produces a distinct unit of work.
    pub dedup_pending_events: bool,
}

impl QueueOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        QueueOptions {
            max_workers: config.max_concurrent_compares.max(1),
            dedup_pending_events: config.dedup_pending_events,
        }
    }
}

struct QueueState {
    pending: HashMap<String, CompareTask>,
    order: VecDeque<String>,
    running: HashSet<String>,
}

struct Shared {
    state: Mutex<QueueState>,
    condvar: Condvar,
    stopping: AtomicBool,
    dedup_pending_events: bool,
    sequence: AtomicU64,
}

/// A running compare-queue worker pool. Drop without calling `stop` and
/// the workers keep running detached; always call `stop` on shutdown.
pub struct CompareQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CompareQueue {
    pub fn new<F>(options: QueueOptions, handler: F) -> Self
    where
        F: Fn(CompareTask) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState { pending: HashMap::new(), order: VecDeque::new(), running: HashSet::new() }),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
            dedup_pending_events: options.dedup_pending_events,
            sequence: AtomicU64::new(0),
        });
        let handler = Arc::new(handler);
        let workers = (0..options.max_workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                std::thread::Builder::new()
                    .name(format!("sheetwatch-compare-{i}"))
                    .spawn(move || run_worker(shared, handler))
                    .expect("failed to spawn compare-queue worker thread")
            })
            .collect();
        CompareQueue { shared, workers }
    }

    fn key_for(&self, path: &PathBuf) -> String {
        if self.shared.dedup_pending_events {
            path.to_string_lossy().into_owned()
        } else {
            let n = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
            format!("{}#{n}", path.to_string_lossy())
        }
    }

    /// Submits a task. If an equivalent-key task is already pending (not
    /// yet started), it is replaced by this one. Dropped silently once
    /// the queue has been asked to stop.
    pub fn submit(&self, task: CompareTask) {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        let key = self.key_for(&task.path);
        let mut state = self.shared.state.lock().unwrap();
        let is_new = !state.pending.contains_key(&key);
        state.pending.insert(key.clone(), task);
        if is_new {
            state.order.push_back(key);
        }
        drop(state);
        self.shared.condvar.notify_one();
    }

    /// Requests that no new tasks start. In-flight tasks are given up to
    /// `deadline` to finish; workers that overrun it are left running
    /// detached (Rust cannot forcibly terminate a thread).
    pub fn stop(mut self, deadline: Duration) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        let start = Instant::now();
        for worker in self.workers.drain(..) {
            while !worker.is_finished() && start.elapsed() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }
}

fn run_worker(shared: Arc<Shared>, handler: Arc<dyn Fn(CompareTask) + Send + Sync>) {
    loop {
        let (key, task) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if shared.stopping.load(Ordering::SeqCst) {
                    return;
                }
                let next = state.order.iter().position(|k| !state.running.contains(k));
                match next {
                    Some(pos) => {
                        let key = state.order.remove(pos).unwrap();
                        let task = state.pending.remove(&key).expect("queued key without a pending task");
                        state.running.insert(key.clone());
                        break (key, task);
                    }
                    None => {
                        state = shared.condvar.wait(state).unwrap();
                    }
                }
            }
        };

        handler(task);

        let mut state = shared.state.lock().unwrap();
        state.running.remove(&key);
        drop(state);
        shared.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn task(path: &str, kind: DispatchKind) -> CompareTask {
        CompareTask { path: PathBuf::from(path), kind }
    }

    #[test]
    fn runs_a_single_submitted_task() {
        let (tx, rx) = mpsc::channel();
        let queue = CompareQueue::new(QueueOptions { max_workers: 1, dedup_pending_events: true }, move |t| {
            tx.send(t.path).unwrap();
        });
        queue.submit(task("a.xlsx", DispatchKind::Immediate));
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, PathBuf::from("a.xlsx"));
        queue.stop(Duration::from_secs(1));
    }

    #[test]
    fn keeps_latest_pending_task_for_the_same_path() {
        let (busy_tx, busy_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (done_tx, done_rx) = mpsc::channel();

        let queue = CompareQueue::new(QueueOptions { max_workers: 1, dedup_pending_events: true }, move |t| {
            if t.path == PathBuf::from("blocker.xlsx") {
                busy_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            done_tx.send(t).unwrap();
        });

        // Occupy the single worker so subsequent submissions stay pending.
        queue.submit(task("blocker.xlsx", DispatchKind::Immediate));
        busy_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        queue.submit(task("report.xlsx", DispatchKind::Polling));
        queue.submit(task("report.xlsx", DispatchKind::Immediate));
        assert_eq!(queue.pending_len(), 1);

        release_tx.send(()).unwrap();

        let first = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.path, PathBuf::from("blocker.xlsx"));
        let second = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.path, PathBuf::from("report.xlsx"));
        assert_eq!(second.kind, DispatchKind::Immediate);
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        queue.stop(Duration::from_secs(1));
    }

    #[test]
    fn disabling_dedup_runs_every_submission() {
        let (tx, rx) = mpsc::channel();
        let queue = CompareQueue::new(QueueOptions { max_workers: 1, dedup_pending_events: false }, move |t| {
            tx.send(t.path).unwrap();
        });
        queue.submit(task("a.xlsx", DispatchKind::Immediate));
        queue.submit(task("a.xlsx", DispatchKind::Immediate));
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, PathBuf::from("a.xlsx"));
        assert_eq!(second, PathBuf::from("a.xlsx"));
        queue.stop(Duration::from_secs(1));
    }

    #[test]
    fn stop_lets_in_flight_work_finish() {
        let (tx, rx) = mpsc::channel();
        let queue = CompareQueue::new(QueueOptions { max_workers: 1, dedup_pending_events: true }, move |t| {
            std::thread::sleep(Duration::from_millis(50));
            tx.send(t.path).unwrap();
        });
        queue.submit(task("a.xlsx", DispatchKind::Immediate));
        std::thread::sleep(Duration::from_millis(10));
        queue.stop(Duration::from_secs(2));
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), PathBuf::from("a.xlsx"));
    }
}

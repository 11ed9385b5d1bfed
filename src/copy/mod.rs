//! Stable-copy pipeline (C3): produce a byte-identical, safe-to-read
//! snapshot of a source file that may be open in an editor, mid-save, or
//! sitting on a slow network share.
//!
//! The six steps run strictly in order: identity check, lock-sentinel
//! wait, stability probe, chunked copy with retry, post-copy settle
//! verification, safe-filename destination. Every exit besides success
//! surfaces one of `ErrorKind::SourceUnstable`, `ErrorKind::LockPresent`,
//! `ErrorKind::CopyFailed`, `ErrorKind::SourceGone`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{ErrorKind, Result};
use crate::model::baseline_key;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub cache_root: PathBuf,
    pub chunk_size_bytes: usize,
    pub stability_checks: u32,
    pub stability_interval: Duration,
    pub stability_max_wait: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub post_copy_sleep: Duration,
}

impl CopyOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        CopyOptions {
            cache_root: config.cache_root.clone(),
            chunk_size_bytes: (config.copy_chunk_size_mb.max(1) * 1024 * 1024) as usize,
            stability_checks: config.copy_stability_checks,
            stability_interval: Duration::from_secs_f64(config.copy_stability_interval_seconds),
            stability_max_wait: Duration::from_secs_f64(config.copy_stability_max_wait_seconds),
            retry_count: config.copy_retry_count,
            retry_backoff: Duration::from_secs_f64(config.copy_retry_backoff_seconds),
            post_copy_sleep: Duration::from_secs_f64(config.copy_post_sleep_seconds),
        }
    }
}

/// A pluggable copy transport. The contract (byte-identical destination,
/// chunked so no single handle is held for long) is the same whatever the
/// engine; only the mechanism changes.
pub trait CopyEngine: Send + Sync {
    fn copy(&self, src: &Path, dst: &Path, chunk_size: usize) -> std::io::Result<()>;
}

/// Plain buffered `read`/`write_all` loop.
pub struct NativeBufferedEngine;

impl CopyEngine for NativeBufferedEngine {
    fn copy(&self, src: &Path, dst: &Path, chunk_size: usize) -> std::io::Result<()> {
        let mut reader = std::fs::File::open(src)?;
        let mut writer = std::fs::File::create(dst)?;
        let mut buf = vec![0u8; chunk_size.max(4096)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        writer.flush()
    }
}

/// Shells out to a platform copy tool that supports resuming a partial
/// transfer (`robocopy /Z` on Windows, `rsync --partial --inplace`
/// elsewhere). Useful on slow network shares where a held file handle
/// is itself a liability.
pub struct SubprocessResumeEngine;

impl CopyEngine for SubprocessResumeEngine {
    fn copy(&self, src: &Path, dst: &Path, _chunk_size: usize) -> std::io::Result<()> {
        run_subprocess_copy(src, dst, &["/Z", "/NFL", "/NDL", "/NJH", "/NJS"], &["--partial", "--inplace"])
    }
}

/// Shells out to the platform copy tool's most defensive mode
/// (`robocopy /Z /R:5 /W:1` / `rsync --partial --checksum`), trading
/// speed for resilience against an unreliable transport.
pub struct SubprocessRobustEngine;

impl CopyEngine for SubprocessRobustEngine {
    fn copy(&self, src: &Path, dst: &Path, _chunk_size: usize) -> std::io::Result<()> {
        run_subprocess_copy(src, dst, &["/Z", "/R:5", "/W:1", "/NFL", "/NDL", "/NJH", "/NJS"], &["--partial", "--checksum"])
    }
}

fn run_subprocess_copy(src: &Path, dst: &Path, robocopy_flags: &[&str], rsync_flags: &[&str]) -> std::io::Result<()> {
    #[cfg(target_os = "windows")]
    {
        let src_dir = src.parent().unwrap_or_else(|| Path::new("."));
        let dst_dir = dst.parent().unwrap_or_else(|| Path::new("."));
        let filename = src.file_name().unwrap_or_default();
        let status = std::process::Command::new("robocopy")
            .arg(src_dir)
            .arg(dst_dir)
            .arg(filename)
            .args(robocopy_flags)
            .status()?;
        // robocopy's exit codes below 8 all indicate some form of success.
        if status.code().map(|c| c < 8).unwrap_or(false) {
            let copied = dst_dir.join(filename);
            if copied != dst {
                std::fs::rename(&copied, dst)?;
            }
            Ok(())
        } else {
            Err(std::io::Error::other(format!("robocopy exited with {status}")))
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        let status = std::process::Command::new("rsync").args(rsync_flags).arg(src).arg(dst).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("rsync exited with {status}")))
        }
    }
}

/// Runs the full six-step pipeline and returns a path to a stable copy of
/// `src` under `options.cache_root`.
pub fn stabilize(src: &Path, options: &CopyOptions, engine: &dyn CopyEngine) -> Result<PathBuf> {
    if is_inside(src, &options.cache_root) {
        return Ok(src.to_path_buf());
    }
    if lock_sentinel_path(src).exists() {
        return Err(ErrorKind::LockPresent { path: src.to_path_buf() });
    }
    wait_for_stability(src, options)?;

    let dest = cache_destination(src, &options.cache_root);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ErrorKind::Io { path: parent.to_path_buf(), source: e })?;
    }

    let mut backoff = options.retry_backoff;
    let retry_count = options.retry_count.max(1);
    for attempt in 1..=retry_count {
        let copied = engine.copy(src, &dest, options.chunk_size_bytes).is_ok() && settled(src, &dest, options);
        if copied {
            return Ok(dest);
        }
        if attempt < retry_count {
            std::thread::sleep(backoff);
            backoff *= 2;
        }
    }
    Err(ErrorKind::CopyFailed { path: src.to_path_buf(), attempts: retry_count })
}

fn is_inside(src: &Path, cache_root: &Path) -> bool {
    let src_canon = std::fs::canonicalize(src).unwrap_or_else(|_| src.to_path_buf());
    let cache_canon = std::fs::canonicalize(cache_root).unwrap_or_else(|_| cache_root.to_path_buf());
    src_canon.starts_with(cache_canon)
}

fn lock_sentinel_path(src: &Path) -> PathBuf {
    let dir = src.parent().unwrap_or_else(|| Path::new("."));
    let basename = src.file_name().and_then(|n| n.to_str()).unwrap_or("");
    dir.join(format!("~${basename}"))
}

/// `sanitize(basename) + "__" + short_hash(path)`, reusing the same
/// collision-proof naming the baseline store uses.
fn cache_destination(src: &Path, cache_root: &Path) -> PathBuf {
    cache_root.join(baseline_key(src))
}

fn wait_for_stability(src: &Path, options: &CopyOptions) -> Result<()> {
    let start = Instant::now();
    let mut last: Option<(Option<SystemTime>, u64)> = None;
    let mut stable_count = 0u32;
    loop {
        let meta = std::fs::metadata(src).map_err(|_| ErrorKind::SourceGone { path: src.to_path_buf() })?;
        let sample = (meta.modified().ok(), meta.len());
        if last == Some(sample) {
            stable_count += 1;
        } else {
            stable_count = 1;
            last = Some(sample);
        }
        if stable_count >= options.stability_checks.max(1) {
            return Ok(());
        }
        if start.elapsed() >= options.stability_max_wait {
            return Err(ErrorKind::SourceUnstable { path: src.to_path_buf(), attempts: stable_count });
        }
        std::thread::sleep(options.stability_interval);
    }
}

fn settled(src: &Path, dest: &Path, options: &CopyOptions) -> bool {
    std::thread::sleep(options.post_copy_sleep);
    let (Ok(src_meta), Ok(dest_meta)) = (std::fs::metadata(src), std::fs::metadata(dest)) else {
        return false;
    };
    if dest_meta.len() < src_meta.len() {
        return false;
    }
    match (src_meta.modified(), dest_meta.modified()) {
        (Ok(s), Ok(d)) => {
            let delta = if s > d { s.duration_since(d) } else { d.duration_since(s) };
            delta.map(|delta| delta <= Duration::from_secs(2)).unwrap_or(false)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::write(path, contents).unwrap();
    }

    fn test_options(cache_root: PathBuf) -> CopyOptions {
        CopyOptions {
            cache_root,
            chunk_size_bytes: 64 * 1024,
            stability_checks: 1,
            stability_interval: Duration::from_millis(1),
            stability_max_wait: Duration::from_millis(200),
            retry_count: 2,
            retry_backoff: Duration::from_millis(1),
            post_copy_sleep: Duration::from_millis(0),
        }
    }

    #[test]
    fn identity_check_returns_path_inside_cache_root_verbatim() {
        let cache_dir = tempfile::tempdir().unwrap();
        let inside = cache_dir.path().join("already_cached.xlsx");
        write_file(&inside, b"hello");
        let options = test_options(cache_dir.path().to_path_buf());
        let result = stabilize(&inside, &options, &NativeBufferedEngine).unwrap();
        assert_eq!(result, inside);
    }

    #[test]
    fn lock_sentinel_present_is_reported() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("report.xlsx");
        write_file(&src, b"data");
        write_file(&src_dir.path().join("~$report.xlsx"), b"");

        let options = test_options(cache_dir.path().to_path_buf());
        let result = stabilize(&src, &options, &NativeBufferedEngine);
        assert!(matches!(result, Err(ErrorKind::LockPresent { .. })));
    }

    #[test]
    fn stable_file_is_copied_byte_identical() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("report.xlsx");
        write_file(&src, b"workbook contents go here");

        let options = test_options(cache_dir.path().to_path_buf());
        let dest = stabilize(&src, &options, &NativeBufferedEngine).unwrap();
        assert!(dest.starts_with(cache_dir.path()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"workbook contents go here");
    }

    struct AlwaysFailEngine {
        attempts: AtomicU32,
    }

    impl CopyEngine for AlwaysFailEngine {
        fn copy(&self, _src: &Path, _dst: &Path, _chunk_size: usize) -> std::io::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::other("simulated copy failure"))
        }
    }

    #[test]
    fn exhausted_retries_report_copy_failed() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("report.xlsx");
        write_file(&src, b"data");

        let options = test_options(cache_dir.path().to_path_buf());
        let engine = AlwaysFailEngine { attempts: AtomicU32::new(0) };
        let result = stabilize(&src, &options, &engine);
        assert!(matches!(result, Err(ErrorKind::CopyFailed { attempts: 2, .. })));
        assert_eq!(engine.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_source_is_reported_as_source_gone() {
        let cache_dir = tempfile::tempdir().unwrap();
        let missing = PathBuf::from("/nonexistent/path/gone.xlsx");
        let options = test_options(cache_dir.path().to_path_buf());
        let result = stabilize(&missing, &options, &NativeBufferedEngine);
        assert!(matches!(result, Err(ErrorKind::SourceGone { .. })));
    }
}

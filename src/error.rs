//! Closed error taxonomy shared across every component (C1-C9).
//!
//! Each variant maps to exactly one `ErrorKind` named in the component
//! design: C3 (stable-copy), C2 (parser), C1/C4 (codec/baseline), C7
//! (queue), C8 (timeline), C9 (supervisor) and startup configuration. No
//! error crosses the compare-queue worker boundary unconverted.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    // -- C10: configuration --
    #[error("configuration error: {0}")]
    ConfigError(String),

    // -- C3: stable-copy pipeline --
    #[error("source file unstable after {attempts} probe(s): {path}")]
    SourceUnstable { path: PathBuf, attempts: u32 },

    #[error("lock sentinel present for {path}")]
    LockPresent { path: PathBuf },

    #[error("failed to copy {path} after {attempts} attempt(s)")]
    CopyFailed { path: PathBuf, attempts: u32 },

    #[error("source file gone: {path}")]
    SourceGone { path: PathBuf },

    // -- C2: workbook parser --
    #[error("not a workbook: {path}")]
    NotAWorkbook { path: PathBuf },

    #[error("corrupt package: {path}: {source}")]
    CorruptPackage {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("parser crashed on {path}: {message}")]
    ParserCrashed { path: PathBuf, message: String },

    #[error("parser timed out on {path} after {seconds}s")]
    ParserTimeout { path: PathBuf, seconds: u64 },

    // -- C1 / C4: codec and baseline store --
    #[error("corrupt baseline for key {key}")]
    CorruptBaseline { key: String },

    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("unknown compression codec (magic byte {0:#x})")]
    UnknownCodec(u8),

    // -- C7: compare queue --
    #[error("queue is shutting down")]
    QueueShutdown,

    // -- C8: timeline & history sink --
    #[error("timeline store error: {0}")]
    TimelineError(String),

    // -- C9: supervisor --
    #[error("watcher thread is dead")]
    WatcherDead,

    #[error("watcher stalled: no events observed for {seconds}s")]
    WatcherStalled { seconds: u64 },

    #[error("healthcheck probe failed: {0}")]
    ProbeFailed(String),

    // -- generic I/O escape hatch --
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

impl From<crate::ooxml::OoxmlError> for ErrorKind {
    fn from(err: crate::ooxml::OoxmlError) -> Self {
        ErrorKind::CorruptPackage {
            path: PathBuf::new(),
            source: Box::new(err),
        }
    }
}

impl ErrorKind {
    /// The one-line result tag a C7 worker logs for this outcome.
    pub fn result_tag(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnstable { .. }
            | ErrorKind::LockPresent { .. }
            | ErrorKind::SourceGone { .. }
            | ErrorKind::NotAWorkbook { .. } => "SKIP",
            ErrorKind::CorruptPackage { .. }
            | ErrorKind::CorruptBaseline { .. }
            | ErrorKind::CorruptPayload(_)
            | ErrorKind::UnknownCodec(_)
            | ErrorKind::Io { .. } => "READ_ERROR",
            ErrorKind::ParserTimeout { .. } => "TIMEOUT",
            ErrorKind::CopyFailed { .. } | ErrorKind::ParserCrashed { .. } | ErrorKind::TimelineError(_) => {
                "SAVE_ERROR"
            }
            ErrorKind::ConfigError(_)
            | ErrorKind::QueueShutdown
            | ErrorKind::WatcherDead
            | ErrorKind::WatcherStalled { .. }
            | ErrorKind::ProbeFailed(_) => "READ_ERROR",
        }
    }
}

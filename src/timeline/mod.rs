//! Timeline & history sink (C8): an embedded SQLite event index, one
//! write-once snapshot file per meaningful change, and a dual-stream
//! change-log (codec-compressed archival copy plus a plain UTF-8-with-BOM
//! `.csv` that spreadsheet tools can open directly).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{self, Profile};
use crate::diff::DedupTracker;
use crate::error::{ErrorKind, Result};
use crate::model::{CellGrid, ChangeEvent};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS change_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_key TEXT NOT NULL,
    event_time TEXT NOT NULL,
    file_path TEXT NOT NULL,
    author TEXT,
    sequence INTEGER NOT NULL,
    counters_json TEXT NOT NULL,
    snapshot_path TEXT,
    UNIQUE(base_key, event_time)
);
CREATE INDEX IF NOT EXISTS idx_change_events_base_key_time ON change_events(base_key, event_time);
CREATE INDEX IF NOT EXISTS idx_change_events_file ON change_events(file_path);
CREATE INDEX IF NOT EXISTS idx_change_events_author ON change_events(author);
";

const CSV_HEADER: &str =
    "timestamp,filename,sheet,address,classification,old_value,new_value,old_formula,new_formula,last_author\n";

fn sql_err(err: rusqlite::Error) -> ErrorKind {
    ErrorKind::TimelineError(err.to_string())
}

/// A row read back from the event index.
#[derive(Debug, Clone)]
pub struct ChangeEventRecord {
    pub base_key: String,
    pub event_time: DateTime<Utc>,
    pub file_path: PathBuf,
    pub author: Option<String>,
    pub sequence: u64,
    pub counters: BTreeMap<String, u32>,
    pub snapshot_path: Option<PathBuf>,
}

/// Filter for `TimelineSink::query`. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub base_key: Option<String>,
    pub author: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_counter: Option<(&'static str, u32)>,
}

pub struct TimelineSink {
    history_root: PathBuf,
    csv_plain_path: PathBuf,
    csv_compressed_path: PathBuf,
    profile: Profile,
    conn: Mutex<Connection>,
    dedup: DedupTracker,
}

impl TimelineSink {
    pub fn open(log_root: impl Into<PathBuf>, profile: Profile, dedup_window: Duration) -> Result<Self> {
        let log_root = log_root.into();
        let history_root = log_root.join("history");
        std::fs::create_dir_all(&history_root).map_err(|e| ErrorKind::Io { path: history_root.clone(), source: e })?;

        let db_path = log_root.join("events.sqlite3");
        let conn = Connection::open(&db_path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(sql_err)?;

        Ok(TimelineSink {
            csv_plain_path: log_root.join("changelog.csv"),
            csv_compressed_path: log_root.join(format!("changelog.csv.{}", profile.extension())),
            history_root,
            profile,
            conn: Mutex::new(conn),
            dedup: DedupTracker::new(dedup_window),
        })
    }

    /// Records a meaningful change event: writes its post-change snapshot,
    /// inserts an index row (ignored if a duplicate within the dedup
    /// window already exists), and appends its diffs to the change log.
    /// Returns `false` if the event was dropped as empty or a duplicate.
    pub fn record(&self, event: &ChangeEvent, cells_after: &CellGrid) -> Result<bool> {
        if !event.is_meaningful() {
            return Ok(false);
        }
        if !self.dedup.should_emit(&event.file_path, &event.diffs) {
            return Ok(false);
        }

        let snapshot_path = self.write_snapshot(event, cells_after)?;
        let inserted = self.insert_index_row(event, &snapshot_path)?;
        if inserted {
            self.append_change_log(event)?;
        }
        Ok(inserted)
    }

    fn write_snapshot(&self, event: &ChangeEvent, cells_after: &CellGrid) -> Result<PathBuf> {
        let dir = self.history_root.join(&event.base_key);
        std::fs::create_dir_all(&dir).map_err(|e| ErrorKind::Io { path: dir.clone(), source: e })?;

        let stamp = event.event_time.format("%Y%m%d_%H%M%S_%6f");
        let filename = format!("{stamp}_{}.cells.json.{}", event.sequence, self.profile.extension());
        let path = dir.join(filename);

        let payload = serde_json::json!({
            "timestamp": event.event_time.to_rfc3339(),
            "file": event.file_path,
            "last_author": event.author,
            "event_number": event.sequence,
            "cells": cells_after,
        });
        let json = serde_json::to_vec(&payload).map_err(|e| ErrorKind::TimelineError(e.to_string()))?;
        let encoded = codec::encode(&json, self.profile, 0)?;
        std::fs::write(&path, encoded).map_err(|e| ErrorKind::Io { path: path.clone(), source: e })?;
        Ok(path)
    }

    fn insert_index_row(&self, event: &ChangeEvent, snapshot_path: &Path) -> Result<bool> {
        let counters_json = serde_json::to_string(&event.counters).map_err(|e| ErrorKind::TimelineError(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO change_events
                 (base_key, event_time, file_path, author, sequence, counters_json, snapshot_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.base_key,
                    event.event_time.to_rfc3339(),
                    event.file_path.to_string_lossy().into_owned(),
                    event.author,
                    event.sequence as i64,
                    counters_json,
                    snapshot_path.to_string_lossy().into_owned(),
                ],
            )
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    fn append_change_log(&self, event: &ChangeEvent) -> Result<()> {
        let is_new = !self.csv_plain_path.is_file();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_plain_path)
            .map_err(|e| ErrorKind::Io { path: self.csv_plain_path.clone(), source: e })?;
        if is_new {
            file.write_all(b"\xEF\xBB\xBF").map_err(|e| ErrorKind::Io { path: self.csv_plain_path.clone(), source: e })?;
            file.write_all(CSV_HEADER.as_bytes())
                .map_err(|e| ErrorKind::Io { path: self.csv_plain_path.clone(), source: e })?;
        }

        {
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&mut file);
            for diff in &event.diffs {
                let old_value = diff.old_cell.as_ref().and_then(|c| c.display_value()).map(|s| s.display()).unwrap_or_default();
                let new_value = diff.new_cell.as_ref().and_then(|c| c.display_value()).map(|s| s.display()).unwrap_or_default();
                let old_formula = diff.old_cell.as_ref().and_then(|c| c.formula.clone()).unwrap_or_default();
                let new_formula = diff.new_cell.as_ref().and_then(|c| c.formula.clone()).unwrap_or_default();
                writer
                    .write_record([
                        event.event_time.to_rfc3339(),
                        event.file_path.to_string_lossy().into_owned(),
                        diff.sheet.clone(),
                        diff.address.clone(),
                        diff.classification.tag().to_string(),
                        old_value,
                        new_value,
                        old_formula,
                        new_formula,
                        event.author.clone().unwrap_or_default(),
                    ])
                    .map_err(|e| ErrorKind::TimelineError(e.to_string()))?;
            }
            writer.flush().map_err(|e| ErrorKind::Io { path: self.csv_plain_path.clone(), source: e })?;
        }

        self.resync_compressed_mirror()
    }

    /// Re-compresses the full plain CSV into its archival mirror. Simple
    /// and correct for a log this framed codec can't append to in place;
    /// not a streaming write.
    fn resync_compressed_mirror(&self) -> Result<()> {
        let bytes = std::fs::read(&self.csv_plain_path).map_err(|e| ErrorKind::Io { path: self.csv_plain_path.clone(), source: e })?;
        let encoded = codec::encode(&bytes, self.profile, 0)?;
        let tmp_path = self.csv_compressed_path.with_extension(format!("{}.tmp", self.profile.extension()));
        std::fs::write(&tmp_path, &encoded).map_err(|e| ErrorKind::Io { path: tmp_path.clone(), source: e })?;
        std::fs::rename(&tmp_path, &self.csv_compressed_path)
            .map_err(|e| ErrorKind::Io { path: self.csv_compressed_path.clone(), source: e })
    }

    /// Range/filter query over the event index, newest first.
    pub fn query(&self, query: &EventQuery) -> Result<Vec<ChangeEventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT base_key, event_time, file_path, author, sequence, counters_json, snapshot_path FROM change_events WHERE 1=1",
        );
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(base_key) = &query.base_key {
            sql.push_str(" AND base_key = ?");
            bound.push(Box::new(base_key.clone()));
        }
        if let Some(author) = &query.author {
            sql.push_str(" AND author = ?");
            bound.push(Box::new(author.clone()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND event_time >= ?");
            bound.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND event_time <= ?");
            bound.push(Box::new(until.to_rfc3339()));
        }
        sql.push_str(" ORDER BY event_time DESC");

        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                let event_time: String = row.get(1)?;
                let file_path: String = row.get(2)?;
                let counters_json: String = row.get(5)?;
                let snapshot_path: Option<String> = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    event_time,
                    file_path,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    counters_json,
                    snapshot_path,
                ))
            })
            .map_err(sql_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (base_key, event_time, file_path, author, sequence, counters_json, snapshot_path) =
                row.map_err(sql_err)?;
            let event_time = DateTime::parse_from_rfc3339(&event_time)
                .map_err(|e| ErrorKind::TimelineError(e.to_string()))?
                .with_timezone(&Utc);
            let counters: BTreeMap<String, u32> =
                serde_json::from_str(&counters_json).map_err(|e| ErrorKind::TimelineError(e.to_string()))?;

            if let Some((tag, threshold)) = query.min_counter {
                if counters.get(tag).copied().unwrap_or(0) < threshold {
                    continue;
                }
            }

            out.push(ChangeEventRecord {
                base_key,
                event_time,
                file_path: PathBuf::from(file_path),
                author,
                sequence: sequence as u64,
                counters,
                snapshot_path: snapshot_path.map(PathBuf::from),
            });
        }
        Ok(out)
    }

    /// Looks up a single event row by its natural key, used by tests and
    /// by idempotence checks that want an explicit answer rather than a
    /// range scan.
    pub fn find(&self, base_key: &str, event_time: DateTime<Utc>) -> Result<Option<ChangeEventRecord>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT author, sequence, counters_json, snapshot_path FROM change_events WHERE base_key = ?1 AND event_time = ?2",
                params![base_key, event_time.to_rfc3339()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        Ok(found.map(|(author, sequence, counters_json, snapshot_path)| ChangeEventRecord {
            base_key: base_key.to_string(),
            event_time,
            file_path: PathBuf::new(),
            author,
            sequence: sequence as u64,
            counters: serde_json::from_str(&counters_json).unwrap_or_default(),
            snapshot_path: snapshot_path.map(PathBuf::from),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, Classification, Diff, Scalar};
    use std::collections::BTreeMap as StdBTreeMap;

    fn sample_event(sequence: u64, path: &str) -> ChangeEvent {
        let diffs = vec![Diff {
            sheet: "Sheet1".into(),
            address: "A1".into(),
            old_cell: Some(Cell::literal(Scalar::Int(1))),
            new_cell: Some(Cell::literal(Scalar::Int(2))),
            classification: Classification::Dvc,
        }];
        let counters = ChangeEvent::count_counters(&diffs);
        ChangeEvent {
            sequence,
            base_key: "report.xlsx__abc".into(),
            file_path: PathBuf::from(path),
            event_time: Utc::now(),
            diffs,
            counters,
            snapshot_path: None,
            author: Some("alice".into()),
        }
    }

    fn empty_grid() -> CellGrid {
        StdBTreeMap::new()
    }

    #[test]
    fn record_writes_snapshot_and_index_row() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TimelineSink::open(dir.path(), Profile::Balanced, Duration::from_secs(5)).unwrap();
        let event = sample_event(1, "/data/report.xlsx");

        assert!(sink.record(&event, &empty_grid()).unwrap());

        let rows = sink.query(&EventQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].base_key, "report.xlsx__abc");
        assert_eq!(rows[0].counters.get("DVC"), Some(&1));
        assert!(rows[0].snapshot_path.as_ref().unwrap().is_file());
        assert!(dir.path().join("changelog.csv").is_file());
        assert!(dir.path().join(format!("changelog.csv.{}", Profile::Balanced.extension())).is_file());
    }

    #[test]
    fn duplicate_event_within_window_is_not_recorded_twice() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TimelineSink::open(dir.path(), Profile::Balanced, Duration::from_secs(30)).unwrap();
        let mut event = sample_event(1, "/data/report.xlsx");
        event.event_time = "2024-01-01T00:00:00Z".parse().unwrap();

        assert!(sink.record(&event, &empty_grid()).unwrap());
        assert!(!sink.record(&event, &empty_grid()).unwrap());

        assert_eq!(sink.query(&EventQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn query_filters_by_author_and_min_counter() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TimelineSink::open(dir.path(), Profile::Balanced, Duration::from_secs(0)).unwrap();

        let mut event_a = sample_event(1, "/data/a.xlsx");
        event_a.event_time = "2024-01-01T00:00:00Z".parse().unwrap();
        event_a.author = Some("alice".into());
        sink.record(&event_a, &empty_grid()).unwrap();

        let mut event_b = sample_event(2, "/data/b.xlsx");
        event_b.event_time = "2024-01-02T00:00:00Z".parse().unwrap();
        event_b.author = Some("bob".into());
        event_b.base_key = "b.xlsx__def".into();
        sink.record(&event_b, &empty_grid()).unwrap();

        let alice_only = sink.query(&EventQuery { author: Some("alice".into()), ..Default::default() }).unwrap();
        assert_eq!(alice_only.len(), 1);
        assert_eq!(alice_only[0].author, Some("alice".into()));

        let high_dvc = sink.query(&EventQuery { min_counter: Some(("DVC", 5)), ..Default::default() }).unwrap();
        assert!(high_dvc.is_empty());
    }

    #[test]
    fn empty_event_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TimelineSink::open(dir.path(), Profile::Balanced, Duration::from_secs(5)).unwrap();
        let mut event = sample_event(1, "/data/report.xlsx");
        event.diffs.clear();
        assert!(!sink.record(&event, &empty_grid()).unwrap());
        assert!(sink.query(&EventQuery::default()).unwrap().is_empty());
    }
}

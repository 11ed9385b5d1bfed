//! Core data model: `Cell`, `CellGrid`, `Baseline`, `FileIdentity`, `ChangeEvent`/`Diff`.
//!
//! A closed sum type replaces the duck-typed cell dictionaries a naive
//! port would carry over; equality throughout this module is structural.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// A cell's literal or cached-evaluated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Excel date/time serials are stored normalized to an epoch (seconds
    /// since 1970-01-01 UTC); see `ooxml::xlsx::numfmt` for serial decoding.
    Date(i64),
}

impl Scalar {
    pub fn display(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s.clone(),
            Scalar::Date(epoch) => DateTime::<Utc>::from_timestamp(*epoch, 0)
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| epoch.to_string()),
        }
    }
}

/// The atomic unit of a workbook: a single cell's formula and/or value.
///
/// Two cells are equal iff all four attributes are equal (see data model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Normalized formula text, with external references prettified.
    pub formula: Option<String>,
    /// Last value the spreadsheet engine computed and persisted.
    pub cached_value: Option<Scalar>,
    /// Literal value, present only when the cell has no formula.
    pub value: Option<Scalar>,
    /// True iff `formula` references another workbook.
    pub external_ref: bool,
}

impl Cell {
    pub fn literal(value: Scalar) -> Self {
        Cell { formula: None, cached_value: None, value: Some(value), external_ref: false }
    }

    pub fn formula(formula: String, cached_value: Option<Scalar>, external_ref: bool) -> Self {
        Cell { formula: Some(formula), cached_value, value: None, external_ref }
    }

    /// The value a user would see displayed: `cached_value` if present, else `value`.
    pub fn display_value(&self) -> Option<&Scalar> {
        self.cached_value.as_ref().or(self.value.as_ref())
    }
}

/// `sheet_name -> address -> Cell`. Sheet order is not significant for equality.
pub type SheetCells = BTreeMap<String, Cell>;
pub type CellGrid = BTreeMap<String, SheetCells>;

fn feed_scalar(hasher: &mut Sha256, scalar: Option<&Scalar>) {
    match scalar {
        None => hasher.update(b"\0N"),
        Some(Scalar::Null) => hasher.update(b"\0Z"),
        Some(Scalar::Bool(b)) => hasher.update([b'\0', b'B', *b as u8]),
        Some(Scalar::Int(i)) => {
            hasher.update(b"\0I");
            hasher.update(i.to_le_bytes());
        }
        Some(Scalar::Float(f)) => {
            hasher.update(b"\0F");
            hasher.update(f.to_le_bytes());
        }
        Some(Scalar::Str(s)) => {
            hasher.update(b"\0S");
            hasher.update(s.as_bytes());
        }
        Some(Scalar::Date(d)) => {
            hasher.update(b"\0D");
            hasher.update(d.to_le_bytes());
        }
    }
}

/// Computes a stable fingerprint of a `CellGrid`, invariant under key ordering
/// (guaranteed here by `BTreeMap`'s sorted iteration). Field order and
/// delimiters are fixed by hand rather than relying on a serialization
/// crate's byte layout, which is not guaranteed stable across versions.
pub fn hash_grid(grid: &CellGrid) -> String {
    let mut hasher = Sha256::new();
    for (sheet, cells) in grid {
        hasher.update(sheet.as_bytes());
        for (addr, cell) in cells {
            hasher.update(b"\x01");
            hasher.update(addr.as_bytes());
            hasher.update(cell.formula.as_deref().unwrap_or("").as_bytes());
            feed_scalar(&mut hasher, cell.cached_value.as_ref());
            feed_scalar(&mut hasher, cell.value.as_ref());
            hasher.update([cell.external_ref as u8]);
        }
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Per-file baseline: the last-known cell state plus the source metadata
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub content_hash: String,
    pub cells: CellGrid,
    pub source_mtime: i64,
    pub source_size: u64,
    pub last_author: Option<String>,
    pub baseline_time: DateTime<Utc>,
    pub file_mtime_string: String,
}

impl Baseline {
    pub fn new(
        cells: CellGrid,
        source_mtime: i64,
        source_size: u64,
        last_author: Option<String>,
        file_mtime_string: String,
    ) -> Self {
        let content_hash = hash_grid(&cells);
        Baseline {
            content_hash,
            cells,
            source_mtime,
            source_size,
            last_author,
            baseline_time: Utc::now(),
            file_mtime_string,
        }
    }

    /// Invariant B1: the stored hash matches a fresh hash of `cells`.
    pub fn is_consistent(&self) -> bool {
        self.content_hash == hash_grid(&self.cells)
    }
}

/// Identifies a logical watched file by its absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub path: std::path::PathBuf,
    pub base_key: String,
}

impl FileIdentity {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let base_key = baseline_key(path);
        FileIdentity { path: path.to_path_buf(), base_key }
    }
}

/// `sanitize(basename) + "__" + short_hash(normalized_absolute_path)`.
///
/// Keeps baseline filenames human-readable while guaranteeing two files
/// with the same basename in different directories never collide.
pub fn baseline_key(path: &Path) -> String {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sanitized = sanitize_filename(&basename);

    let normalized = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let short_hash = &hex_encode(&hasher.finalize())[..12];

    format!("{sanitized}__{short_hash}")
}

/// Replaces filesystem-unsafe characters with `_`, trimming to a length that
/// stays well under common OS filename limits once the hash suffix is added.
pub fn sanitize_filename(name: &str) -> String {
    const MAX_LEN: usize = 180;
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.len() > MAX_LEN {
        cleaned[..MAX_LEN].to_string()
    } else {
        cleaned
    }
}

/// Closed classification set for a single cell delta (C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// `old == new`
    None,
    /// old absent, new present
    Add,
    /// old present, new absent
    Del,
    /// Direct value change: neither side has a formula, values differ
    Dvc,
    /// Internal formula change: formulas differ, neither side external
    Fci,
    /// External reference link change: formulas differ, either side external
    Xrlc,
    /// External refresh update: formulas equal (both external), values differ
    Xru,
    /// Indirect (internal) recompute: formulas equal (both internal), values differ
    Ind,
}

impl Classification {
    pub fn tag(&self) -> &'static str {
        match self {
            Classification::None => "NONE",
            Classification::Add => "ADD",
            Classification::Del => "DEL",
            Classification::Dvc => "DVC",
            Classification::Fci => "FCI",
            Classification::Xrlc => "XRLC",
            Classification::Xru => "XRU",
            Classification::Ind => "IND",
        }
    }
}

/// One cell-address delta between two grids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diff {
    pub sheet: String,
    pub address: String,
    pub old_cell: Option<Cell>,
    pub new_cell: Option<Cell>,
    pub classification: Classification,
}

/// A single observed-and-classified change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub base_key: String,
    pub file_path: std::path::PathBuf,
    pub event_time: DateTime<Utc>,
    pub diffs: Vec<Diff>,
    pub counters: BTreeMap<&'static str, u32>,
    pub snapshot_path: Option<std::path::PathBuf>,
    pub author: Option<String>,
}

impl ChangeEvent {
    pub fn is_meaningful(&self) -> bool {
        !self.diffs.is_empty()
    }

    pub fn count_counters(diffs: &[Diff]) -> BTreeMap<&'static str, u32> {
        let mut counters = BTreeMap::new();
        for diff in diffs {
            *counters.entry(diff.classification.tag()).or_insert(0) += 1;
        }
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_display_value_prefers_cached() {
        let cell = Cell::formula("=A1+1".into(), Some(Scalar::Int(2)), false);
        assert_eq!(cell.display_value(), Some(&Scalar::Int(2)));

        let literal = Cell::literal(Scalar::Str("hi".into()));
        assert_eq!(literal.display_value(), Some(&Scalar::Str("hi".into())));
    }

    #[test]
    fn hash_is_stable_under_insertion_order() {
        let mut a: CellGrid = BTreeMap::new();
        let mut sheet_a = SheetCells::new();
        sheet_a.insert("A1".into(), Cell::literal(Scalar::Int(1)));
        sheet_a.insert("B1".into(), Cell::literal(Scalar::Int(2)));
        a.insert("Sheet1".into(), sheet_a);

        let mut b: CellGrid = BTreeMap::new();
        let mut sheet_b = SheetCells::new();
        sheet_b.insert("B1".into(), Cell::literal(Scalar::Int(2)));
        sheet_b.insert("A1".into(), Cell::literal(Scalar::Int(1)));
        b.insert("Sheet1".into(), sheet_b);

        assert_eq!(hash_grid(&a), hash_grid(&b));
    }

    #[test]
    fn baseline_key_differs_by_directory() {
        let k1 = baseline_key(Path::new("/tmp/a/report.xlsx"));
        let k2 = baseline_key(Path::new("/tmp/b/report.xlsx"));
        assert_ne!(k1, k2);
        assert!(k1.starts_with("report.xlsx__"));
    }

    #[test]
    fn sanitize_filename_strips_unsafe_chars() {
        assert_eq!(sanitize_filename("a/b:c*d.xlsx"), "a_b_c_d.xlsx");
    }
}

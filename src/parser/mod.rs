//! Isolated, timeout-bounded workbook parsing (C2).
//!
//! Runs [`ooxml::xlsx::Workbook`](crate::ooxml::xlsx::Workbook) inside a
//! dedicated worker thread behind a panic barrier, so a malformed
//! workbook can crash only that parse attempt rather than the watcher
//! process. The worker thread is detached rather than joined on timeout:
//! Rust has no safe way to kill a running thread, so a pathological file
//! keeps its thread alive in the background until it finishes on its own.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{ErrorKind, Result};
use crate::model::{CellGrid, Scalar};
use crate::ooxml::error::OoxmlError;
use crate::ooxml::opc::error::OpcError;
use crate::ooxml::xlsx::Workbook;

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub timeout: Duration,
    pub enable_formula_value_check: bool,
    pub max_formula_value_cells: u64,
    pub always_fetch_value_for_external_refs: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            timeout: Duration::from_secs(120),
            enable_formula_value_check: true,
            max_formula_value_cells: 50_000,
            always_fetch_value_for_external_refs: true,
        }
    }
}

/// What the compare queue gets back from a successful parse.
#[derive(Debug, Clone)]
pub struct ParsedWorkbook {
    pub cells: CellGrid,
    pub last_author: Option<String>,
    pub sheet_order: Vec<String>,
}

enum WorkerOutcome {
    Parsed(ParsedWorkbook),
    Failed(OoxmlError),
    Panicked(String),
}

/// Parses `path`'s bytes inside an isolated worker thread, then applies
/// the formula-value-check cap (pass 2 of the two-pass value acquisition)
/// before returning.
pub fn parse_isolated(path: &Path, options: &ParserOptions) -> Result<ParsedWorkbook> {
    let bytes = std::fs::read(path).map_err(|e| ErrorKind::Io { path: path.to_path_buf(), source: e })?;
    let path_owned = path.to_path_buf();

    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("sheetwatch-parser".to_string())
        .spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| open_and_read(&bytes))) {
                Ok(Ok(parsed)) => WorkerOutcome::Parsed(parsed),
                Ok(Err(e)) => WorkerOutcome::Failed(e),
                Err(payload) => WorkerOutcome::Panicked(panic_message(payload)),
            };
            let _ = tx.send(outcome);
        })
        .expect("failed to spawn parser worker thread");

    let mut parsed = match rx.recv_timeout(options.timeout) {
        Ok(WorkerOutcome::Parsed(parsed)) => parsed,
        Ok(WorkerOutcome::Failed(err)) => return Err(classify_ooxml_error(err, &path_owned)),
        Ok(WorkerOutcome::Panicked(message)) => {
            return Err(ErrorKind::ParserCrashed { path: path_owned, message })
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            return Err(ErrorKind::ParserTimeout { path: path_owned, seconds: options.timeout.as_secs() })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(ErrorKind::ParserCrashed {
                path: path_owned,
                message: "worker thread terminated without a result".to_string(),
            })
        }
    };

    let pre_cap = parsed.clone();
    apply_value_cap(&mut parsed.cells, options);

    if options.always_fetch_value_for_external_refs {
        let targets = external_ref_targets(&parsed.cells);
        if !targets.is_empty() {
            let restored = backfill_external_values(&pre_cap, &targets);
            apply_backfill(&mut parsed.cells, &restored);
        }
    }

    Ok(parsed)
}

/// Sheet/address pairs of external-reference formula cells whose cached
/// value didn't survive the value cap.
fn external_ref_targets(grid: &CellGrid) -> HashMap<String, Vec<String>> {
    let mut targets: HashMap<String, Vec<String>> = HashMap::new();
    for (sheet, sheet_cells) in grid {
        for (address, cell) in sheet_cells {
            if cell.external_ref && cell.cached_value.is_none() {
                targets.entry(sheet.clone()).or_default().push(address.clone());
            }
        }
    }
    targets
}

fn apply_backfill(grid: &mut CellGrid, restored: &HashMap<(String, String), Option<crate::model::Scalar>>) {
    for ((sheet, address), value) in restored {
        if let Some(cell) = grid.get_mut(sheet).and_then(|sheet_cells| sheet_cells.get_mut(address)) {
            cell.cached_value = value.clone();
        }
    }
}

fn open_and_read(bytes: &[u8]) -> std::result::Result<ParsedWorkbook, OoxmlError> {
    let workbook = Workbook::open_bytes(bytes)?;
    let cells = workbook.read_all_cells()?;
    let last_author = workbook.last_author();
    let sheet_order = workbook.sheet_names().into_iter().map(str::to_string).collect();
    Ok(ParsedWorkbook { cells, last_author, sheet_order })
}

fn classify_ooxml_error(err: OoxmlError, path: &Path) -> ErrorKind {
    if matches!(&err, OoxmlError::Opc(OpcError::ZipError(_))) {
        ErrorKind::NotAWorkbook { path: path.to_path_buf() }
    } else {
        ErrorKind::CorruptPackage { path: path.to_path_buf(), source: Box::new(err) }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "parser worker panicked with a non-string payload".to_string()
    }
}

/// Gates the whole workbook's formula value pass: if the number of formula
/// cells exceeds `max_formula_value_cells` (or the check is disabled
/// outright), the pass is skipped entirely and every formula cell's
/// `cached_value` is cleared. There's no partial credit — a workbook one
/// cell over the cap gets the same treatment as one ten times over.
fn apply_value_cap(grid: &mut CellGrid, options: &ParserOptions) {
    let total_formula_cells = count_formula_cells(grid);
    let skip_pass = !options.enable_formula_value_check || total_formula_cells > options.max_formula_value_cells;
    if !skip_pass {
        return;
    }
    for sheet_cells in grid.values_mut() {
        for cell in sheet_cells.values_mut() {
            if cell.formula.is_some() {
                cell.cached_value = None;
            }
        }
    }
}

fn count_formula_cells(grid: &CellGrid) -> u64 {
    grid.values().flat_map(|sheet_cells| sheet_cells.values()).filter(|cell| cell.formula.is_some()).count() as u64
}

/// Targeted re-fetch of cached values for specific external-reference
/// cells, keyed by sheet name with the addresses needed on that sheet.
/// Avoids a full workbook rescan just to resolve link values.
pub fn backfill_external_values(
    parsed: &ParsedWorkbook,
    targets: &HashMap<String, Vec<String>>,
) -> HashMap<(String, String), Option<Scalar>> {
    let mut out = HashMap::new();
    for (sheet, addresses) in targets {
        let Some(sheet_cells) = parsed.cells.get(sheet) else { continue };
        for address in addresses {
            let value = sheet_cells.get(address).and_then(|c| c.display_value()).cloned();
            out.insert((sheet.clone(), address.clone()), value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, Scalar, SheetCells};
    use std::collections::BTreeMap;
    use std::io::Write;

    #[test]
    fn invalid_zip_reports_not_a_workbook() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a zip file at all").unwrap();
        let result = parse_isolated(file.path(), &ParserOptions::default());
        assert!(matches!(result, Err(ErrorKind::NotAWorkbook { .. })));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let result = parse_isolated(Path::new("/nonexistent/path/workbook.xlsx"), &ParserOptions::default());
        assert!(matches!(result, Err(ErrorKind::Io { .. })));
    }

    #[test]
    fn value_cap_clears_every_formula_cell_when_total_exceeds_limit() {
        let mut sheet = SheetCells::new();
        sheet.insert("A1".into(), Cell::formula("=1".into(), Some(Scalar::Int(1)), false));
        sheet.insert("A2".into(), Cell::formula("=2".into(), Some(Scalar::Int(2)), false));
        sheet.insert("A3".into(), Cell::literal(Scalar::Int(3)));
        let mut grid: CellGrid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);

        let options = ParserOptions { enable_formula_value_check: true, max_formula_value_cells: 1, ..ParserOptions::default() };
        apply_value_cap(&mut grid, &options);

        let sheet = &grid["Sheet1"];
        assert_eq!(sheet["A1"].cached_value, None);
        assert_eq!(sheet["A2"].cached_value, None);
        assert_eq!(sheet["A3"].value, Some(Scalar::Int(3)));
    }

    #[test]
    fn value_cap_keeps_every_formula_cell_when_total_is_within_limit() {
        let mut sheet = SheetCells::new();
        sheet.insert("A1".into(), Cell::formula("=1".into(), Some(Scalar::Int(1)), false));
        sheet.insert("A2".into(), Cell::formula("=2".into(), Some(Scalar::Int(2)), false));
        let mut grid: CellGrid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);

        let options = ParserOptions { enable_formula_value_check: true, max_formula_value_cells: 2, ..ParserOptions::default() };
        apply_value_cap(&mut grid, &options);

        let sheet = &grid["Sheet1"];
        assert_eq!(sheet["A1"].cached_value, Some(Scalar::Int(1)));
        assert_eq!(sheet["A2"].cached_value, Some(Scalar::Int(2)));
    }

    #[test]
    fn disabling_value_check_clears_every_formula_cell() {
        let mut sheet = SheetCells::new();
        sheet.insert("A1".into(), Cell::formula("=1".into(), Some(Scalar::Int(1)), false));
        let mut grid: CellGrid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);

        let options = ParserOptions { enable_formula_value_check: false, ..ParserOptions::default() };
        apply_value_cap(&mut grid, &options);
        assert_eq!(grid["Sheet1"]["A1"].cached_value, None);
    }

    #[test]
    fn external_ref_targets_only_include_cleared_external_cells() {
        let mut sheet = SheetCells::new();
        sheet.insert("A1".into(), Cell::formula("=1".into(), None, false));
        sheet.insert("B2".into(), Cell::formula("='[1]Other'!A1".into(), None, true));
        let mut grid: CellGrid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);

        let targets = external_ref_targets(&grid);
        assert_eq!(targets.get("Sheet1"), Some(&vec!["B2".to_string()]));
    }

    #[test]
    fn backfill_looks_up_by_sheet_and_address() {
        let mut sheet = SheetCells::new();
        sheet.insert("B2".into(), Cell::formula("='[1]Other'!A1".into(), Some(Scalar::Int(42)), true));
        let mut grid: CellGrid = BTreeMap::new();
        grid.insert("Sheet1".into(), sheet);
        let parsed = ParsedWorkbook { cells: grid, last_author: None, sheet_order: vec!["Sheet1".into()] };

        let mut targets = HashMap::new();
        targets.insert("Sheet1".to_string(), vec!["B2".to_string()]);
        let values = backfill_external_values(&parsed, &targets);
        assert_eq!(values[&("Sheet1".to_string(), "B2".to_string())], Some(Scalar::Int(42)));
    }
}

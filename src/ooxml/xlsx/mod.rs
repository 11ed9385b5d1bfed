//! Excel (.xlsx/.xlsm) spreadsheet reading.
//!
//! Scoped to what a change-diffing watcher needs: open a workbook package,
//! walk its sheets, and produce a `CellGrid` with normalized formulas and
//! resolved external references. There is no writer path here; the watcher
//! never saves a workbook.
//!
//! # Architecture
//!
//! - `workbook`: top-level reader, owns the OPC package and per-sheet lookup
//! - `parsers`: scan-based extraction from `workbook.xml` / `sheetN.xml`
//! - `shared_strings`, `styles`, `numfmt`: supporting tables the cell parser
//!   consults (string table, date-format detection)
//! - `formula`: external-reference detection and prettification
//! - `external_links`: resolves `externalReferences` table entries to paths
//! - `cell`: A1-reference helpers shared across the above

pub mod cell;
pub mod external_links;
pub mod formula;
pub mod numfmt;
pub mod parsers;
pub mod shared_strings;
pub mod styles;
pub mod workbook;

pub use shared_strings::SharedStrings;
pub use styles::StyleTable;
pub use workbook::Workbook;

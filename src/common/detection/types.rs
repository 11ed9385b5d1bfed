//! File format type enumeration.

/// Spreadsheet container formats recognized by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Microsoft Excel Spreadsheet (OOXML format, .xlsx)
    Xlsx,
    /// Microsoft Excel Macro-Enabled Spreadsheet (OOXML format, .xlsm)
    Xlsm,
}

//! Spreadsheet container format detection.
//!
//! Reads only the minimal amount of data required to tell apart an OOXML
//! spreadsheet package from anything else dropped into a watched root.

pub mod ooxml;
pub mod types;
pub mod utils;

pub use ooxml::detect_zip_format;
pub use types::FileFormat;

//! Common types, traits, and utilities shared across the OOXML layer.

pub mod bom;
pub mod detection;
pub mod error;
pub mod metadata;
/// XML utilities
pub mod xml;

// Re-exports for convenience
pub use bom::{
    BomKind, UTF8_BOM, UTF16_BE_BOM, UTF16_LE_BOM, UTF32_BE_BOM, UTF32_LE_BOM, strip_bom, write_bom,
};
pub use detection::{FileFormat, detect_zip_format};
pub use error::{Error, Result};
pub use metadata::Metadata;

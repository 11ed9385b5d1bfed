//! Office Open XML (OOXML) package and spreadsheet parsing layer.
//!
//! Scoped to the one format this crate actually watches: `.xlsx`/`.xlsm`
//! workbooks. Built on the Open Packaging Conventions (OPC) layer (`opc`):
//! ZIP container, parts, relationships, content types.
//!
//! # Architecture
//!
//! 1. **OPC Layer** (`opc`): package handling (ZIP, parts, relationships).
//! 2. **`metadata`**: `docProps/core.xml` core-property extraction (last author, etc).
//! 3. **`xlsx`**: workbook/worksheet/shared-strings parsing into a `CellGrid`.

pub mod error;
pub mod metadata;
pub mod opc;
pub mod xlsx;

// Re-export commonly used types from the OPC layer
pub use opc::{OpcPackage, PackURI};

// Re-export error types
pub use error::{OoxmlError, Result};

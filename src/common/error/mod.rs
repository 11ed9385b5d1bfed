//! Generic IO/format error type used by low-level `common` helpers
//! (BOM stripping, metadata serialization) that sit below the crate's
//! own closed `ErrorKind` taxonomy.

pub mod types;

pub use types::{Error, Result};

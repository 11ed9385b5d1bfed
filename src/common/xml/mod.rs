//! XML text-escaping helpers shared across the OOXML parsing layer.

pub mod escape;

pub use escape::{escape_xml, unescape_xml};

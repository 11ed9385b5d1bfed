//! Minimal `xl/styles.xml` reader.
//!
//! Scoped to exactly what the cell parser needs: for a given cell style
//! index (`s="N"` on `<c>`), is the applied number format a date/time
//! format? Fonts, fills, borders and the rest of the style model are out
//! of scope for a change-diffing watcher.

use std::collections::HashMap;

use super::numfmt::is_date_format;

#[derive(Debug, Default)]
pub struct StyleTable {
    /// style index (position in `cellXfs`) -> numFmtId
    cell_xf_fmt_ids: Vec<u32>,
    /// custom numFmtId -> formatCode, from `<numFmts>`
    custom_formats: HashMap<u32, String>,
}

impl StyleTable {
    pub fn parse(content: &str) -> Self {
        let custom_formats = parse_num_fmts(content);
        let cell_xf_fmt_ids = parse_cell_xfs(content);
        StyleTable { cell_xf_fmt_ids, custom_formats }
    }

    /// True iff the style applied at `style_index` (the `s="N"` attribute
    /// on a `<c>` element, defaulting to 0 when absent) is a date format.
    pub fn is_date_style(&self, style_index: u32) -> bool {
        let Some(&fmt_id) = self.cell_xf_fmt_ids.get(style_index as usize) else {
            return false;
        };
        let custom_code = self.custom_formats.get(&fmt_id).map(|s| s.as_str());
        is_date_format(fmt_id, custom_code)
    }
}

fn parse_num_fmts(content: &str) -> HashMap<u32, String> {
    let mut formats = HashMap::new();
    let bytes = content.as_bytes();

    let Some(start) = memchr::memmem::find(bytes, b"<numFmts") else {
        return formats;
    };
    let Some(end_rel) = memchr::memmem::find(&bytes[start..], b"</numFmts>") else {
        return formats;
    };
    let section = &content[start..start + end_rel];

    let mut pos = 0;
    let section_bytes = section.as_bytes();
    while let Some(rel) = memchr::memmem::find(&section_bytes[pos..], b"<numFmt ") {
        let entry_start = pos + rel;
        let Some(close_rel) = memchr::memchr(b'>', &section_bytes[entry_start..]) else {
            break;
        };
        let entry = &section[entry_start..entry_start + close_rel + 1];
        if let (Some(id_str), Some(code)) =
            (find_attr(entry, "numFmtId=\""), find_attr(entry, "formatCode=\""))
            && let Ok(id) = id_str.parse::<u32>()
        {
            formats.insert(id, crate::common::xml::unescape_xml(&code));
        }
        pos = entry_start + close_rel + 1;
    }

    formats
}

fn parse_cell_xfs(content: &str) -> Vec<u32> {
    let mut ids = Vec::new();
    let bytes = content.as_bytes();

    let Some(start) = memchr::memmem::find(bytes, b"<cellXfs") else {
        return ids;
    };
    let Some(end_rel) = memchr::memmem::find(&bytes[start..], b"</cellXfs>") else {
        return ids;
    };
    let section = &content[start..start + end_rel];

    let mut pos = 0;
    let section_bytes = section.as_bytes();
    while let Some(rel) = memchr::memmem::find(&section_bytes[pos..], b"<xf ") {
        let entry_start = pos + rel;
        let Some(close_rel) = memchr::memchr(b'>', &section_bytes[entry_start..]) else {
            break;
        };
        let entry = &section[entry_start..entry_start + close_rel + 1];
        let fmt_id = find_attr(entry, "numFmtId=\"")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        ids.push(fmt_id);
        pos = entry_start + close_rel + 1;
    }

    ids
}

fn find_attr(xml: &str, needle: &str) -> Option<String> {
    let bytes = xml.as_bytes();
    let start = memchr::memmem::find(bytes, needle.as_bytes())? + needle.len();
    let rest = &xml[start..];
    let end = memchr::memchr(b'"', rest.as_bytes())?;
    Some(rest[..end].to_string())
}

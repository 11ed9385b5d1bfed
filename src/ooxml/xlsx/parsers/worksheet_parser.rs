//! Parser for individual worksheet XML files (`xl/worksheets/sheetN.xml`).
//!
//! Produces a `SheetCells` directly: shared strings are resolved, inline
//! strings concatenated, numeric values tagged as dates where the cell's
//! style says so, and formulas normalized (external references prettified)
//! exactly as they will be compared and displayed downstream.
//!
//! Performance optimizations:
//! - Uses memchr for fast character searching
//! - Uses atoi_simd for fast integer parsing
//! - Uses fast_float2 for fast float parsing

use std::collections::HashMap;

use crate::common::xml::unescape_xml;
use crate::model::{Cell, Scalar, SheetCells};
use crate::ooxml::xlsx::cell::column_to_letters;
use crate::ooxml::xlsx::formula::{has_external_reference, prettify_formula};
use crate::ooxml::xlsx::numfmt::serial_to_epoch;
use crate::ooxml::xlsx::shared_strings::{extract_run_text, SharedStrings};
use crate::ooxml::xlsx::styles::StyleTable;

/// Parses one worksheet's `<sheetData>` into a `SheetCells` keyed by A1
/// address. `external_refs` is the table-index -> raw path map built from
/// `workbook.xml`'s `externalReferences` and its `.rels`.
pub fn parse_worksheet_xml(
    content: &str,
    shared_strings: &SharedStrings,
    styles: &StyleTable,
    external_refs: &HashMap<u32, String>,
) -> SheetCells {
    let mut cells = SheetCells::new();
    let bytes = content.as_bytes();

    let Some(start_rel) = memchr::memmem::find(bytes, b"<sheetData") else {
        return cells;
    };
    let Some(end_rel) = memchr::memmem::find(&bytes[start_rel..], b"</sheetData>") else {
        return cells;
    };
    let section = &content[start_rel..start_rel + end_rel];

    parse_rows(section, shared_strings, styles, external_refs, &mut cells);
    cells
}

fn parse_rows(
    section: &str,
    shared_strings: &SharedStrings,
    styles: &StyleTable,
    external_refs: &HashMap<u32, String>,
    cells: &mut SheetCells,
) {
    let bytes = section.as_bytes();
    let mut pos = 0;
    let mut implicit_row = 1u32;

    while let Some(rel) = memchr::memmem::find(&bytes[pos..], b"<row") {
        let row_start = pos + rel;
        let after = bytes.get(row_start + 4).copied();
        if !matches!(after, Some(b' ') | Some(b'>') | Some(b'/')) {
            pos = row_start + 4;
            continue;
        }
        let Some(gt_rel) = memchr::memchr(b'>', &bytes[row_start..]) else {
            break;
        };
        let tag_end = row_start + gt_rel;
        let opening_tag = &section[row_start..=tag_end];
        let row_num = find_attr(opening_tag, "r=\"")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(implicit_row);

        if bytes[tag_end - 1] == b'/' {
            // self-closing <row .../>: no cells in it
            implicit_row = row_num + 1;
            pos = tag_end + 1;
            continue;
        }

        let Some(close_rel) = memchr::memmem::find(&bytes[tag_end..], b"</row>") else {
            break;
        };
        let row_body = &section[tag_end + 1..tag_end + close_rel];
        parse_row_cells(row_body, row_num, shared_strings, styles, external_refs, cells);
        implicit_row = row_num + 1;
        pos = tag_end + close_rel + 6;
    }
}

fn parse_row_cells(
    row_body: &str,
    row_num: u32,
    shared_strings: &SharedStrings,
    styles: &StyleTable,
    external_refs: &HashMap<u32, String>,
    cells: &mut SheetCells,
) {
    let bytes = row_body.as_bytes();
    let mut pos = 0;
    let mut implicit_col = 1u32;

    while let Some(rel) = memchr::memmem::find(&bytes[pos..], b"<c") {
        let c_start = pos + rel;
        let after = bytes.get(c_start + 2).copied();
        if !matches!(after, Some(b' ') | Some(b'>') | Some(b'/')) {
            pos = c_start + 2;
            continue;
        }
        let Some(gt_rel) = memchr::memchr(b'>', &bytes[c_start..]) else {
            break;
        };
        let tag_end = c_start + gt_rel;
        let opening_tag = &row_body[c_start..=tag_end];
        let address = find_attr(opening_tag, "r=\"")
            .unwrap_or_else(|| format!("{}{}", column_to_letters(implicit_col), row_num));

        let (inner, advance_to) = if bytes[tag_end - 1] == b'/' {
            ("", tag_end + 1)
        } else {
            match memchr::memmem::find(&bytes[tag_end..], b"</c>") {
                Some(close_rel) => {
                    (&row_body[tag_end + 1..tag_end + close_rel], tag_end + close_rel + 4)
                }
                None => break,
            }
        };

        if let Some(cell) = build_cell(opening_tag, inner, shared_strings, styles, external_refs) {
            cells.insert(address, cell);
        }

        implicit_col += 1;
        pos = advance_to;
    }
}

fn build_cell(
    opening_tag: &str,
    inner: &str,
    shared_strings: &SharedStrings,
    styles: &StyleTable,
    external_refs: &HashMap<u32, String>,
) -> Option<Cell> {
    let cell_type = find_attr(opening_tag, "t=\"");
    let style_index = find_attr(opening_tag, "s=\"")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    let formula_text = extract_tag_text(inner, "<f", "</f>");
    let raw_value = extract_tag_text(inner, "<v", "</v>");

    let value_scalar = resolve_value_scalar(
        cell_type.as_deref(),
        raw_value.as_deref(),
        style_index,
        shared_strings,
        styles,
        inner,
    );

    match formula_text {
        Some(formula) => {
            let external = has_external_reference(&formula);
            let normalized = prettify_formula(&formula, external_refs);
            Some(Cell::formula(normalized, value_scalar, external))
        }
        None => value_scalar.map(Cell::literal),
    }
}

fn resolve_value_scalar(
    cell_type: Option<&str>,
    raw_value: Option<&str>,
    style_index: u32,
    shared_strings: &SharedStrings,
    styles: &StyleTable,
    inner: &str,
) -> Option<Scalar> {
    match cell_type {
        Some("inlineStr") => Some(Scalar::Str(extract_inline_string(inner))),
        Some("s") => {
            let idx: usize = raw_value?.parse().ok()?;
            Some(Scalar::Str(shared_strings.get(idx).unwrap_or("").to_string()))
        }
        Some("str") => Some(Scalar::Str(raw_value?.to_string())),
        Some("b") => Some(Scalar::Bool(raw_value? == "1")),
        Some("e") => Some(Scalar::Str(raw_value?.to_string())),
        _ => {
            let raw = raw_value?;
            if styles.is_date_style(style_index) {
                let serial: f64 = fast_float2::parse(raw).ok()?;
                serial_to_epoch(serial).map(Scalar::Date)
            } else if let Ok(i) = atoi_simd::parse::<i64>(raw.as_bytes()) {
                Some(Scalar::Int(i))
            } else if let Ok(f) = fast_float2::parse::<f64>(raw) {
                Some(Scalar::Float(f))
            } else {
                Some(Scalar::Str(raw.to_string()))
            }
        }
    }
}

fn extract_inline_string(inner: &str) -> String {
    let bytes = inner.as_bytes();
    let Some(start_rel) = memchr::memmem::find(bytes, b"<is") else {
        return String::new();
    };
    let Some(end_rel) = memchr::memmem::find(&bytes[start_rel..], b"</is>") else {
        return String::new();
    };
    extract_run_text(&inner[start_rel..start_rel + end_rel + 5])
}

/// Extracts the text of a single non-self-closing tag (`<f>...</f>`,
/// `<v>...</v>`) from `inner`. Returns `None` for a self-closing tag (e.g.
/// a shared-formula reference `<f t="shared" si="0"/>` with no inline text)
/// or when the tag isn't present at all.
fn extract_tag_text(inner: &str, tag_prefix: &str, close_tag: &str) -> Option<String> {
    let bytes = inner.as_bytes();
    let start_rel = memchr::memmem::find(bytes, tag_prefix.as_bytes())?;
    let after = bytes.get(start_rel + tag_prefix.len()).copied();
    if !matches!(after, Some(b' ') | Some(b'>') | Some(b'/')) {
        return None;
    }
    let gt_rel = memchr::memchr(b'>', &bytes[start_rel..])?;
    let tag_end = start_rel + gt_rel;
    if bytes[tag_end - 1] == b'/' {
        return None;
    }
    let text_start = tag_end + 1;
    let close_rel = memchr::memmem::find(&bytes[text_start..], close_tag.as_bytes())?;
    let text_end = text_start + close_rel;
    Some(unescape_xml(&inner[text_start..text_end]))
}

fn find_attr(xml: &str, needle: &str) -> Option<String> {
    let bytes = xml.as_bytes();
    let start = memchr::memmem::find(bytes, needle.as_bytes())? + needle.len();
    let rest = &xml[start..];
    let end = memchr::memchr(b'"', rest.as_bytes())?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_refs() -> HashMap<u32, String> {
        HashMap::new()
    }

    #[test]
    fn parses_literal_number_and_string() {
        let ss = SharedStrings::parse("<sst><si><t>hello</t></si></sst>");
        let styles =
            StyleTable::parse("<styleSheet><cellXfs><xf numFmtId=\"0\"/></cellXfs></styleSheet>");
        let xml = r#"<worksheet><sheetData>
            <row r="1">
                <c r="A1" t="s"><v>0</v></c>
                <c r="B1"><v>42</v></c>
            </row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &empty_refs());
        assert_eq!(cells.get("A1").unwrap().value, Some(Scalar::Str("hello".to_string())));
        assert_eq!(cells.get("B1").unwrap().value, Some(Scalar::Int(42)));
    }

    #[test]
    fn parses_formula_with_cached_value() {
        let ss = SharedStrings::new();
        let styles = StyleTable::parse("<styleSheet/>");
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1"><f>SUM(B1:B2)</f><v>3</v></c></row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &empty_refs());
        let cell = cells.get("A1").unwrap();
        assert_eq!(cell.formula.as_deref(), Some("SUM(B1:B2)"));
        assert_eq!(cell.cached_value, Some(Scalar::Int(3)));
        assert!(!cell.external_ref);
    }

    #[test]
    fn detects_and_prettifies_external_formula() {
        let ss = SharedStrings::new();
        let styles = StyleTable::parse("<styleSheet/>");
        let mut refs = HashMap::new();
        refs.insert(1u32, r"C:\data\Book.xlsx".to_string());
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1"><f>[1]Sheet1!A1</f><v>5</v></c></row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &refs);
        let cell = cells.get("A1").unwrap();
        assert!(cell.external_ref);
        assert_eq!(cell.formula.as_deref(), Some(r"'C:\data\[Book.xlsx]Sheet1'!A1"));
    }

    #[test]
    fn parses_inline_string() {
        let ss = SharedStrings::new();
        let styles = StyleTable::parse("<styleSheet/>");
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="inlineStr"><is><t>direct text</t></is></c></row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &empty_refs());
        assert_eq!(cells.get("A1").unwrap().value, Some(Scalar::Str("direct text".to_string())));
    }

    #[test]
    fn date_style_decodes_serial_to_date() {
        let ss = SharedStrings::new();
        let styles_xml = r#"<styleSheet><cellXfs><xf numFmtId="14"/></cellXfs></styleSheet>"#;
        let styles = StyleTable::parse(styles_xml);
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" s="0"><v>44927</v></c></row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &empty_refs());
        assert!(matches!(cells.get("A1").unwrap().value, Some(Scalar::Date(_))));
    }

    #[test]
    fn self_closing_empty_cell_yields_no_entry() {
        let ss = SharedStrings::new();
        let styles = StyleTable::parse("<styleSheet/>");
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1"/></row>
        </sheetData></worksheet>"#;
        let cells = parse_worksheet_xml(xml, &ss, &styles, &empty_refs());
        assert!(cells.is_empty());
    }
}

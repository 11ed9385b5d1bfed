//! Parser for Excel `xl/workbook.xml` files.
//!
//! Extracts sheet definitions, the active-tab index, and the
//! `externalReferences` index -> relationship-id table needed to resolve
//! `[n]Sheet!A1`-style formulas back to a workbook path.
//!
//! Performance optimizations:
//! - Uses memchr for fast character searching
//! - Uses atoi_simd for fast integer parsing
//! - Pre-allocates vectors with reasonable capacities

const INITIAL_SHEETS_CAPACITY: usize = 16;

/// One `<sheet>` entry from `workbook.xml`.
#[derive(Debug, Clone)]
pub struct SheetRef {
    pub name: String,
    pub relationship_id: String,
    pub sheet_id: u32,
}

/// One `<externalReference>` entry: its 1-based table index and the
/// relationship id pointing at `xl/externalLinks/externalLinkN.xml`.
#[derive(Debug, Clone)]
pub struct ExternalRefEntry {
    pub index: u32,
    pub relationship_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkbookInfo {
    pub sheets: Vec<SheetRef>,
    pub active_sheet_index: usize,
    pub external_refs: Vec<ExternalRefEntry>,
}

/// Parse `workbook.xml` content into sheet refs, the active tab, and the
/// external-reference table.
pub fn parse_workbook_xml(content: &str) -> WorkbookInfo {
    let mut sheets = Vec::with_capacity(INITIAL_SHEETS_CAPACITY);
    let mut active_sheet_id = 0usize;
    let bytes = content.as_bytes();

    if let Some(sheets_start) = memchr::memmem::find(bytes, b"<sheets>")
        && let Some(sheets_end) = memchr::memmem::find(&bytes[sheets_start..], b"</sheets>")
    {
        let sheets_content = &content[sheets_start..sheets_start + sheets_end];
        parse_sheets_section(sheets_content, &mut sheets);
    }

    if let Some(book_views_start) = memchr::memmem::find(bytes, b"<bookViews>")
        && let Some(book_views_end) =
            memchr::memmem::find(&bytes[book_views_start..], b"</bookViews>")
    {
        let book_views_content = &content[book_views_start..book_views_start + book_views_end];

        if let Some(active_tab_start) =
            memchr::memmem::find(book_views_content.as_bytes(), b"activeTab=\"")
        {
            let active_tab_content = &book_views_content[active_tab_start + 11..];
            if let Some(quote_pos) = memchr::memchr(b'"', active_tab_content.as_bytes())
                && let Ok(tab) = atoi_simd::parse(&active_tab_content.as_bytes()[..quote_pos])
            {
                active_sheet_id = tab;
            }
        }
    }

    let external_refs = parse_external_references(content);
    let active_sheet_index = active_sheet_id.min(sheets.len().saturating_sub(1));

    WorkbookInfo { sheets, active_sheet_index, external_refs }
}

fn parse_sheets_section(sheets_content: &str, sheets: &mut Vec<SheetRef>) {
    let bytes = sheets_content.as_bytes();
    let mut sheet_start = 0;

    while let Some(sheet_pos) = memchr::memmem::find(&bytes[sheet_start..], b"<sheet ") {
        let sheet_start_pos = sheet_start + sheet_pos;
        if let Some(sheet_end_pos) = memchr::memmem::find(&bytes[sheet_start_pos..], b"/>") {
            let sheet_xml = &sheets_content[sheet_start_pos..sheet_start_pos + sheet_end_pos + 2];
            if let Some(sheet_ref) = parse_sheet_xml(sheet_xml) {
                sheets.push(sheet_ref);
            }
            sheet_start = sheet_start_pos + sheet_end_pos + 2;
        } else {
            break;
        }
    }
}

fn parse_sheet_xml(sheet_xml: &str) -> Option<SheetRef> {
    let name = find_attr(sheet_xml, "name=\"")?;
    let relationship_id = find_attr(sheet_xml, "r:id=\"")?;
    let sheet_id_str = find_attr(sheet_xml, "sheetId=\"")?;
    let sheet_id = atoi_simd::parse(sheet_id_str.as_bytes()).ok()?;

    Some(SheetRef { name, relationship_id, sheet_id })
}

/// Parse `<externalReferences><externalReference r:id="rIdN"/>...</externalReferences>`.
/// Table index is assigned by document order, starting at 1 (matching how
/// `[n]` placeholders in formulas index this table).
fn parse_external_references(content: &str) -> Vec<ExternalRefEntry> {
    let mut refs = Vec::new();
    let bytes = content.as_bytes();

    let Some(section_start) = memchr::memmem::find(bytes, b"<externalReferences") else {
        return refs;
    };
    let Some(section_end_rel) =
        memchr::memmem::find(&bytes[section_start..], b"</externalReferences>")
    else {
        return refs;
    };
    let section = &content[section_start..section_start + section_end_rel];

    let mut pos = 0;
    let mut index = 1;
    let section_bytes = section.as_bytes();
    while let Some(rel_pos) = memchr::memmem::find(&section_bytes[pos..], b"<externalReference ")
    {
        let start = pos + rel_pos;
        let Some(end_rel) = memchr::memmem::find(&section_bytes[start..], b"/>") else {
            break;
        };
        let entry_xml = &section[start..start + end_rel + 2];
        if let Some(relationship_id) = find_attr(entry_xml, "r:id=\"") {
            refs.push(ExternalRefEntry { index, relationship_id });
        }
        index += 1;
        pos = start + end_rel + 2;
    }

    refs
}

fn find_attr(xml: &str, needle: &str) -> Option<String> {
    let bytes = xml.as_bytes();
    let start = memchr::memmem::find(bytes, needle.as_bytes())? + needle.len();
    let rest = &xml[start..];
    let end = memchr::memchr(b'"', rest.as_bytes())?;
    Some(rest[..end].to_string())
}

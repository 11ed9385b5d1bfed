//! Top-level Excel workbook reader.
//!
//! Opens an OOXML package, loads the shared-strings table and styles,
//! resolves every `externalReferences` entry to a raw path, and exposes
//! each sheet's cells as a `SheetCells` on demand.

use std::collections::HashMap;

use crate::model::{CellGrid, SheetCells};
use crate::ooxml::error::{OoxmlError, Result};
use crate::ooxml::metadata;
use crate::ooxml::opc::constants::content_type as ct;
use crate::ooxml::opc::part::Part;
use crate::ooxml::opc::{OpcPackage, PackURI};

use super::external_links::resolve_external_ref_paths;
use super::parsers::workbook_parser::{self, WorkbookInfo};
use super::parsers::worksheet_parser;
use super::shared_strings::SharedStrings;
use super::styles::StyleTable;

pub struct Workbook {
    package: OpcPackage,
    info: WorkbookInfo,
    shared_strings: SharedStrings,
    styles: StyleTable,
    external_ref_paths: HashMap<u32, String>,
    sheet_partnames: HashMap<String, PackURI>,
}

impl Workbook {
    pub fn open_bytes(bytes: &[u8]) -> Result<Self> {
        Self::open_package(OpcPackage::from_bytes(bytes)?)
    }

    pub fn open_package(package: OpcPackage) -> Result<Self> {
        let workbook_part = package.main_document_part()?;
        let info = workbook_parser::parse_workbook_xml(part_text(workbook_part)?);

        let shared_strings = match find_part_by_content_type(&package, ct::SML_SHARED_STRINGS) {
            Some(part) => SharedStrings::parse(part_text(part)?),
            None => SharedStrings::new(),
        };
        let styles = match find_part_by_content_type(&package, ct::SML_STYLES) {
            Some(part) => StyleTable::parse(part_text(part)?),
            None => StyleTable::default(),
        };
        let external_ref_paths = resolve_external_ref_paths(&package, workbook_part, &info);
        let sheet_partnames = resolve_sheet_partnames(workbook_part, &info);

        Ok(Workbook { package, info, shared_strings, styles, external_ref_paths, sheet_partnames })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.info.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn active_sheet_index(&self) -> usize {
        self.info.active_sheet_index
    }

    /// Core-properties `lastModifiedBy`, best-effort: missing or unparsable
    /// core properties yield `None` rather than failing the whole parse.
    pub fn last_author(&self) -> Option<String> {
        metadata::extract_metadata(&self.package).ok().and_then(|m| m.last_modified_by)
    }

    pub fn read_sheet_cells(&self, sheet_name: &str) -> Result<SheetCells> {
        let partname = self
            .sheet_partnames
            .get(sheet_name)
            .ok_or_else(|| OoxmlError::PartNotFound(sheet_name.to_string()))?;
        let part = self.package.get_part(partname)?;
        Ok(worksheet_parser::parse_worksheet_xml(
            part_text(part)?,
            &self.shared_strings,
            &self.styles,
            &self.external_ref_paths,
        ))
    }

    pub fn read_all_cells(&self) -> Result<CellGrid> {
        let mut grid = CellGrid::new();
        for name in self.sheet_names() {
            grid.insert(name.to_string(), self.read_sheet_cells(name)?);
        }
        Ok(grid)
    }
}

fn resolve_sheet_partnames(
    workbook_part: &dyn Part,
    info: &WorkbookInfo,
) -> HashMap<String, PackURI> {
    let mut map = HashMap::with_capacity(info.sheets.len());
    for sheet in &info.sheets {
        if let Some(rel) = workbook_part.rels().get(&sheet.relationship_id)
            && let Ok(partname) = rel.target_partname()
        {
            map.insert(sheet.name.clone(), partname);
        }
    }
    map
}

fn find_part_by_content_type<'a>(package: &'a OpcPackage, content_type: &str) -> Option<&'a dyn Part> {
    package.iter_parts().find(|p| p.content_type() == content_type)
}

fn part_text(part: &dyn Part) -> Result<&str> {
    std::str::from_utf8(part.blob())
        .map_err(|e| OoxmlError::Xml(format!("invalid UTF-8 in {}: {e}", part.partname().as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ooxml::opc::part::XmlPart;

    fn xml_part(partname: &str, content_type: &str, content: &str) -> XmlPart {
        let uri = PackURI::new(partname).unwrap();
        XmlPart::new(uri, content_type.to_string(), content.as_bytes().to_vec())
    }

    fn build_test_package() -> OpcPackage {
        let mut package = OpcPackage::new();

        let mut workbook = xml_part(
            "/xl/workbook.xml",
            ct::SML_SHEET_MAIN,
            r#"<workbook><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        );
        workbook.rels_mut().add_relationship(
            "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet"
                .to_string(),
            "worksheets/sheet1.xml".to_string(),
            "rId1".to_string(),
            false,
        );
        package.relate_to("xl/workbook.xml", crate::ooxml::opc::constants::relationship_type::OFFICE_DOCUMENT);
        package.add_part(Box::new(workbook));

        let sheet1 = xml_part(
            "/xl/worksheets/sheet1.xml",
            ct::SML_WORKSHEET,
            r#"<worksheet><sheetData><row r="1"><c r="A1"><v>7</v></c></row></sheetData></worksheet>"#,
        );
        package.add_part(Box::new(sheet1));

        package
    }

    #[test]
    fn reads_sheet_names_and_cells() {
        let package = build_test_package();
        let workbook = Workbook::open_package(package).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["Sheet1"]);

        let grid = workbook.read_all_cells().unwrap();
        let sheet1 = grid.get("Sheet1").unwrap();
        assert_eq!(
            sheet1.get("A1").unwrap().value,
            Some(crate::model::Scalar::Int(7))
        );
    }
}

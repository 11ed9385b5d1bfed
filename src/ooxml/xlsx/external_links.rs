//! Resolves the raw workbook path behind each `externalReferences` table
//! entry, so formulas can be prettified with the real file path instead of
//! a bare `[n]` index.
//!
//! `workbook.xml`'s `<externalReference r:id="rIdN"/>` points, via
//! `xl/_rels/workbook.xml.rels`, at an `xl/externalLinks/externalLinkN.xml`
//! part. That part's own `.rels` file carries exactly one relationship back
//! to the external workbook, with `TargetMode="External"`.

use std::collections::HashMap;

use crate::ooxml::opc::package::OpcPackage;
use crate::ooxml::opc::part::Part;

use super::parsers::workbook_parser::WorkbookInfo;

/// Builds a table-index -> raw external workbook path map for every
/// `externalReference` entry in `workbook_info`. Entries whose link part or
/// relationship can't be resolved are simply omitted; callers treat a
/// missing entry the same as an unresolvable reference.
pub fn resolve_external_ref_paths(
    package: &OpcPackage,
    workbook_part: &dyn Part,
    workbook_info: &WorkbookInfo,
) -> HashMap<u32, String> {
    let mut paths = HashMap::with_capacity(workbook_info.external_refs.len());

    for entry in &workbook_info.external_refs {
        let Some(raw_path) =
            resolve_one(package, workbook_part, &entry.relationship_id)
        else {
            continue;
        };
        paths.insert(entry.index, raw_path);
    }

    paths
}

fn resolve_one(package: &OpcPackage, workbook_part: &dyn Part, r_id: &str) -> Option<String> {
    let link_partname = workbook_part.rels().get(r_id)?.target_partname().ok()?;
    let link_part = package.get_part(&link_partname).ok()?;

    link_part
        .rels()
        .iter()
        .find(|rel| rel.is_external())
        .map(|rel| rel.target_ref().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ooxml::opc::packuri::PackURI;
    use crate::ooxml::opc::part::XmlPart;
    use crate::ooxml::xlsx::parsers::workbook_parser::ExternalRefEntry;

    fn xml_part(partname: &str, content: &str) -> XmlPart {
        let uri = PackURI::new(partname).unwrap();
        XmlPart::new(uri, "application/xml".to_string(), content.as_bytes().to_vec())
    }

    #[test]
    fn resolves_external_link_target() {
        let mut package = OpcPackage::new();

        let mut workbook = xml_part("/xl/workbook.xml", "<workbook/>");
        workbook.rels_mut().add_relationship(
            "http://schemas.openxmlformats.org/officeDocument/2006/relationships/externalLink"
                .to_string(),
            "externalLinks/externalLink1.xml".to_string(),
            "rId2".to_string(),
            false,
        );

        let mut link_part = xml_part("/xl/externalLinks/externalLink1.xml", "<externalLink/>");
        link_part.rels_mut().add_relationship(
            "http://schemas.openxmlformats.org/officeDocument/2006/relationships/externalLinkPath"
                .to_string(),
            r"C:\data\Book.xlsx".to_string(),
            "rId1".to_string(),
            true,
        );

        package.add_part(Box::new(link_part));

        let info = WorkbookInfo {
            sheets: Vec::new(),
            active_sheet_index: 0,
            external_refs: vec![ExternalRefEntry { index: 1, relationship_id: "rId2".to_string() }],
        };

        let resolved = resolve_external_ref_paths(&package, &workbook, &info);
        assert_eq!(resolved.get(&1).map(String::as_str), Some(r"C:\data\Book.xlsx"));
    }

    #[test]
    fn missing_relationship_is_omitted() {
        let package = OpcPackage::new();
        let workbook = xml_part("/xl/workbook.xml", "<workbook/>");
        let info = WorkbookInfo {
            sheets: Vec::new(),
            active_sheet_index: 0,
            external_refs: vec![ExternalRefEntry { index: 1, relationship_id: "rId9".to_string() }],
        };

        let resolved = resolve_external_ref_paths(&package, &workbook, &info);
        assert!(resolved.is_empty());
    }
}

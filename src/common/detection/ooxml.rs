//! OOXML spreadsheet detection (modern Excel workbooks).

use std::io::{Read, Seek};

use crate::common::detection::FileFormat;

/// Detect a ZIP-based OOXML spreadsheet package from byte content.
pub fn detect_zip_format(bytes: &[u8]) -> Option<FileFormat> {
    if bytes.len() < 4 || &bytes[0..4] != crate::common::detection::utils::ZIP_SIGNATURE {
        return None;
    }
    let mut cursor = std::io::Cursor::new(bytes);
    detect_zip_format_from_reader(&mut cursor)
}

/// Detect a ZIP-based spreadsheet package from any seekable reader.
///
/// Opens the archive as an OPC package and checks whether it carries a
/// spreadsheetml main-document part; this is cheap compared to fully
/// parsing the workbook and is good enough for a watch-root filter.
pub fn detect_zip_format_from_reader<R: Read + Seek>(reader: &mut R) -> Option<FileFormat> {
    let package = crate::ooxml::OpcPackage::from_reader(reader).ok()?;
    detect_ooxml_format_from_package(&package)
}

/// Determine whether an already-opened package is a spreadsheet, and
/// whether it carries macros (`.xlsm`) based on the presence of a
/// vbaProject part.
pub fn detect_ooxml_format_from_package(package: &crate::ooxml::OpcPackage) -> Option<FileFormat> {
    let is_spreadsheet = package
        .iter_parts()
        .any(|part| part.content_type().contains("spreadsheetml.sheet.main"));
    if !is_spreadsheet {
        return None;
    }
    let has_macros = package.iter_parts().any(|part| {
        part.content_type().contains("vbaProject") || part.partname().as_str().ends_with("vbaProject.bin")
    });
    Some(if has_macros { FileFormat::Xlsm } else { FileFormat::Xlsx })
}


//! Formula normalization: external-reference detection and prettification.
//!
//! A formula like `=[1]Sheet1!A1` references another workbook through the
//! workbook's `externalReferences` table (`1` indexes into it). Two
//! equivalent external references should hash identically whether they
//! arrived as an indexed reference or an already-expanded inline path, so
//! every formula is normalized into the same canonical
//! `'<dir>\[<workbook>]<sheet>'!<ref>` shape before it is stored in a `Cell`.

use std::collections::HashMap;

/// True iff `formula` textually references another workbook, via any of:
/// an indexed reference `[n]Sheet!`, a quoted full path
/// `'...\[Book.xlsx]Sheet'!`, or an unquoted inline path `[Book.xlsx]Sheet!`.
pub fn has_external_reference(formula: &str) -> bool {
    let bytes = formula.as_bytes();
    let mut pos = 0;

    while let Some(open_rel) = memchr::memchr(b'[', &bytes[pos..]) {
        let open = pos + open_rel;
        let Some(close_rel) = memchr::memchr(b']', &bytes[open..]) else {
            break;
        };
        let close = open + close_rel;

        // At least one character must separate `]` from the next `!`
        // (the sheet name), matching every one of the three patterns.
        if let Some(bang_rel) = memchr::memchr(b'!', &bytes[close + 1..])
            && bang_rel > 0
        {
            return true;
        }
        pos = close + 1;
    }

    false
}

/// Prettify every indexed external reference `[n]Sheet!` in `formula` using
/// `external_refs` (table index -> raw external workbook path). Formulas
/// with no indexed reference, including already-prettified ones, pass
/// through unchanged (idempotent).
pub fn prettify_formula(formula: &str, external_refs: &HashMap<u32, String>) -> String {
    let mut out = String::with_capacity(formula.len());
    let bytes = formula.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        match memchr::memchr(b'[', &bytes[pos..]) {
            Some(open_rel) => {
                let open = pos + open_rel;
                out.push_str(&formula[pos..open]);

                let Some(close_rel) = memchr::memchr(b']', &bytes[open..]) else {
                    out.push_str(&formula[open..]);
                    pos = bytes.len();
                    break;
                };
                let close = open + close_rel;
                let digits = &formula[open + 1..close];

                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Some((sheet, after_sheet)) = split_sheet_name(&formula[close + 1..])
                        && let Ok(index) = digits.parse::<u32>()
                        && let Some(raw_path) = external_refs.get(&index)
                    {
                        out.push_str(&prettify_reference(raw_path, sheet));
                        pos = close + 1 + sheet.len();
                        let _ = after_sheet;
                        continue;
                    }
                }

                // Not an indexed reference we recognize; copy verbatim.
                out.push_str(&formula[open..=close]);
                pos = close + 1;
            }
            None => {
                out.push_str(&formula[pos..]);
                break;
            }
        }
    }

    out
}

/// Splits a sheet name off the front of the text following `[n]`, stopping
/// at `!`. Returns `(sheet_name, rest)`.
fn split_sheet_name(rest: &str) -> Option<(&str, &str)> {
    let bang = memchr::memchr(b'!', rest.as_bytes())?;
    Some((&rest[..bang], &rest[bang..]))
}

/// Builds the canonical `'<dir>\[<workbook>]<sheet>'!` prefix for one
/// resolved external reference.
fn prettify_reference(raw_path: &str, sheet: &str) -> String {
    let normalized = normalize_external_path(raw_path);
    let (dir, file) = split_dir_and_file(&normalized);
    let escaped_sheet = escape_single_quotes(sheet);
    format!("'{dir}\\[{file}]{escaped_sheet}'!")
}

/// URL-decodes, strips a `file:` prefix, and normalizes separators while
/// preserving a leading UNC `\\host\share` prefix.
fn normalize_external_path(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let stripped = decoded
        .strip_prefix("file:///")
        .or_else(|| decoded.strip_prefix("file://"))
        .or_else(|| decoded.strip_prefix("file:"))
        .unwrap_or(&decoded);

    let slashed = stripped.replace('/', "\\");
    collapse_duplicate_separators(&slashed)
}

/// Collapses runs of `\` down to one, except for a leading UNC prefix
/// (`\\host\share`) whose doubled leading separator must survive.
fn collapse_duplicate_separators(path: &str) -> String {
    let is_unc = path.starts_with(r"\\");
    let mut out = String::with_capacity(path.len());
    let mut prev_was_sep = false;

    for (i, ch) in path.chars().enumerate() {
        if ch == '\\' {
            let keep_doubled = is_unc && i == 1;
            if !prev_was_sep || keep_doubled {
                out.push(ch);
            }
            prev_was_sep = true;
        } else {
            out.push(ch);
            prev_was_sep = false;
        }
    }
    out
}

/// Splits a normalized path into `(directory, filename)`; the directory
/// keeps no trailing separator.
fn split_dir_and_file(path: &str) -> (&str, &str) {
    match path.rfind('\\') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Doubles single quotes inside a sheet name (OOXML/Excel quoting rule) and
/// strips any stray leading/trailing quote so `''!` never appears.
fn escape_single_quotes(sheet: &str) -> String {
    let trimmed = sheet.trim_matches('\'');
    trimmed.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_indexed_reference() {
        assert!(has_external_reference("=[1]Sheet1!A1"));
    }

    #[test]
    fn detects_quoted_full_path() {
        assert!(has_external_reference(r"='C:\data\[Book.xlsx]Sheet1'!A1"));
    }

    #[test]
    fn detects_unquoted_inline_path() {
        assert!(has_external_reference("=[Book.xlsx]Sheet1!A1"));
    }

    #[test]
    fn internal_formula_has_no_external_reference() {
        assert!(!has_external_reference("=SUM(A1:A10)"));
        assert!(!has_external_reference("=Sheet2!A1"));
    }

    #[test]
    fn prettifies_indexed_reference() {
        let mut refs = HashMap::new();
        refs.insert(1u32, r"C:\data\Book.xlsx".to_string());
        let out = prettify_formula("=[1]Sheet1!A1+1", &refs);
        assert_eq!(out, r"='C:\data\[Book.xlsx]Sheet1'!A1+1");
    }

    #[test]
    fn prettify_is_idempotent_on_already_pretty_formula() {
        let refs = HashMap::new();
        let pretty = r"='C:\data\[Book.xlsx]Sheet1'!A1";
        assert_eq!(prettify_formula(pretty, &refs), pretty);
    }

    #[test]
    fn collapses_duplicate_separators_but_keeps_unc_prefix() {
        assert_eq!(
            normalize_external_path(r"\\host\share\\sub\\\file.xlsx"),
            r"\\host\share\sub\file.xlsx"
        );
    }

    #[test]
    fn escapes_single_quotes_in_sheet_name() {
        assert_eq!(escape_single_quotes("It's Mine"), "It''s Mine");
    }
}

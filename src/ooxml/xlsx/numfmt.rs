//! Number-format date detection and Excel serial-date decoding.
//!
//! A cell stores dates as plain floating-point serials; whether a given
//! numeric value *means* a date depends entirely on the number format
//! applied to the cell's style, so this module inspects `numFmtId`/
//! `formatCode` rather than the raw value.

use chrono::{Duration, NaiveDate};

/// Built-in numFmtId values the OOXML spec reserves for date/time display
/// (ECMA-376 18.8.30, ids 14-22 and 45-47; 43/44 are currency, excluded).
fn is_builtin_date_id(id: u32) -> bool {
    matches!(id, 14..=22 | 45..=47)
}

/// Heuristic for custom format codes (numFmtId >= 164, or inline formats):
/// a format is date-like if it contains date/time tokens and no numeric
/// placeholder that would mark it as a plain number or percentage.
pub fn is_date_format_code(code: &str) -> bool {
    let lower = code.to_ascii_lowercase();
    if lower.contains('@') || lower.contains('%') {
        return false;
    }
    let has_date_token = lower.contains('y') || lower.contains('d') || lower.contains('m');
    let has_time_token = lower.contains('h') || lower.contains('s');
    has_date_token || has_time_token
}

/// True if the numFmtId/code combination denotes a date or time display.
pub fn is_date_format(id: u32, custom_code: Option<&str>) -> bool {
    if is_builtin_date_id(id) {
        return true;
    }
    match custom_code {
        Some(code) => is_date_format_code(code),
        None => false,
    }
}

/// Decode an Excel date serial (days since 1899-12-30, accounting for the
/// spreadsheet-industry-standard 1900 leap-year bug) into a Unix epoch
/// (seconds since 1970-01-01 UTC).
pub fn serial_to_epoch(serial: f64) -> Option<i64> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let days = serial.trunc() as i64;
    let frac_seconds = (serial.fract() * 86400.0).round() as i64;
    let date = base.checked_add_signed(Duration::days(days))?;
    let datetime = date.and_hms_opt(0, 0, 0)?;
    Some(datetime.and_utc().timestamp() + frac_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ids_detected() {
        assert!(is_date_format(14, None));
        assert!(is_date_format(22, None));
        assert!(!is_date_format(1, None));
        assert!(!is_date_format(9, None)); // percentage
    }

    #[test]
    fn custom_code_heuristic() {
        assert!(is_date_format(200, Some("yyyy-mm-dd")));
        assert!(is_date_format(201, Some("h:mm:ss AM/PM")));
        assert!(!is_date_format(202, Some("0.00%")));
        assert!(!is_date_format(203, Some("General")));
    }

    #[test]
    fn serial_decodes_known_date() {
        // 44927 = 2023-01-01 in the 1900 date system.
        let epoch = serial_to_epoch(44927.0).unwrap();
        let dt = chrono::DateTime::from_timestamp(epoch, 0).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2023-01-01");
    }
}

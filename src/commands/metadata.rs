//! File metadata commands: SIZE, MDTM, MFMT

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Build SIZE command
pub fn size(file: &str) -> String {
    format!("SIZE {}", file)
}

/// Build MDTM command (RFC 3659 §3)
pub fn mdtm(file: &str) -> String {
    format!("MDTM {}", file)
}

/// Build MFMT command: set a remote file's modification time (UTC)
pub fn mfmt(time: DateTime<Utc>, file: &str) -> String {
    format!("MFMT {} {}", time.format("%Y%m%d%H%M%S"), file)
}

/// Parse a `213 <bytes>` SIZE reply
///
/// Strict: every character after `213 ` must be a digit, otherwise the
/// reply is not trusted (some servers answer SIZE with free-form text).
pub fn parse_size_reply(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Parse a `213 YYYYMMDDHHMM[SS[.sss]]` MDTM reply as UTC
///
/// Seconds are optional; a fractional part is ignored.
pub fn parse_mdtm_reply(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let digits: &str = match text.find('.') {
        Some(pos) => &text[..pos],
        None => text,
    };
    let naive = match digits.len() {
        12 => NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M").ok()?,
        14 => NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?,
        _ => return None,
    };
    Some(Utc.from_utc_datetime(&naive))
}

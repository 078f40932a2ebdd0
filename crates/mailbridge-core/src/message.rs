//! Raw RFC 5322 message helpers used by ingestion and re-delivery

use chrono::{DateTime, FixedOffset, Utc};

/// Undo POP3 dot-stuffing and normalize every line ending to CRLF
pub fn normalize_pop3(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut lines = raw.split(|b| *b == b'\n').peekable();

    while let Some(line) = lines.next() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = if line.starts_with(b"..") { &line[1..] } else { line };
        out.extend_from_slice(line);
        if lines.peek().is_some() {
            out.extend_from_slice(b"\r\n");
        }
    }

    out
}

/// Everything before the first blank line (the whole input if there is none)
pub fn header_block(raw: &[u8]) -> &[u8] {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|end| &raw[..end])
        .or_else(|| {
            raw.windows(2)
                .position(|w| w == b"\n\n")
                .map(|end| &raw[..end])
        })
        .unwrap_or(raw)
}

/// Unfolded, undecoded value of the first header called `name`
pub fn header_value(raw: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut value: Option<Vec<u8>> = None;

    for line in header_block(raw).split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if let Some(current) = value.as_mut() {
            if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
                current.extend_from_slice(line);
                continue;
            }
            break;
        }

        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        if line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
            value = Some(line[colon + 1..].to_vec());
        }
    }

    value.map(|v| v.trim_ascii().to_vec())
}

/// Dedup key for messages without a usable UIDL: the Message-ID, or else an
/// MD5 of the header block
pub fn fallback_key(raw: &[u8]) -> String {
    let message_id = header_value(raw, "Message-ID")
        .map(|v| String::from_utf8_lossy(&v).trim().to_string())
        .filter(|id| !id.is_empty());

    match message_id {
        Some(id) => format!("msgid-{}", id),
        None => format!("hash-{:x}", md5::compute(header_block(raw))),
    }
}

/// Lenient RFC 2822 date parsing (trailing comments, doubled spaces, " ,")
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let mut s = value.trim().to_string();
    if let Some(paren) = s.rfind('(') {
        s = s[..paren].trim().to_string();
    }
    while s.contains("  ") {
        s = s.replace("  ", " ");
    }
    s = s.replace(" ,", ",");
    DateTime::parse_from_rfc2822(&s).ok()
}

/// The message's own Date header, or now
pub fn message_date(raw: &[u8]) -> DateTime<FixedOffset> {
    header_value(raw, "Date")
        .and_then(|v| parse_date(&String::from_utf8_lossy(&v)))
        .unwrap_or_else(|| Utc::now().fixed_offset())
}

/// IMAP `date-time` for APPEND, e.g. `05-Mar-2024 09:15:00 +0900`
pub fn imap_internal_date(date: &DateTime<FixedOffset>) -> String {
    date.format("%d-%b-%Y %H:%M:%S %z").to_string()
}

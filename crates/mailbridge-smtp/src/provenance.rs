//! Provenance headers stamped on re-injected messages

/// Prepend `X-Fetched-By` and `X-Delivered-To` to a normalized message.
///
/// The headers go in front of the existing header block so the original
/// headers stay byte-for-byte untouched. Input without a header/body
/// separator is returned as is.
pub fn inject_provenance_headers(raw: &[u8], agent: &str, deliver_to: &str) -> Vec<u8> {
    if !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        return raw.to_vec();
    }

    let prefix = format!(
        "X-Fetched-By: {}\r\nX-Delivered-To: {}\r\n",
        single_line(agent),
        single_line(deliver_to)
    );

    let mut out = Vec::with_capacity(prefix.len() + raw.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(raw);
    out
}

// Header values must not be able to open a new header line
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

//! Header repair codec
//!
//! Turns whatever a mail server hands us for a header (RFC 2047 encoded-words,
//! raw 8-bit bytes in an undeclared legacy charset, or plain text) into
//! displayable text. [`repair`] is total: it never fails, and everything it
//! returns has passed through [`sanitize`], which marks unrecoverable bytes
//! with `?` instead of dropping them.

use base64::prelude::*;
use encoding_rs::{Encoding, EUC_KR, GBK, ISO_2022_JP, SHIFT_JIS, UTF_8, WINDOWS_1252};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

const REPLACEMENT: char = '\u{FFFD}';

/// Input to [`repair`]: header bytes as received, or text already decoded upstream
#[derive(Debug, Clone, Copy)]
pub enum HeaderText<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

impl<'a> From<&'a str> for HeaderText<'a> {
    fn from(text: &'a str) -> Self {
        HeaderText::Text(text)
    }
}

impl<'a> From<&'a String> for HeaderText<'a> {
    fn from(text: &'a String) -> Self {
        HeaderText::Text(text)
    }
}

impl<'a> From<&'a [u8]> for HeaderText<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        HeaderText::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for HeaderText<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        HeaderText::Bytes(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for HeaderText<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        HeaderText::Bytes(bytes)
    }
}

/// Decode and sanitize a header value
pub fn repair<'a>(input: impl Into<HeaderText<'a>>) -> String {
    let decoded = match input.into() {
        HeaderText::Text(text) if !text.contains("=?") => text.to_string(),
        HeaderText::Text(text) => decode_encoded_words(text.as_bytes()),
        HeaderText::Bytes(bytes) if has_marker(bytes) => decode_encoded_words(bytes),
        HeaderText::Bytes(bytes) => decode_raw(bytes),
    };
    sanitize(&decoded)
}

/// Resolve a declared charset label, consolidating the aliases legacy mailers emit
pub fn charset_encoding(label: &str) -> &'static Encoding {
    let key: String = label
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect();

    match key.as_str() {
        "ksc5601" | "ksc56011987" | "ksc5601987" | "euckr" | "cseuckr" | "iso2022kr" | "cp949"
        | "windows949" | "uhc" => EUC_KR,
        "utf8" => UTF_8,
        "iso88591" | "latin1" | "windows1252" | "cp1252" | "usascii" | "ascii" => WINDOWS_1252,
        "iso2022jp" => ISO_2022_JP,
        "shiftjis" | "sjis" | "mskanji" | "cp932" | "windows31j" => SHIFT_JIS,
        "gb2312" | "gbk" | "gb18030" | "cp936" => GBK,
        _ => Encoding::for_label(label.trim().as_bytes()).unwrap_or(UTF_8),
    }
}

/// Single exit for every decode path
pub fn sanitize(text: &str) -> String {
    let unfolded = folding_re().replace_all(text, " ");

    let mut cleaned = String::with_capacity(unfolded.len());
    for c in unfolded.chars() {
        match c {
            REPLACEMENT => cleaned.push('?'),
            '\u{FFFE}' | '\u{FFFF}' => {}
            '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' => {}
            c => cleaned.push(c),
        }
    }

    let without_words = leftover_word_re().replace_all(&cleaned, "");
    blank_run_re()
        .replace_all(&without_words, " ")
        .trim()
        .to_string()
}

// --- encoded-words ---------------------------------------------------------

#[derive(Debug, Clone)]
struct EncodedWord {
    label: String,
    encoding: &'static Encoding,
    transfer: u8,
    bytes: Vec<u8>,
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a [u8]),
    Word(EncodedWord),
}

fn decode_encoded_words(input: &[u8]) -> String {
    let tokens = tokenize(input);
    let mut out = String::with_capacity(input.len());

    for token in merge_words(tokens) {
        match token {
            Token::Text(text) => out.push_str(&decode_raw(text)),
            Token::Word(word) => out.push_str(&decode_charset(&word.label, &word.bytes)),
        }
    }

    out
}

fn tokenize(input: &[u8]) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    for caps in encoded_word_re().captures_iter(input) {
        let (Some(whole), Some(label), Some(transfer), Some(payload)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };

        if whole.start() > pos {
            tokens.push(Token::Text(&input[pos..whole.start()]));
        }
        pos = whole.end();

        let transfer = transfer.as_bytes()[0].to_ascii_uppercase();
        let bytes = match transfer {
            b'B' => decode_b(payload.as_bytes()),
            _ => Some(decode_q(payload.as_bytes())),
        };

        match bytes {
            Some(bytes) => {
                let label = String::from_utf8_lossy(label.as_bytes()).into_owned();
                tokens.push(Token::Word(EncodedWord {
                    encoding: charset_encoding(&label),
                    label,
                    transfer,
                    bytes,
                }));
            }
            // Left for sanitize to strip
            None => tokens.push(Token::Text(whole.as_bytes())),
        }
    }

    if pos < input.len() {
        tokens.push(Token::Text(&input[pos..]));
    }
    tokens
}

/// Join runs of words with the same charset and transfer encoding so that a
/// multibyte character split across two words decodes as one. Whitespace
/// between two words is dropped; whitespace next to plain text is kept.
fn merge_words(tokens: Vec<Token<'_>>) -> Vec<Token<'_>> {
    let mut merged = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Text(text) => {
                let between_words = i > 0
                    && is_word(tokens.get(i - 1))
                    && is_word(tokens.get(i + 1))
                    && is_blank(text);
                if !between_words {
                    merged.push(Token::Text(*text));
                }
                i += 1;
            }
            Token::Word(first) => {
                let mut word = first.clone();
                let mut next = i + 1;

                loop {
                    let candidate = match tokens.get(next) {
                        Some(Token::Word(_)) => next,
                        Some(Token::Text(gap)) if is_blank(gap) && is_word(tokens.get(next + 1)) => {
                            next + 1
                        }
                        _ => break,
                    };
                    match &tokens[candidate] {
                        Token::Word(w) if w.encoding == word.encoding && w.transfer == word.transfer => {
                            word.bytes.extend_from_slice(&w.bytes);
                            next = candidate + 1;
                        }
                        _ => break,
                    }
                }

                merged.push(Token::Word(word));
                i = next;
            }
        }
    }

    merged
}

fn is_word(token: Option<&Token<'_>>) -> bool {
    matches!(token, Some(Token::Word(_)))
}

fn decode_b(payload: &[u8]) -> Option<Vec<u8>> {
    let clean: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64_STANDARD
        .decode(&clean)
        .or_else(|_| {
            let end = clean.iter().rposition(|b| *b != b'=').map_or(0, |p| p + 1);
            BASE64_STANDARD_NO_PAD.decode(&clean[..end])
        })
        .ok()
}

fn decode_q(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;

    while i < payload.len() {
        match payload[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < payload.len() => {
                match (hex_value(payload[i + 1]), hex_value(payload[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode a word's payload with its declared charset
fn decode_charset(label: &str, bytes: &[u8]) -> String {
    let encoding = charset_encoding(label);
    if encoding == UTF_8 {
        return decode_utf8_or_legacy(bytes);
    }

    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        debug!("Lossy {} decode of {} header bytes", encoding.name(), bytes.len());
    }
    text.into_owned()
}

/// UTF-8 with the round-trip check: if the lossy result re-encodes to the same
/// bytes the replacement characters were in the source, otherwise the bytes
/// were never UTF-8 and the Korean legacy codec gets a try.
fn decode_utf8_or_legacy(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if !text.contains(REPLACEMENT) || text.as_bytes() == bytes {
        return text.into_owned();
    }

    match strict_decode(EUC_KR, bytes) {
        Some(legacy) => {
            debug!("Header mislabeled as UTF-8, decoded as {}", EUC_KR.name());
            legacy
        }
        None => text.into_owned(),
    }
}

fn strict_decode(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors || text.contains(REPLACEMENT) {
        None
    } else {
        Some(text.into_owned())
    }
}

// --- raw 8-bit headers -----------------------------------------------------

type RawStrategy = fn(&[u8]) -> Option<String>;

/// Tried in order; the first one that produces text wins
const RAW_STRATEGIES: [(&str, RawStrategy); 4] = [
    ("ascii", ascii_passthrough as RawStrategy),
    ("korean-signature", korean_signature as RawStrategy),
    ("utf8", valid_utf8 as RawStrategy),
    ("korean-legacy", korean_legacy as RawStrategy),
];

/// Byte sequences that only show up in CP949 text: field labels and greetings
/// Korean mailers put in headers (보낸 사람, 받는 사람, 제목, 날짜, 아이디, 안녕하세요).
const KOREAN_SIGNATURES: [&[u8]; 6] = [
    &[0xba, 0xb8, 0xb3, 0xbd, 0x20, 0xbb, 0xe7, 0xb6, 0xf7],
    &[0xb9, 0xde, 0xb4, 0xc2, 0x20, 0xbb, 0xe7, 0xb6, 0xf7],
    &[0xc1, 0xa6, 0xb8, 0xf1],
    &[0xb3, 0xaf, 0xc2, 0xa5],
    &[0xbe, 0xc6, 0xc0, 0xcc, 0xb5, 0xf0],
    &[0xbe, 0xc8, 0xb3, 0xe7, 0xc7, 0xcf, 0xbc, 0xbc, 0xbf, 0xe4],
];

fn decode_raw(bytes: &[u8]) -> String {
    RAW_STRATEGIES
        .iter()
        .find_map(|(name, strategy)| {
            let text = strategy(bytes)?;
            if *name != "ascii" {
                debug!("Raw header decoded by {} strategy", name);
            }
            Some(text)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
}

fn ascii_passthrough(bytes: &[u8]) -> Option<String> {
    bytes
        .is_ascii()
        .then(|| String::from_utf8_lossy(bytes).into_owned())
}

fn korean_signature(bytes: &[u8]) -> Option<String> {
    let signed = KOREAN_SIGNATURES
        .iter()
        .any(|sig| bytes.windows(sig.len()).any(|w| w == *sig));
    if signed {
        strict_decode(EUC_KR, bytes)
    } else {
        None
    }
}

fn valid_utf8(bytes: &[u8]) -> Option<String> {
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

fn korean_legacy(bytes: &[u8]) -> Option<String> {
    strict_decode(EUC_KR, bytes)
}

// --- patterns --------------------------------------------------------------

fn has_marker(bytes: &[u8]) -> bool {
    bytes.windows(2).any(|w| w == b"=?")
}

fn encoded_word_re() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"(?i-u)=\?([^?\s]+)\?([QB])\?([^?]*)\?=").unwrap())
}

fn leftover_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)=\?[^?\s]+\?[QB]\?[^?]*\?=").unwrap())
}

fn folding_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n[ \t]+").unwrap())
}

fn blank_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").unwrap())
}

fn is_blank(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_base64_word() {
        assert_eq!(repair("=?UTF-8?B?7ZWc6riA?="), "한글");
        assert_eq!(repair("=?utf-8?b?SGVsbG8sIOS4lueVjA==?="), "Hello, 世界");
    }

    #[test]
    fn test_character_split_across_words() {
        // 한 is ED 95 9C; the first word carries only ED 95
        assert_eq!(repair("=?UTF-8?B?7ZU=?= =?UTF-8?B?nOq4gA==?="), "한글");
        assert_eq!(repair("=?UTF-8?B?7ZU=?=\r\n =?UTF-8?B?nOq4gA==?="), "한글");
    }

    #[test]
    fn test_cp949_mislabeled_as_utf8() {
        assert_eq!(repair("=?UTF-8?B?x9Gx2w==?="), "한글");
        assert_eq!(repair("=?utf-8?B?waa48SDF1726xq4=?="), "제목 테스트");
    }

    #[test]
    fn test_korean_charset_aliases() {
        assert_eq!(repair("=?ks_c_5601-1987?B?vsiz58fPvLy/5A==?="), "안녕하세요");
        assert_eq!(repair("=?EUC-KR?B?waa48Q==?="), "제목");
        assert_eq!(charset_encoding("KSC5601"), EUC_KR);
        assert_eq!(charset_encoding("windows-949"), EUC_KR);
        assert_eq!(charset_encoding("iso-2022-kr"), EUC_KR);
    }

    #[test]
    fn test_other_legacy_charsets() {
        assert_eq!(repair("=?ISO-8859-1?B?Q2Fm6Q==?="), "Café");
        assert_eq!(repair("=?iso-8859-1?Q?Caf=E9_au_lait?="), "Café au lait");
        assert_eq!(repair("=?Shift_JIS?B?grGC8YLJgr+CzQ==?="), "こんにちは");
        assert_eq!(repair("=?gb2312?B?xOO6ww==?="), "你好");
    }

    #[test]
    fn test_genuine_replacement_char_becomes_question_mark() {
        assert_eq!(repair("=?UTF-8?B?RndkOiDvv70gdGVzdA==?="), "Fwd: ? test");
    }

    #[test]
    fn test_quoted_printable_word() {
        assert_eq!(repair("=?UTF-8?Q?=ED=95=9C=EA=B8=80?="), "한글");
        assert_eq!(repair("=?UTF-8?Q?100=25_sure?="), "100% sure");
    }

    #[test]
    fn test_whitespace_next_to_plain_text_is_kept() {
        assert_eq!(repair("Re: =?UTF-8?B?7ZWc6riA?= meeting"), "Re: 한글 meeting");
        assert_eq!(
            repair("=?UTF-8?B?7ZWc6riA?= =?ISO-8859-1?Q?Caf=E9?="),
            "한글Café"
        );
    }

    #[test]
    fn test_undecodable_word_is_stripped() {
        assert_eq!(repair("=?UTF-8?B?!!!?= tail"), "tail");
    }

    #[test]
    fn test_unknown_charset_falls_back_to_utf8() {
        assert_eq!(repair("=?x-unknown?B?SGVsbG8sIOS4lueVjA==?="), "Hello, 世界");
    }

    #[test]
    fn test_raw_cp949_bytes() {
        let with_signature: &[u8] = &[0xc1, 0xa6, 0xb8, 0xf1, 0x3a, 0x20, 0xc8, 0xb8, 0xc0, 0xc7];
        assert_eq!(repair(with_signature), "제목: 회의");

        let without_signature: &[u8] = &[0xc8, 0xb8, 0xc0, 0xc7];
        assert_eq!(repair(without_signature), "회의");
    }

    #[test]
    fn test_raw_utf8_and_ascii_bytes() {
        assert_eq!(repair("회의 안건".as_bytes()), "회의 안건");
        assert_eq!(repair(b"Weekly\x01 \t report "), "Weekly report");
    }

    #[test]
    fn test_plain_text_is_only_sanitized() {
        assert_eq!(repair("  plain   subject "), "plain subject");
        assert_eq!(repair("folded\r\n\tsubject"), "folded subject");
        assert_eq!(repair(""), "");
    }

    #[test]
    fn test_sanitize_noncharacters_and_controls() {
        assert_eq!(sanitize("a\u{FFFE}b\u{FFFF}c\u{0}d"), "abcd");
        assert_eq!(sanitize("x\u{FFFD}y"), "x?y");
    }

    #[test]
    fn test_raw_strategies_in_isolation() {
        assert_eq!(ascii_passthrough(b"abc"), Some("abc".to_string()));
        assert_eq!(ascii_passthrough(&[0xc8, 0xb8]), None);
        assert_eq!(korean_signature(&[0xc8, 0xb8, 0xc0, 0xc7]), None);
        assert_eq!(valid_utf8(&[0xc8, 0xb8, 0xc0, 0xc7]), None);
        assert_eq!(korean_legacy(&[0xc8, 0xb8, 0xc0, 0xc7]), Some("회의".to_string()));
    }
}

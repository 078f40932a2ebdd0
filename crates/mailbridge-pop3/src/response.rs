//! Parsing of POP3 status lines and multi-line listings

use crate::{Pop3Error, Pop3Result};

/// One line of a LIST response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntry {
    /// Message number within the current session
    pub index: u32,
    /// Size in octets
    pub size: u64,
}

/// One line of a UIDL response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidlEntry {
    /// Message number within the current session
    pub index: u32,
    /// Server-assigned unique id
    pub uid: String,
}

/// Split a status line into success and the text after the indicator
pub(crate) fn parse_status(line: &str) -> Pop3Result<(bool, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("+OK") {
        Ok((true, rest.trim().to_string()))
    } else if let Some(rest) = line.strip_prefix("-ERR") {
        Ok((false, rest.trim().to_string()))
    } else {
        Err(Pop3Error::ProtocolError(format!(
            "unexpected status line: {}",
            line
        )))
    }
}

pub(crate) fn parse_list(body: &[u8]) -> Pop3Result<Vec<ListEntry>> {
    listing_lines(body)
        .map(|line| {
            let mut parts = line.split_whitespace();
            let index = parts.next().and_then(|p| p.parse().ok());
            let size = parts.next().and_then(|p| p.parse().ok());
            match (index, size) {
                (Some(index), Some(size)) => Ok(ListEntry { index, size }),
                _ => Err(Pop3Error::ProtocolError(format!("bad LIST line: {}", line))),
            }
        })
        .collect()
}

pub(crate) fn parse_uidl(body: &[u8]) -> Pop3Result<Vec<UidlEntry>> {
    listing_lines(body)
        .map(|line| {
            let mut parts = line.split_whitespace();
            let index = parts.next().and_then(|p| p.parse().ok());
            let uid = parts.next();
            match (index, uid) {
                (Some(index), Some(uid)) => Ok(UidlEntry {
                    index,
                    uid: uid.to_string(),
                }),
                _ => Err(Pop3Error::ProtocolError(format!("bad UIDL line: {}", line))),
            }
        })
        .collect()
}

fn listing_lines(body: &[u8]) -> impl Iterator<Item = String> + '_ {
    body.split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
}

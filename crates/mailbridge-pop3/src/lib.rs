//! POP3 protocol client for mailbridge
//!
//! A small RFC 1939 client: one command in flight at a time, binary-safe
//! multi-line responses, plain TCP or implicit TLS.

mod client;
mod error;
mod response;

pub use client::{Pop3Client, Pop3Stream};
pub use error::{Pop3Error, Pop3Result};
pub use response::{ListEntry, UidlEntry};

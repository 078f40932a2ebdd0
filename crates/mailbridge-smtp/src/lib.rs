//! SMTP re-injection for mailbridge
//!
//! Hands fetched messages back to the local MTA with a null envelope sender,
//! after stamping provenance headers on them.

mod client;
mod error;
mod provenance;

pub use client::RelayClient;
pub use error::{SmtpError, SmtpResult};
pub use provenance::inject_provenance_headers;

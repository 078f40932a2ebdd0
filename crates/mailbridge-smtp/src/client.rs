//! SMTP relay client

use crate::{SmtpError, SmtpResult};
use lettre::{address::Envelope, Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, info};

/// Client for the local MTA that accepts re-injected mail
#[derive(Debug, Clone)]
pub struct RelayClient {
    host: String,
    port: u16,
}

impl RelayClient {
    /// Create a relay client. The relay trusts us by network, so there is no auth.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Submit `raw` unchanged to `deliver_to` with a null envelope sender (`MAIL FROM:<>`)
    pub async fn reinject(&self, deliver_to: &str, raw: &[u8]) -> SmtpResult<()> {
        let envelope = null_sender_envelope(deliver_to)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
            .port(self.port)
            .build();

        debug!(
            "Re-injecting {} bytes for {} via {}:{}",
            raw.len(),
            deliver_to,
            self.host,
            self.port
        );

        transport
            .send_raw(&envelope, raw)
            .await
            .map_err(|e| {
                if e.is_permanent() || e.is_transient() {
                    SmtpError::SendFailed(e.to_string())
                } else {
                    SmtpError::ConnectionFailed(e.to_string())
                }
            })?;

        info!("Message re-injected for {}", deliver_to);
        Ok(())
    }
}

fn null_sender_envelope(deliver_to: &str) -> SmtpResult<Envelope> {
    let recipient: Address = deliver_to
        .trim()
        .parse()
        .map_err(|e| SmtpError::InvalidAddress(format!("{}: {}", deliver_to, e)))?;

    Envelope::new(None, vec![recipient]).map_err(|e| SmtpError::EnvelopeError(e.to_string()))
}

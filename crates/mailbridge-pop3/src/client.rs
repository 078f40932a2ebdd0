//! POP3 client implementation

use crate::response::{self, ListEntry, UidlEntry};
use crate::{Pop3Error, Pop3Result};
use async_std::io::prelude::*;
use async_std::io::BufReader;
use async_std::net::TcpStream;
use tracing::{debug, info};

/// Byte stream a POP3 session can run over (plain TCP, TLS, or a test double)
pub trait Pop3Stream: Read + Write + Unpin + Send {}

impl<T: Read + Write + Unpin + Send> Pop3Stream for T {}

/// A single POP3 session. Commands are strictly sequential.
pub struct Pop3Client {
    stream: Option<BufReader<Box<dyn Pop3Stream>>>,
    greeting: String,
}

impl Pop3Client {
    /// Connect to `host:port`, optionally over implicit TLS, and read the greeting
    pub async fn connect(host: &str, port: u16, use_tls: bool) -> Pop3Result<Self> {
        info!("Connecting to POP3 {}:{} (tls: {})", host, port, use_tls);

        let tcp_stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .map_err(|e| Pop3Error::ConnectionFailed(e.to_string()))?;

        let stream: Box<dyn Pop3Stream> = if use_tls {
            let tls_stream = async_native_tls::TlsConnector::new()
                .connect(host, tcp_stream)
                .await
                .map_err(|e| Pop3Error::TlsError(e.to_string()))?;
            debug!("TLS connection established");
            Box::new(tls_stream)
        } else {
            Box::new(tcp_stream)
        };

        Self::from_stream(stream).await
    }

    /// Start a session over an already-open stream
    pub async fn from_stream(stream: Box<dyn Pop3Stream>) -> Pop3Result<Self> {
        let mut client = Self {
            stream: Some(BufReader::new(stream)),
            greeting: String::new(),
        };

        let line = client.read_line().await?;
        match response::parse_status(&line)? {
            (true, text) => {
                debug!("POP3 greeting: {}", text);
                client.greeting = text;
                Ok(client)
            }
            (false, text) => Err(Pop3Error::ConnectionFailed(text)),
        }
    }

    /// Server greeting text after `+OK`
    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// USER/PASS authentication
    pub async fn login(&mut self, username: &str, password: &str) -> Pop3Result<()> {
        info!("Authenticating POP3 user {}", username);

        self.command(&format!("USER {}", username), "USER")
            .await
            .map_err(auth_error)?;
        self.command(&format!("PASS {}", password), "PASS")
            .await
            .map_err(auth_error)?;

        info!("POP3 authentication successful");
        Ok(())
    }

    /// LIST: message numbers and sizes
    pub async fn list(&mut self) -> Pop3Result<Vec<ListEntry>> {
        self.command("LIST", "LIST").await?;
        let body = self.read_multiline().await?;
        response::parse_list(&body)
    }

    /// UIDL: message numbers and unique ids. Fails with `ServerError` when unsupported.
    pub async fn uidl(&mut self) -> Pop3Result<Vec<UidlEntry>> {
        self.command("UIDL", "UIDL").await?;
        let body = self.read_multiline().await?;
        response::parse_uidl(&body)
    }

    /// TOP: header block plus `lines` body lines, still dot-stuffed
    pub async fn top(&mut self, index: u32, lines: u32) -> Pop3Result<Vec<u8>> {
        self.command(&format!("TOP {} {}", index, lines), "TOP")
            .await?;
        self.read_multiline().await
    }

    /// RETR: the full message, still dot-stuffed
    pub async fn retr(&mut self, index: u32) -> Pop3Result<Vec<u8>> {
        self.command(&format!("RETR {}", index), "RETR").await?;
        let body = self.read_multiline().await?;
        debug!("RETR {}: {} bytes", index, body.len());
        Ok(body)
    }

    /// Mark a message for deletion at QUIT
    pub async fn dele(&mut self, index: u32) -> Pop3Result<()> {
        self.command(&format!("DELE {}", index), "DELE").await?;
        Ok(())
    }

    pub async fn noop(&mut self) -> Pop3Result<()> {
        self.command("NOOP", "NOOP").await?;
        Ok(())
    }

    /// End the session; deletions are committed by the server here
    pub async fn quit(&mut self) -> Pop3Result<()> {
        let result = self.command("QUIT", "QUIT").await;
        self.stream = None;
        result.map(|_| ())
    }

    /// Send one command and read its status line. `label` is what gets logged,
    /// so the password never reaches the log.
    async fn command(&mut self, line: &str, label: &str) -> Pop3Result<String> {
        debug!("POP3 > {}", label);

        let stream = self.stream.as_mut().ok_or(Pop3Error::NotConnected)?;
        stream
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        stream.get_mut().flush().await?;

        let reply = self.read_line().await?;
        match response::parse_status(&reply)? {
            (true, text) => Ok(text),
            (false, text) => Err(Pop3Error::ServerError(format!("{}: {}", label, text))),
        }
    }

    async fn read_line(&mut self) -> Pop3Result<String> {
        let stream = self.stream.as_mut().ok_or(Pop3Error::NotConnected)?;
        let mut buf = Vec::new();
        let n = stream.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            self.stream = None;
            return Err(Pop3Error::ConnectionFailed(
                "connection closed by server".to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read a multi-line body up to the lone `.` terminator. Line endings and
    /// dot-stuffing are left as the server sent them.
    async fn read_multiline(&mut self) -> Pop3Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(Pop3Error::NotConnected)?;
        let mut body = Vec::new();

        loop {
            let mut line = Vec::new();
            let n = stream.read_until(b'\n', &mut line).await?;
            if n == 0 {
                self.stream = None;
                return Err(Pop3Error::ConnectionFailed(
                    "connection closed inside multi-line response".to_string(),
                ));
            }
            if line == b".\r\n" || line == b".\n" {
                return Ok(body);
            }
            body.extend_from_slice(&line);
        }
    }
}

fn auth_error(e: Pop3Error) -> Pop3Error {
    match e {
        Pop3Error::ServerError(text) => Pop3Error::AuthenticationFailed(text),
        other => other,
    }
}

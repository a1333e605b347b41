//! SMTP submission transport.
//!
//! A minimal asynchronous SMTP client: connect, greeting, EHLO,
//! opportunistic or required STARTTLS, optional AUTH LOGIN, then
//! MAIL FROM → RCPT TO → DATA → QUIT. One message per call, every
//! operation bounded by the configured timeout.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing::{debug, warn};

use super::{Message, Transport};
use crate::error::TransportError;

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const fn default_port() -> u16 {
    587
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_hello_name() -> String {
    "localhost".to_string()
}

/// SMTP smarthost configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Server to submit through.
    pub host: String,

    /// Submission port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// AUTH LOGIN credentials; authentication is skipped when either is
    /// absent.
    #[serde(default)]
    pub username: Option<String>,

    /// See `username`.
    #[serde(default)]
    pub password: Option<String>,

    /// Fail delivery when the server does not offer STARTTLS or the
    /// upgrade fails. When `false`, TLS is attempted whenever offered and
    /// delivery falls back to plaintext otherwise.
    #[serde(default)]
    pub require_tls: bool,

    /// Per-operation timeout. A stalled server fails the attempt instead
    /// of stalling the whole queue.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Name to introduce ourselves with in EHLO.
    #[serde(default = "default_hello_name")]
    pub hello_name: String,
}

/// A complete SMTP response, possibly multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// All message lines in the response.
    pub lines: Vec<String>,
}

impl Response {
    /// The complete message as a single string with lines joined by
    /// newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// Returns `true` for 2xx codes.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Returns `true` for 3xx codes (e.g. 354 after DATA).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Parse a complete response from the front of `buffer`.
    ///
    /// Returns the response and the number of bytes consumed, or `None`
    /// when the buffer does not yet hold the response's final line.
    fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, TransportError> {
        let text = std::str::from_utf8(buffer)
            .map_err(|e| TransportError::Parse(format!("Response is not valid UTF-8: {e}")))?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut code = None;

        loop {
            let rest = &text[consumed..];
            let Some(line_end) = rest.find('\n') else {
                return Ok(None);
            };

            let raw = rest[..line_end].trim_end_matches('\r');
            if raw.len() < 3 {
                return Err(TransportError::Parse(format!(
                    "Response line too short: '{raw}'"
                )));
            }

            let line_code: u16 = raw[..3]
                .parse()
                .map_err(|_| TransportError::Parse(format!("Invalid status code: '{raw}'")))?;
            code.get_or_insert(line_code);

            let is_last = match raw.as_bytes().get(3) {
                Some(b' ') | None => true,
                Some(b'-') => false,
                Some(c) => {
                    return Err(TransportError::Parse(format!(
                        "Invalid separator character: '{}'",
                        char::from(*c)
                    )));
                }
            };

            lines.push(raw.get(4..).unwrap_or("").to_string());
            consumed += line_end + 1;

            if is_last {
                let code = code.unwrap_or(line_code);
                return Ok(Some((Self { code, lines }, consumed)));
            }
        }
    }
}

/// An SMTP connection that is either plain TCP or TLS-wrapped.
enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    /// Upgrade a plain connection to TLS against the system root store.
    async fn upgrade_to_tls(self, domain: &str) -> Result<Self, TransportError> {
        match self {
            Self::Plain(stream) => {
                let mut root_store = RootCertStore::empty();

                let certs = rustls_native_certs::load_native_certs();
                for cert in certs.certs {
                    root_store.add(cert).map_err(|e| {
                        TransportError::Tls(format!("Failed to add certificate: {e}"))
                    })?;
                }
                if !certs.errors.is_empty() {
                    warn!(?certs.errors, "Some certificates could not be loaded");
                }

                let config = ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();

                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| TransportError::Tls(format!("Invalid domain: {e}")))?;

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;

                Ok(Self::Tls(Box::new(tls_stream)))
            }
            Self::Tls(_) => Err(TransportError::Tls(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
}

impl SmtpClient {
    /// Connect to `addr`, remembering `server_domain` for a later TLS
    /// upgrade.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("Failed to connect to {addr}: {e}")))?;

        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
        })
    }

    /// Read the initial server greeting (220 response).
    pub async fn read_greeting(&mut self) -> Result<Response, TransportError> {
        self.read_response().await
    }

    /// Send a raw command and read the response.
    pub async fn command(&mut self, command: &str) -> Result<Response, TransportError> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(TransportError::Closed)?
            .send(data.as_bytes())
            .await?;
        self.read_response().await
    }

    /// Send EHLO with the given name.
    pub async fn ehlo(&mut self, name: &str) -> Result<Response, TransportError> {
        self.command(&format!("EHLO {name}")).await
    }

    /// Send MAIL FROM.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response, TransportError> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// Send RCPT TO.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response, TransportError> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Send DATA.
    pub async fn data(&mut self) -> Result<Response, TransportError> {
        self.command("DATA").await
    }

    /// Send the message body followed by the end-of-data marker.
    pub async fn send_data(&mut self, data: &str) -> Result<Response, TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;

        connection.send(data.as_bytes()).await?;

        if data.ends_with("\r\n") {
            // Already terminated
        } else if data.ends_with('\n') {
            connection.send(b"\r").await?;
        } else {
            connection.send(b"\r\n").await?;
        }

        connection.send(b".\r\n").await?;

        self.read_response().await
    }

    /// Send QUIT.
    pub async fn quit(&mut self) -> Result<Response, TransportError> {
        self.command("QUIT").await
    }

    /// Send STARTTLS and, on a 2xx answer, upgrade the connection.
    pub async fn starttls(&mut self) -> Result<Response, TransportError> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let domain = self.server_domain.clone();
            let connection = self.connection.take().ok_or(TransportError::Closed)?;
            self.connection = Some(connection.upgrade_to_tls(&domain).await?);
        }

        Ok(response)
    }

    /// Read a complete SMTP response from the server.
    async fn read_response(&mut self) -> Result<Response, TransportError> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(TransportError::Parse(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Transport that submits through a configured SMTP smarthost.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    /// Create a transport for the given smarthost.
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    const fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn negotiate_tls(&self, client: &mut SmtpClient) -> Result<(), TransportError> {
        let ehlo = op(self.timeout(), "EHLO", client.ehlo(&self.config.hello_name)).await?;
        if !ehlo.is_success() {
            return Err(rejected("EHLO", &ehlo));
        }

        let offers_starttls = ehlo
            .message()
            .lines()
            .any(|line| line.to_uppercase().contains("STARTTLS"));

        if !offers_starttls {
            if self.config.require_tls {
                return Err(TransportError::Tls(
                    "TLS required but server does not offer STARTTLS".to_string(),
                ));
            }
            debug!(host = %self.config.host, "Server does not offer STARTTLS, continuing in plaintext");
            return Ok(());
        }

        match op(self.timeout(), "STARTTLS", client.starttls()).await {
            Ok(response) if response.is_success() => {
                // RFC 3207: the session state resets after the upgrade
                let ehlo =
                    op(self.timeout(), "EHLO", client.ehlo(&self.config.hello_name)).await?;
                if !ehlo.is_success() {
                    return Err(rejected("EHLO", &ehlo));
                }
                debug!(host = %self.config.host, "TLS negotiated via STARTTLS");
                Ok(())
            }
            Ok(response) => {
                if self.config.require_tls {
                    return Err(TransportError::Tls(format!(
                        "Server rejected STARTTLS: {}",
                        response.message()
                    )));
                }
                debug!(host = %self.config.host, "Server rejected STARTTLS, continuing in plaintext");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn authenticate(&self, client: &mut SmtpClient) -> Result<(), TransportError> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Ok(());
        };

        let response = op(self.timeout(), "AUTH", client.command("AUTH LOGIN")).await?;
        if response.code != 334 {
            return Err(TransportError::Auth(format!(
                "Server rejected AUTH LOGIN: {}",
                response.message()
            )));
        }

        let response = op(
            self.timeout(),
            "AUTH username",
            client.command(&BASE64.encode(username)),
        )
        .await?;
        if response.code != 334 {
            return Err(TransportError::Auth(format!(
                "Server rejected username: {}",
                response.message()
            )));
        }

        let response = op(
            self.timeout(),
            "AUTH password",
            client.command(&BASE64.encode(password)),
        )
        .await?;
        if !response.is_success() {
            return Err(TransportError::Auth(format!(
                "Server rejected credentials: {}",
                response.message()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let timeout = self.timeout();

        let mut client = op(
            timeout,
            "connect",
            SmtpClient::connect(&addr, self.config.host.clone()),
        )
        .await?;

        let greeting = op(timeout, "greeting", client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(rejected("greeting", &greeting));
        }

        self.negotiate_tls(&mut client).await?;
        self.authenticate(&mut client).await?;

        let response = op(
            timeout,
            "MAIL FROM",
            client.mail_from(message.envelope_from()),
        )
        .await?;
        if !response.is_success() {
            return Err(rejected("MAIL FROM", &response));
        }

        let response = op(timeout, "RCPT TO", client.rcpt_to(&message.to)).await?;
        if !response.is_success() {
            return Err(rejected("RCPT TO", &response));
        }

        let response = op(timeout, "DATA", client.data()).await?;
        if !response.is_intermediate() {
            return Err(rejected("DATA", &response));
        }

        let response = op(
            timeout,
            "message data",
            client.send_data(&message.to_rfc5322()),
        )
        .await?;
        if !response.is_success() {
            return Err(rejected("message data", &response));
        }

        // The message is already accepted; a failed QUIT is not a failed
        // delivery.
        if let Err(e) = op(timeout, "QUIT", client.quit()).await {
            warn!(host = %self.config.host, "QUIT after successful delivery failed: {e}");
        }

        Ok(())
    }
}

async fn op<T, F>(timeout: Duration, what: &'static str, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout(format!("{what} timed out after {timeout:?}")))?
}

fn rejected(command: &'static str, response: &Response) -> TransportError {
    TransportError::Rejected {
        command,
        response: format!("{} {}", response.code, response.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line_response() {
        let (response, consumed) = Response::parse(b"250 OK\r\n")
            .expect("Parse failed")
            .expect("Response complete");
        assert_eq!(response.code, 250);
        assert_eq!(response.message(), "OK");
        assert_eq!(consumed, 8);
        assert!(response.is_success());
    }

    #[test]
    fn test_parse_multiline_response() {
        let raw = b"250-mail.example.org\r\n250-SIZE 10000000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse(raw)
            .expect("Parse failed")
            .expect("Response complete");
        assert_eq!(response.code, 250);
        assert_eq!(response.lines.len(), 3);
        assert_eq!(
            response.message(),
            "mail.example.org\nSIZE 10000000\nSTARTTLS"
        );
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_incomplete_response_waits_for_more() {
        assert!(
            Response::parse(b"250-mail.example.org\r\n250 ST")
                .expect("Parse failed")
                .is_none()
        );
        assert!(Response::parse(b"25").expect("Parse failed").is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Response::parse(b"abc hello\r\n").is_err());
        assert!(Response::parse(b"250?odd\r\n").is_err());
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let raw = b"354 Go ahead\r\n250 OK\r\n";
        let (response, consumed) = Response::parse(raw)
            .expect("Parse failed")
            .expect("Response complete");
        assert_eq!(response.code, 354);
        assert!(response.is_intermediate());
        assert_eq!(consumed, 14);
    }
}

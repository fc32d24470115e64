//! Transport layer for SMTP connections.
//!
//! A [`SmtpConnection`] is one TCP connection, either cleartext or wrapped
//! in TLS, that speaks SMTP lines. It knows nothing about the session
//! sequence; the `client` module drives it.

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::errors::{TransportError, TransportResult};
use crate::protocol::{SmtpCommand, SmtpResponse};

/// Upper bound on reply lines accepted for a single reply.
const MAX_REPLY_LINES: usize = 512;

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

trait LineStream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> LineStream for T {}

/// Timeouts and TLS trust for a connection.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Bound on TCP connect and on each TLS handshake.
    pub connect_timeout: Duration,
    /// Bound on each write and on each reply.
    pub command_timeout: Duration,
    /// Client configuration for implicit TLS and STARTTLS.
    pub tls_config: Arc<rustls::ClientConfig>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            tls_config: default_tls_config(),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

/// One SMTP connection.
pub struct SmtpConnection {
    stream: TransportStream,
    host: String,
    options: ConnectOptions,
}

impl fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("host", &self.host)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl SmtpConnection {
    /// Opens a cleartext connection. The greeting is left unread.
    pub async fn connect(host: &str, port: u16, options: &ConnectOptions) -> TransportResult<Self> {
        let stream = Self::open_tcp(host, port, options.connect_timeout).await?;

        Ok(Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            host: host.to_string(),
            options: options.clone(),
        })
    }

    /// Opens a connection that is TLS from the first byte. The certificate
    /// is verified against `host`. The greeting is left unread.
    pub async fn connect_tls(host: &str, port: u16, options: &ConnectOptions) -> TransportResult<Self> {
        let stream = Self::open_tcp(host, port, options.connect_timeout).await?;
        let tls_stream = Self::handshake(host, stream, options).await?;

        Ok(Self {
            stream: TransportStream::Tls(Box::new(BufReader::new(tls_stream))),
            host: host.to_string(),
            options: options.clone(),
        })
    }

    /// Wraps the existing cleartext connection in TLS, after the server
    /// accepted `STARTTLS`.
    pub async fn upgrade_tls(self) -> TransportResult<Self> {
        let tcp_stream = match self.stream {
            // Anything still buffered arrived before the handshake and is discarded.
            TransportStream::Plain(reader) => reader.into_inner(),
            TransportStream::Tls(_) => return Err(TransportError::tls("Connection already uses TLS")),
        };

        let tls_stream = Self::handshake(&self.host, tcp_stream, &self.options).await?;

        Ok(Self {
            stream: TransportStream::Tls(Box::new(BufReader::new(tls_stream))),
            host: self.host,
            options: self.options,
        })
    }

    /// Returns true once the channel is encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    /// Server host this connection was opened to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sends a command and receives the reply.
    pub async fn send_command(&mut self, command: &SmtpCommand) -> TransportResult<SmtpResponse> {
        tracing::debug!(host = %self.host, command = %command, "Sending SMTP command");

        let line = format!("{}\r\n", command.to_smtp_string());
        self.send_data(line.as_bytes()).await?;
        self.read_response().await
    }

    /// Sends raw bytes (DATA content, AUTH continuation lines).
    pub async fn send_data(&mut self, data: &[u8]) -> TransportResult<()> {
        let command_timeout = self.options.command_timeout;
        let io = self.io();

        timeout(command_timeout, io.write_all(data))
            .await
            .map_err(|_| TransportError::connect("Write timed out"))?
            .map_err(|e| TransportError::connect("Write error").with_cause(e))?;

        timeout(command_timeout, io.flush())
            .await
            .map_err(|_| TransportError::connect("Flush timed out"))?
            .map_err(|e| TransportError::connect("Flush error").with_cause(e))?;

        Ok(())
    }

    /// Reads lines until a complete (possibly multiline) reply arrived.
    pub async fn read_response(&mut self) -> TransportResult<SmtpResponse> {
        let command_timeout = self.options.command_timeout;
        let io = self.io();
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(command_timeout, io.read_line(&mut line))
                .await
                .map_err(|_| TransportError::connect("Read timed out"))?
                .map_err(|e| TransportError::connect("Read error").with_cause(e))?;

            if read == 0 {
                return Err(TransportError::connect("Server closed connection"));
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let is_continuation = SmtpResponse::is_continuation(&line);
            lines.push(line);

            if !is_continuation {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(TransportError::connect("Reply has too many lines"));
            }
        }

        let response = SmtpResponse::parse(&lines)
            .map_err(|e| TransportError::connect("Invalid server reply").with_cause(e))?;

        tracing::debug!(host = %self.host, code = response.code, message = %response.first_message(), "Received SMTP response");

        Ok(response)
    }

    /// Sends `QUIT` and shuts the socket down, ignoring failures.
    pub async fn quit(mut self) {
        if let Err(e) = self.send_command(&SmtpCommand::Quit).await {
            tracing::debug!(host = %self.host, error = %e, "QUIT failed");
        }
        let _ = self.io().shutdown().await;
    }

    fn io(&mut self) -> &mut dyn LineStream {
        match &mut self.stream {
            TransportStream::Plain(stream) => stream,
            TransportStream::Tls(stream) => stream.as_mut(),
        }
    }

    async fn open_tcp(host: &str, port: u16, connect_timeout: Duration) -> TransportResult<TcpStream> {
        if host.is_empty() {
            return Err(TransportError::connect("No SMTP host configured"));
        }
        if port == 0 {
            return Err(TransportError::connect("No SMTP port configured"));
        }

        let address = format!("{}:{}", host, port);
        let stream = timeout(connect_timeout, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| TransportError::connect(format!("Connect to {} timed out", address)))?
            .map_err(|e| Self::map_io_error(e, &address))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %address, error = %e, "Could not disable Nagle's algorithm");
        }
        Ok(stream)
    }

    /// Maps connect-time IO errors.
    fn map_io_error(error: io::Error, address: &str) -> TransportError {
        let message = match error.kind() {
            io::ErrorKind::ConnectionRefused => format!("Connection refused by {}", address),
            io::ErrorKind::TimedOut => format!("Connect to {} timed out", address),
            _ => format!("Could not connect to {}", address),
        };
        TransportError::connect(message).with_cause(error)
    }

    async fn handshake(
        host: &str,
        stream: TcpStream,
        options: &ConnectOptions,
    ) -> TransportResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::tls(format!("Invalid server name: {}", host)).with_cause(e))?;
        let connector = TlsConnector::from(Arc::clone(&options.tls_config));

        timeout(options.connect_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| TransportError::tls("TLS handshake timed out"))?
            .map_err(|e| TransportError::tls(format!("TLS handshake with {} failed", host)).with_cause(e))
    }
}

/// Shared client configuration trusting the webpki root set.
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

    let config = CONFIG.get_or_init(|| {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    });

    Arc::clone(config)
}

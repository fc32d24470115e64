//! Error types for the relay.
//!
//! Ingress errors ([`QueueError`]) are returned synchronously to whoever
//! tried to enqueue. Delivery errors ([`TransportError`]) are terminal for a
//! single attempt and are logged by the worker that hit them.

use std::fmt;
use thiserror::Error;

use crate::protocol::SmtpResponse;

/// Result type for SMTP transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned when a message cannot be accepted into the delivery queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has no free slot right now.
    #[error("email queue is full, try again later")]
    Full,
    /// Shutdown has begun; no new messages are accepted.
    #[error("email service is stopping, cannot queue new email")]
    Stopping,
}

/// The step of an SMTP delivery attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// TCP connect, greeting or EHLO/HELO failed.
    ConnectFailed,
    /// Implicit TLS handshake or STARTTLS upgrade failed.
    TlsHandshakeFailed,
    /// The server rejected the credentials, or they could not be sent safely.
    AuthFailed,
    /// `MAIL FROM` or `RCPT TO` was rejected.
    EnvelopeRejected,
    /// `DATA`, the message stream, or the final reply failed.
    DataTransferFailed,
}

impl TransportErrorKind {
    /// Short name of the protocol step, used in log fields.
    pub fn step(&self) -> &'static str {
        match self {
            TransportErrorKind::ConnectFailed => "connect",
            TransportErrorKind::TlsHandshakeFailed => "tls",
            TransportErrorKind::AuthFailed => "auth",
            TransportErrorKind::EnvelopeRejected => "envelope",
            TransportErrorKind::DataTransferFailed => "data",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::ConnectFailed => write!(f, "Connect failed"),
            TransportErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            TransportErrorKind::AuthFailed => write!(f, "Authentication failed"),
            TransportErrorKind::EnvelopeRejected => write!(f, "Envelope rejected"),
            TransportErrorKind::DataTransferFailed => write!(f, "Data transfer failed"),
        }
    }
}

/// A failed SMTP delivery or connection-test attempt.
#[derive(Error, Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    smtp_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Creates a new transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if the server produced one.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Re-tags the error with another step, keeping message, code and cause.
    ///
    /// Socket-level failures are produced by the connection without knowing
    /// which phase of the session is running; the session relabels them.
    pub fn in_step(mut self, kind: TransportErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Creates a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectFailed, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AuthFailed, message)
    }

    /// Creates an envelope error.
    pub fn envelope(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::EnvelopeRejected, message)
    }

    /// Creates a data transfer error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DataTransferFailed, message)
    }

    /// Lifts an unexpected SMTP reply into an error for the given step.
    pub fn from_response(kind: TransportErrorKind, response: &SmtpResponse) -> Self {
        Self::new(kind, format!("server replied {}", response)).with_smtp_code(response.code)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// A recipient or sender address failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid address {address:?}: {reason}")]
pub struct AddressError {
    address: String,
    reason: &'static str,
}

impl AddressError {
    /// Creates an address error.
    pub fn new(address: impl Into<String>, reason: &'static str) -> Self {
        Self {
            address: address.into(),
            reason,
        }
    }

    /// Returns why the address was rejected.
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Configuration loading or validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable or field name.
        key: String,
        /// What was wrong with it.
        message: String,
    },
    /// A value was parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Template parse or render failures.
#[derive(Error, Debug)]
#[error("failed to render template: {message}")]
pub struct TemplateError {
    message: String,
    #[source]
    cause: Option<minijinja::Error>,
}

impl TemplateError {
    /// Creates a template error without an engine cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(error: minijinja::Error) -> Self {
        Self {
            message: error.to_string(),
            cause: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_messages() {
        assert_eq!(QueueError::Full.to_string(), "email queue is full, try again later");
        assert!(QueueError::Stopping.to_string().contains("stopping"));
    }

    #[test]
    fn test_transport_error_from_response() {
        let response = SmtpResponse::new(550, "No such user");
        let err = TransportError::from_response(TransportErrorKind::EnvelopeRejected, &response);
        assert_eq!(err.kind(), TransportErrorKind::EnvelopeRejected);
        assert_eq!(err.smtp_code(), Some(550));
        assert!(err.to_string().contains("550"));
    }

    #[test]
    fn test_transport_error_display_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connect("could not reach smtp.example.com:25").with_cause(io);
        let text = err.to_string();
        assert!(text.starts_with("Connect failed"));
        assert!(text.ends_with("refused"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_in_step_relabels_kind() {
        let err = TransportError::connect("Read timed out")
            .with_smtp_code(421)
            .in_step(TransportErrorKind::DataTransferFailed);
        assert_eq!(err.kind(), TransportErrorKind::DataTransferFailed);
        assert_eq!(err.kind().step(), "data");
        assert_eq!(err.smtp_code(), Some(421));
    }
}

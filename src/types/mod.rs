//! Core types for the relay.
//!
//! This module provides:
//! - The queued [`Message`] and its per-message [`TransportOverrides`]
//! - Recipient [`Address`] validation
//! - The [`SecurityMode`] a delivery runs under
//! - Envelope and connection-test result types

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::AddressError;

/// Email address (addr-spec only, no display name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and validates an address.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let email = s.trim();
        Self::validate_email(email)?;
        Ok(Self(email.to_string()))
    }

    /// Validates an email address according to RFC 5321 length limits.
    fn validate_email(email: &str) -> Result<(), AddressError> {
        if email.is_empty() {
            return Err(AddressError::new(email, "address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(AddressError::new(email, "address too long (max 254 characters)"));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => return Err(AddressError::new(email, "address must contain exactly one @")),
        };

        if local.is_empty() || local.len() > 64 {
            return Err(AddressError::new(email, "local part must be 1-64 characters"));
        }

        if domain.is_empty() {
            return Err(AddressError::new(email, "domain cannot be empty"));
        }

        if email
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>')
        {
            return Err(AddressError::new(
                email,
                "address cannot contain whitespace, control characters or angle brackets",
            ));
        }

        Ok(())
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Transport security used for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Cleartext SMTP.
    #[default]
    Plain,
    /// TLS from the first byte (port 465).
    ImplicitTls,
    /// Cleartext upgraded with STARTTLS (port 587).
    StartTls,
}

impl SecurityMode {
    /// Infers the mode from a well-known port.
    pub fn for_port(port: u16) -> Self {
        match port {
            465 => SecurityMode::ImplicitTls,
            587 => SecurityMode::StartTls,
            _ => SecurityMode::Plain,
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::Plain => write!(f, "plain"),
            SecurityMode::ImplicitTls => write!(f, "implicit-tls"),
            SecurityMode::StartTls => write!(f, "starttls"),
        }
    }
}

/// Per-message transport settings that replace the service defaults.
///
/// Every field is explicitly present or absent; an absent field falls back
/// to the service default when settings are resolved.
#[derive(Debug, Clone, Default)]
pub struct TransportOverrides {
    /// SMTP host.
    pub host: Option<String>,
    /// SMTP port.
    pub port: Option<u16>,
    /// Username.
    pub username: Option<String>,
    /// Password (protected).
    pub password: Option<SecretString>,
    /// Force implicit TLS regardless of port or defaults.
    pub force_ssl: bool,
    /// Force STARTTLS regardless of port or defaults.
    pub force_starttls: bool,
}

impl TransportOverrides {
    /// Returns true if nothing is overridden.
    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && !self.force_ssl
            && !self.force_starttls
    }
}

/// One queued outbound email. Immutable once built.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    to: Address,
    subject: String,
    body: String,
    overrides: TransportOverrides,
}

impl Message {
    /// Creates a message with an already-rendered HTML body.
    pub fn new(to: Address, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            to,
            subject: subject.into(),
            body: body.into(),
            overrides: TransportOverrides::default(),
        }
    }

    /// Attaches per-message transport overrides.
    pub fn with_overrides(mut self, overrides: TransportOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Identifier used to correlate log lines for this message.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Recipient.
    pub fn to(&self) -> &Address {
        &self.to
    }

    /// Subject line.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Rendered HTML body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Per-message transport overrides.
    pub fn overrides(&self) -> &TransportOverrides {
        &self.overrides
    }
}

/// SMTP envelope for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path (`MAIL FROM`). May be empty for the null sender.
    pub sender: String,
    /// Forward paths (`RCPT TO`), in order.
    pub recipients: Vec<String>,
}

/// What a connection test found out about the server.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode used.
    pub security_mode: SecurityMode,
    /// Whether the channel was encrypted when the test finished.
    pub encrypted: bool,
    /// Server greeting text.
    pub banner: String,
    /// Capabilities from the last EHLO.
    pub capabilities: Vec<String>,
    /// Whether credentials were sent and accepted.
    pub authenticated: bool,
}

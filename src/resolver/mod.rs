//! Per-attempt transport settings.
//!
//! Combines the service defaults with a message's overrides. Resolution is
//! pure and infallible; whether the result is usable is for the transport to
//! find out.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::auth::Credentials;
use crate::config::TransportDefaults;
use crate::types::{SecurityMode, TransportOverrides};

/// Settings for exactly one delivery attempt. Never stored.
#[derive(Clone)]
pub struct EffectiveTransportSettings {
    /// SMTP host; may be empty when nothing is configured.
    pub host: String,
    /// SMTP port; zero when nothing is configured.
    pub port: u16,
    /// Username; may be empty.
    pub username: String,
    /// Password; may be empty.
    pub password: SecretString,
    /// Security mode.
    pub security_mode: SecurityMode,
}

impl EffectiveTransportSettings {
    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns credentials when both username and password are non-empty.
    pub fn credentials(&self) -> Option<Credentials> {
        if self.username.is_empty() || self.password.expose_secret().is_empty() {
            return None;
        }
        Some(Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

impl fmt::Debug for EffectiveTransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveTransportSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("security_mode", &self.security_mode)
            .finish()
    }
}

/// Computes the settings for one attempt.
///
/// Each field takes the message override when present, the service default
/// otherwise. The security mode is decided in this order: a message forcing
/// SSL, a message forcing STARTTLS, the service default flags, and finally
/// the effective port.
pub fn resolve(
    defaults: &TransportDefaults,
    overrides: &TransportOverrides,
) -> EffectiveTransportSettings {
    let host = overrides
        .host
        .clone()
        .unwrap_or_else(|| defaults.host.clone());
    let port = overrides.port.or(defaults.port).unwrap_or(0);
    let username = overrides
        .username
        .clone()
        .unwrap_or_else(|| defaults.username.clone());
    let password = overrides
        .password
        .clone()
        .or_else(|| defaults.password.clone())
        .unwrap_or_else(|| SecretString::new(String::new()));

    EffectiveTransportSettings {
        host,
        port,
        username,
        password,
        security_mode: resolve_security_mode(defaults, overrides, port),
    }
}

fn resolve_security_mode(
    defaults: &TransportDefaults,
    overrides: &TransportOverrides,
    port: u16,
) -> SecurityMode {
    if overrides.force_ssl {
        SecurityMode::ImplicitTls
    } else if overrides.force_starttls {
        SecurityMode::StartTls
    } else if defaults.use_ssl {
        SecurityMode::ImplicitTls
    } else if defaults.use_tls {
        SecurityMode::StartTls
    } else {
        SecurityMode::for_port(port)
    }
}

/// Envelope sender: the configured sender, else the effective username.
pub fn sender_address(defaults: &TransportDefaults, settings: &EffectiveTransportSettings) -> String {
    if defaults.sender.is_empty() {
        settings.username.clone()
    } else {
        defaults.sender.clone()
    }
}

//! SMTP delivery client.
//!
//! [`MailTransport`] is the seam between the delivery workers and the
//! network. [`SmtpMailer`] is the real implementation: one connection per
//! attempt, driven through greeting, EHLO, optional STARTTLS, optional
//! authentication and a single mail transaction.
//!
//! In plain mode STARTTLS is still used whenever the server offers it, so
//! credentials travel encrypted on relays that listen on port 25 or 2525.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::ServiceConfig;
use crate::errors::{TransportError, TransportErrorKind, TransportResult};
use crate::mime::MimeEncoder;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::resolver::EffectiveTransportSettings;
use crate::transport::{ConnectOptions, SmtpConnection};
use crate::types::{ConnectionInfo, Envelope, SecurityMode};

/// Delivers framed messages to an SMTP server.
#[async_trait]
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Performs one delivery attempt. `raw` is the framed message as built by
    /// [`MimeEncoder::encode`]; dot-stuffing is the transport's job.
    async fn deliver(
        &self,
        settings: &EffectiveTransportSettings,
        envelope: &Envelope,
        raw: &[u8],
    ) -> TransportResult<()>;

    /// Opens a session up to and including authentication, then quits.
    async fn test_connection(
        &self,
        settings: &EffectiveTransportSettings,
    ) -> TransportResult<ConnectionInfo>;
}

/// Transport speaking SMTP over TCP, with optional TLS.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    client_id: String,
    options: ConnectOptions,
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl SmtpMailer {
    /// Creates a mailer announcing itself as `client_id` in EHLO.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            options: ConnectOptions::default(),
        }
    }

    /// Creates a mailer from the service configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.client_id()).with_timeouts(config.connect_timeout, config.command_timeout)
    }

    /// Sets the connect/handshake and per-command timeouts.
    pub fn with_timeouts(mut self, connect_timeout: Duration, command_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self.options.command_timeout = command_timeout;
        self
    }

    /// Replaces the TLS client configuration, for private CAs or pinned
    /// certificates. The default trusts the webpki root set.
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.options.tls_config = config;
        self
    }

    /// Returns the EHLO identity.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Brings a connection to the point where a transaction can start.
    async fn open_session(&self, settings: &EffectiveTransportSettings) -> TransportResult<Session> {
        let mut connection = match settings.security_mode {
            SecurityMode::ImplicitTls => {
                SmtpConnection::connect_tls(&settings.host, settings.port, &self.options).await?
            }
            SecurityMode::Plain | SecurityMode::StartTls => {
                SmtpConnection::connect(&settings.host, settings.port, &self.options).await?
            }
        };

        let greeting = connection
            .read_response()
            .await
            .map_err(|e| e.in_step(TransportErrorKind::ConnectFailed))?;
        if greeting.code != codes::SERVICE_READY {
            return Err(TransportError::from_response(TransportErrorKind::ConnectFailed, &greeting));
        }

        let mut capabilities = self.hello(&mut connection).await?;

        if wants_starttls(settings.security_mode, &capabilities) {
            let response = connection
                .send_command(&SmtpCommand::StartTls)
                .await
                .map_err(|e| e.in_step(TransportErrorKind::TlsHandshakeFailed))?;
            if response.code != codes::SERVICE_READY {
                return Err(TransportError::from_response(
                    TransportErrorKind::TlsHandshakeFailed,
                    &response,
                ));
            }

            connection = connection.upgrade_tls().await?;
            tracing::debug!(host = %settings.host, mode = %settings.security_mode, "Upgraded connection with STARTTLS");

            // Capabilities before the upgrade are not trustworthy.
            capabilities = self
                .hello(&mut connection)
                .await
                .map_err(|e| e.in_step(TransportErrorKind::TlsHandshakeFailed))?;
        }

        let mut authenticated = false;
        if let Some(credentials) = settings.credentials() {
            if !Authenticator::may_send_credentials(connection.is_encrypted(), &settings.host) {
                return Err(TransportError::auth(
                    "Refusing to send credentials over an unencrypted connection",
                ));
            }
            self.authenticate(&mut connection, &capabilities, &credentials)
                .await
                .map_err(|e| e.in_step(TransportErrorKind::AuthFailed))?;
            authenticated = true;
        }

        Ok(Session {
            connection,
            banner: greeting.full_message(),
            capabilities,
            authenticated,
        })
    }

    /// Sends EHLO, falling back to HELO.
    async fn hello(&self, connection: &mut SmtpConnection) -> TransportResult<EsmtpCapabilities> {
        let response = connection
            .send_command(&SmtpCommand::Ehlo(self.client_id.clone()))
            .await
            .map_err(|e| e.in_step(TransportErrorKind::ConnectFailed))?;

        if response.is_success() {
            return Ok(EsmtpCapabilities::from_ehlo_response(&response));
        }

        let response = connection
            .send_command(&SmtpCommand::Helo(self.client_id.clone()))
            .await
            .map_err(|e| e.in_step(TransportErrorKind::ConnectFailed))?;

        if !response.is_success() {
            return Err(TransportError::from_response(TransportErrorKind::ConnectFailed, &response));
        }

        Ok(EsmtpCapabilities::default())
    }

    async fn authenticate(
        &self,
        connection: &mut SmtpConnection,
        capabilities: &EsmtpCapabilities,
        credentials: &Credentials,
    ) -> TransportResult<()> {
        let advertised: Vec<AuthMethod> = capabilities.auth_mechanisms.iter().copied().collect();

        match Authenticator::select_method(&advertised) {
            AuthMethod::Plain => {
                let command = SmtpCommand::Auth {
                    mechanism: AuthMethod::Plain.mechanism_name().to_string(),
                    initial_response: Some(Authenticator::plain_initial_response(credentials)),
                };
                let response = connection.send_command(&command).await?;
                expect_code(&response, codes::AUTH_SUCCESS, TransportErrorKind::AuthFailed)
            }
            AuthMethod::Login => {
                let command = SmtpCommand::Auth {
                    mechanism: AuthMethod::Login.mechanism_name().to_string(),
                    initial_response: None,
                };
                let response = connection.send_command(&command).await?;
                expect_code(&response, codes::AUTH_CONTINUE, TransportErrorKind::AuthFailed)?;

                let response = send_line(connection, &Authenticator::login_username(credentials)).await?;
                expect_code(&response, codes::AUTH_CONTINUE, TransportErrorKind::AuthFailed)?;

                let response = send_line(connection, &Authenticator::login_password(credentials)).await?;
                expect_code(&response, codes::AUTH_SUCCESS, TransportErrorKind::AuthFailed)
            }
        }
    }

    /// Runs `MAIL FROM`, every `RCPT TO`, then `DATA`.
    async fn transaction(
        &self,
        connection: &mut SmtpConnection,
        envelope: &Envelope,
        raw: &[u8],
    ) -> TransportResult<()> {
        let response = connection
            .send_command(&SmtpCommand::MailFrom {
                address: envelope.sender.clone(),
            })
            .await
            .map_err(|e| e.in_step(TransportErrorKind::EnvelopeRejected))?;
        expect_success(&response, TransportErrorKind::EnvelopeRejected)?;

        for recipient in &envelope.recipients {
            let response = connection
                .send_command(&SmtpCommand::RcptTo {
                    address: recipient.clone(),
                })
                .await
                .map_err(|e| e.in_step(TransportErrorKind::EnvelopeRejected))?;
            expect_success(&response, TransportErrorKind::EnvelopeRejected)?;
        }

        let response = connection
            .send_command(&SmtpCommand::Data)
            .await
            .map_err(|e| e.in_step(TransportErrorKind::DataTransferFailed))?;
        expect_code(&response, codes::START_MAIL_INPUT, TransportErrorKind::DataTransferFailed)?;

        connection
            .send_data(&MimeEncoder::prepare_data_content(raw))
            .await
            .map_err(|e| e.in_step(TransportErrorKind::DataTransferFailed))?;

        let response = connection
            .read_response()
            .await
            .map_err(|e| e.in_step(TransportErrorKind::DataTransferFailed))?;
        expect_success(&response, TransportErrorKind::DataTransferFailed)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn deliver(
        &self,
        settings: &EffectiveTransportSettings,
        envelope: &Envelope,
        raw: &[u8],
    ) -> TransportResult<()> {
        let mut session = self.open_session(settings).await?;
        let result = self.transaction(&mut session.connection, envelope, raw).await;

        // A connection that failed below the protocol is not worth a QUIT.
        let replied = match &result {
            Ok(()) => true,
            Err(e) => e.smtp_code().is_some(),
        };
        if replied {
            session.connection.quit().await;
        }

        result
    }

    async fn test_connection(
        &self,
        settings: &EffectiveTransportSettings,
    ) -> TransportResult<ConnectionInfo> {
        let session = self.open_session(settings).await?;

        let info = ConnectionInfo {
            host: settings.host.clone(),
            port: settings.port,
            security_mode: settings.security_mode,
            encrypted: session.connection.is_encrypted(),
            banner: session.banner,
            capabilities: session.capabilities.raw,
            authenticated: session.authenticated,
        };

        session.connection.quit().await;
        Ok(info)
    }
}

/// An open, greeted and possibly authenticated connection.
struct Session {
    connection: SmtpConnection,
    banner: String,
    capabilities: EsmtpCapabilities,
    authenticated: bool,
}

/// STARTTLS mode always upgrades; plain mode upgrades when offered.
fn wants_starttls(mode: SecurityMode, capabilities: &EsmtpCapabilities) -> bool {
    match mode {
        SecurityMode::StartTls => true,
        SecurityMode::Plain => capabilities.starttls,
        SecurityMode::ImplicitTls => false,
    }
}

async fn send_line(connection: &mut SmtpConnection, line: &str) -> TransportResult<SmtpResponse> {
    connection.send_data(format!("{}\r\n", line).as_bytes()).await?;
    connection.read_response().await
}

fn expect_code(response: &SmtpResponse, code: u16, kind: TransportErrorKind) -> TransportResult<()> {
    if response.code == code {
        Ok(())
    } else {
        Err(TransportError::from_response(kind, response))
    }
}

fn expect_success(response: &SmtpResponse, kind: TransportErrorKind) -> TransportResult<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(TransportError::from_response(kind, response))
    }
}

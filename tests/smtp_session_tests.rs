//! Integration tests for the SMTP session against a scripted local server.

use std::sync::Arc;
use std::time::Duration;

use integrations_smtp_relay::config::TransportDefaults;
use integrations_smtp_relay::mime::MimeEncoder;
use integrations_smtp_relay::resolver::{self, EffectiveTransportSettings};
use integrations_smtp_relay::{
    Envelope, MailTransport, SecurityMode, SmtpMailer, TransportErrorKind, TransportOverrides,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Replies the fake server gives, per command.
#[derive(Debug, Clone)]
struct Script {
    greeting: &'static str,
    /// `None` makes the server refuse EHLO.
    ehlo: Option<Vec<&'static str>>,
    starttls: &'static str,
    auth: &'static str,
    mail: &'static str,
    rcpt: &'static str,
    data_end: &'static str,
    /// Hang up right after a STARTTLS handshake.
    close_after_tls: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: "220 fake.smtp ESMTP ready",
            ehlo: Some(vec!["AUTH PLAIN LOGIN", "8BITMIME"]),
            starttls: "454 TLS not available",
            auth: "235 2.7.0 Authentication successful",
            mail: "250 2.1.0 OK",
            rcpt: "250 2.1.5 OK",
            data_end: "250 2.0.0 Queued as ABC123",
            close_after_tls: false,
        }
    }
}

/// How the fake server uses TLS.
#[derive(Clone)]
enum ServerTls {
    None,
    StartTls(TlsAcceptor),
    Implicit(TlsAcceptor),
}

trait ServerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ServerStream for T {}

/// What the server saw.
#[derive(Debug, Default)]
struct Transcript {
    commands: Vec<String>,
    data: String,
    /// Index of the first command received over TLS.
    tls_from: Option<usize>,
}

impl Transcript {
    fn has_command(&self, prefix: &str) -> bool {
        self.commands.iter().any(|c| c.starts_with(prefix))
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.starts_with(prefix))
    }

    fn received_encrypted(&self, prefix: &str) -> bool {
        match (self.position(prefix), self.tls_from) {
            (Some(at), Some(from)) => at >= from,
            _ => false,
        }
    }
}

async fn spawn_server(script: Script) -> (u16, JoinHandle<Transcript>) {
    spawn_tls_server(script, ServerTls::None).await
}

async fn spawn_tls_server(script: Script, tls: ServerTls) -> (u16, JoinHandle<Transcript>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut transcript = Transcript::default();
        let mut login_step = 0;

        let stream: Box<dyn ServerStream> = match &tls {
            ServerTls::Implicit(acceptor) => match acceptor.accept(tcp).await {
                Ok(secured) => {
                    transcript.tls_from = Some(0);
                    let secured: Box<dyn ServerStream> = Box::new(secured);
                    secured
                }
                Err(_) => return transcript,
            },
            ServerTls::None | ServerTls::StartTls(_) => {
                let plain: Box<dyn ServerStream> = Box::new(tcp);
                plain
            }
        };
        let mut conn = BufReader::new(stream);

        conn.write_all(format!("{}\r\n", script.greeting).as_bytes())
            .await
            .unwrap();

        loop {
            let mut line = String::new();
            if conn.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let upper = line.to_uppercase();
            transcript.commands.push(line);

            let reply = if login_step == 1 {
                login_step = 2;
                "334 UGFzc3dvcmQ6".to_string()
            } else if login_step == 2 {
                login_step = 0;
                script.auth.to_string()
            } else if upper.starts_with("EHLO") {
                match &script.ehlo {
                    Some(caps) if caps.is_empty() => "250 fake.smtp".to_string(),
                    Some(caps) => {
                        let mut lines = vec!["250-fake.smtp".to_string()];
                        for (i, cap) in caps.iter().enumerate() {
                            let sep = if i + 1 == caps.len() { ' ' } else { '-' };
                            lines.push(format!("250{}{}", sep, cap));
                        }
                        lines.join("\r\n")
                    }
                    None => "502 5.5.1 Command not implemented".to_string(),
                }
            } else if upper.starts_with("HELO") {
                "250 fake.smtp".to_string()
            } else if upper == "STARTTLS" {
                match &tls {
                    ServerTls::StartTls(acceptor) => {
                        conn.write_all(b"220 2.0.0 Ready to start TLS\r\n").await.unwrap();
                        let secured = match acceptor.accept(conn.into_inner()).await {
                            Ok(secured) => secured,
                            Err(_) => return transcript,
                        };
                        if script.close_after_tls {
                            return transcript;
                        }
                        let secured: Box<dyn ServerStream> = Box::new(secured);
                        conn = BufReader::new(secured);
                        transcript.tls_from = Some(transcript.commands.len());
                        continue;
                    }
                    ServerTls::None | ServerTls::Implicit(_) => script.starttls.to_string(),
                }
            } else if upper == "AUTH LOGIN" {
                login_step = 1;
                "334 VXNlcm5hbWU6".to_string()
            } else if upper.starts_with("AUTH") {
                script.auth.to_string()
            } else if upper.starts_with("MAIL FROM") {
                script.mail.to_string()
            } else if upper.starts_with("RCPT TO") {
                script.rcpt.to_string()
            } else if upper == "DATA" {
                conn.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await.unwrap();
                let mut lines = Vec::new();
                loop {
                    let mut data_line = String::new();
                    if conn.read_line(&mut data_line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    let data_line = data_line.trim_end_matches(['\r', '\n']).to_string();
                    if data_line == "." {
                        break;
                    }
                    lines.push(data_line);
                }
                transcript.data = lines.join("\r\n");
                script.data_end.to_string()
            } else if upper == "QUIT" {
                let _ = conn.write_all(b"221 2.0.0 Bye\r\n").await;
                let _ = conn.shutdown().await;
                break;
            } else {
                "500 5.5.2 Unknown command".to_string()
            };

            if conn.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }

        transcript
    });

    (port, handle)
}

/// Self-signed certificate for `localhost`, as server acceptor and as the
/// only root a client trusts.
struct TestPki {
    acceptor: TlsAcceptor,
    client_config: Arc<rustls::ClientConfig>,
}

fn test_pki() -> TestPki {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TestPki {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        client_config: Arc::new(client_config),
    }
}

fn mailer() -> SmtpMailer {
    SmtpMailer::new("test.client").with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
}

fn settings(port: u16, with_credentials: bool, overrides: TransportOverrides) -> EffectiveTransportSettings {
    settings_for("127.0.0.1", port, with_credentials, overrides)
}

fn settings_for(
    host: &str,
    port: u16,
    with_credentials: bool,
    overrides: TransportOverrides,
) -> EffectiveTransportSettings {
    let mut defaults = TransportDefaults {
        host: host.to_string(),
        port: Some(port),
        ..Default::default()
    };
    if with_credentials {
        defaults.username = "relay@example.com".to_string();
        defaults.password = Some(SecretString::new("secret".to_string()));
    }
    resolver::resolve(&defaults, &overrides)
}

fn envelope() -> Envelope {
    Envelope {
        sender: "noreply@example.com".to_string(),
        recipients: vec!["a@x.com".to_string()],
    }
}

fn raw_message(body: &str) -> Vec<u8> {
    MimeEncoder::encode("noreply@example.com", "a@x.com", "Hi", body)
}

#[tokio::test]
async fn test_plain_delivery_transcript() {
    // Arrange
    let (port, server) = spawn_server(Script::default()).await;
    let settings = settings(port, true, TransportOverrides::default());
    assert_eq!(settings.security_mode, SecurityMode::Plain);

    // Act
    let result = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>one</p>\r\n.hidden\r\n"))
        .await;

    // Assert
    assert!(result.is_ok(), "delivery failed: {:?}", result);
    let transcript = server.await.unwrap();

    assert_eq!(transcript.commands[0], "EHLO test.client");
    assert!(transcript.commands[1].starts_with("AUTH PLAIN "));
    assert_eq!(transcript.commands[2], "MAIL FROM:<noreply@example.com>");
    assert_eq!(transcript.commands[3], "RCPT TO:<a@x.com>");
    assert_eq!(transcript.commands[4], "DATA");
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");

    assert!(transcript.data.starts_with("From: noreply@example.com\r\n"));
    assert!(transcript.data.contains("Content-Type: text/html; charset=\"UTF-8\""));
    assert!(transcript.data.contains("\r\n..hidden"));
}

#[tokio::test]
async fn test_no_credentials_skips_auth() {
    let (port, server) = spawn_server(Script::default()).await;
    let settings = settings(port, false, TransportOverrides::default());

    mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap();

    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("AUTH"));
    assert!(transcript.has_command("MAIL FROM"));
}

#[tokio::test]
async fn test_helo_fallback_when_ehlo_refused() {
    let script = Script {
        ehlo: None,
        ..Default::default()
    };
    let (port, server) = spawn_server(script).await;
    let settings = settings(port, true, TransportOverrides::default());

    mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap();

    let transcript = server.await.unwrap();
    assert_eq!(transcript.commands[1], "HELO test.client");
    // Nothing advertised: PLAIN is used.
    assert!(transcript.commands[2].starts_with("AUTH PLAIN "));
}

#[tokio::test]
async fn test_login_used_when_only_login_advertised() {
    let script = Script {
        ehlo: Some(vec!["AUTH LOGIN"]),
        ..Default::default()
    };
    let (port, server) = spawn_server(script).await;
    let settings = settings(port, true, TransportOverrides::default());

    mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap();

    let transcript = server.await.unwrap();
    assert_eq!(transcript.commands[1], "AUTH LOGIN");
    // base64("relay@example.com") and base64("secret")
    assert_eq!(transcript.commands[2], "cmVsYXlAZXhhbXBsZS5jb20=");
    assert_eq!(transcript.commands[3], "c2VjcmV0");
}

#[tokio::test]
async fn test_auth_rejected() {
    let script = Script {
        auth: "535 5.7.8 Authentication credentials invalid",
        ..Default::default()
    };
    let (port, _server) = spawn_server(script).await;
    let settings = settings(port, true, TransportOverrides::default());

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::AuthFailed);
    assert_eq!(err.smtp_code(), Some(535));
}

#[tokio::test]
async fn test_recipient_rejected() {
    let script = Script {
        rcpt: "550 5.1.1 No such user",
        ..Default::default()
    };
    let (port, server) = spawn_server(script).await;
    let settings = settings(port, false, TransportOverrides::default());

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::EnvelopeRejected);
    assert_eq!(err.smtp_code(), Some(550));

    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("DATA"));
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_message_rejected_after_data() {
    let script = Script {
        data_end: "554 5.6.0 Message rejected",
        ..Default::default()
    };
    let (port, _server) = spawn_server(script).await;
    let settings = settings(port, false, TransportOverrides::default());

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::DataTransferFailed);
    assert_eq!(err.smtp_code(), Some(554));
}

#[tokio::test]
async fn test_starttls_refused() {
    let (port, server) = spawn_server(Script::default()).await;
    let overrides = TransportOverrides {
        force_starttls: true,
        ..Default::default()
    };
    let settings = settings(port, true, overrides);
    assert_eq!(settings.security_mode, SecurityMode::StartTls);

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::TlsHandshakeFailed);
    assert_eq!(err.smtp_code(), Some(454));

    drop(err);
    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("AUTH"), "credentials must not be sent");
}

#[tokio::test]
async fn test_implicit_tls_against_plain_server() {
    // A server that never speaks TLS.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = stream.write_all(b"220 fake.smtp ESMTP ready\r\n").await;
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });

    let overrides = TransportOverrides {
        force_ssl: true,
        ..Default::default()
    };
    let settings = settings(port, false, overrides);
    assert_eq!(settings.security_mode, SecurityMode::ImplicitTls);

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::TlsHandshakeFailed);
    server.abort();
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let settings = settings(port, false, TransportOverrides::default());
    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::ConnectFailed);
}

#[tokio::test]
async fn test_bad_greeting() {
    let script = Script {
        greeting: "554 5.3.2 Not accepting mail",
        ..Default::default()
    };
    let (port, _server) = spawn_server(script).await;
    let settings = settings(port, false, TransportOverrides::default());

    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::ConnectFailed);
    assert_eq!(err.smtp_code(), Some(554));
}

#[tokio::test]
async fn test_connection_reports_server() {
    let (port, server) = spawn_server(Script::default()).await;
    let settings = settings(port, true, TransportOverrides::default());

    let info = mailer().test_connection(&settings).await.unwrap();

    assert_eq!(info.host, "127.0.0.1");
    assert_eq!(info.port, port);
    assert_eq!(info.security_mode, SecurityMode::Plain);
    assert!(!info.encrypted);
    assert!(info.authenticated);
    assert_eq!(info.banner, "fake.smtp ESMTP ready");
    assert!(info.capabilities.contains(&"AUTH PLAIN LOGIN".to_string()));

    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("MAIL FROM"));
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

fn tls_mailer(pki: &TestPki) -> SmtpMailer {
    mailer().with_tls_config(Arc::clone(&pki.client_config))
}

fn starttls_script() -> Script {
    Script {
        ehlo: Some(vec!["STARTTLS", "AUTH PLAIN LOGIN"]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_plain_mode_upgrades_when_starttls_offered() {
    // Arrange
    let pki = test_pki();
    let (port, server) = spawn_tls_server(starttls_script(), ServerTls::StartTls(pki.acceptor.clone())).await;
    let settings = settings_for("localhost", port, true, TransportOverrides::default());
    assert_eq!(settings.security_mode, SecurityMode::Plain);

    // Act
    let result = tls_mailer(&pki)
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await;

    // Assert
    assert!(result.is_ok(), "delivery failed: {:?}", result);
    let transcript = server.await.unwrap();

    assert_eq!(transcript.commands[0], "EHLO test.client");
    assert_eq!(transcript.commands[1], "STARTTLS");
    assert_eq!(transcript.tls_from, Some(2));
    assert_eq!(transcript.commands[2], "EHLO test.client");
    assert!(transcript.commands[3].starts_with("AUTH PLAIN "));
    assert!(transcript.received_encrypted("AUTH"));
    assert!(transcript.received_encrypted("DATA"));
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_plain_mode_without_starttls_offer_stays_cleartext() {
    let pki = test_pki();
    let (port, server) = spawn_tls_server(Script::default(), ServerTls::StartTls(pki.acceptor.clone())).await;
    let settings = settings_for("localhost", port, false, TransportOverrides::default());

    let info = tls_mailer(&pki).test_connection(&settings).await.unwrap();

    assert!(!info.encrypted);
    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("STARTTLS"));
    assert_eq!(transcript.tls_from, None);
}

#[tokio::test]
async fn test_starttls_session_authenticates_after_upgrade() {
    // Arrange
    let pki = test_pki();
    let (port, server) = spawn_tls_server(starttls_script(), ServerTls::StartTls(pki.acceptor.clone())).await;
    let overrides = TransportOverrides {
        force_starttls: true,
        ..Default::default()
    };
    let settings = settings_for("localhost", port, true, overrides);
    assert_eq!(settings.security_mode, SecurityMode::StartTls);

    // Act
    let info = tls_mailer(&pki).test_connection(&settings).await.unwrap();

    // Assert
    assert_eq!(info.security_mode, SecurityMode::StartTls);
    assert!(info.encrypted);
    assert!(info.authenticated);
    assert!(info.capabilities.contains(&"STARTTLS".to_string()));

    let transcript = server.await.unwrap();
    assert_eq!(transcript.commands[1], "STARTTLS");
    assert_eq!(transcript.tls_from, Some(2));
    assert_eq!(transcript.commands[2], "EHLO test.client");
    assert!(transcript.received_encrypted("AUTH PLAIN"));
}

#[tokio::test]
async fn test_starttls_with_untrusted_certificate() {
    let pki = test_pki();
    let (port, server) = spawn_tls_server(starttls_script(), ServerTls::StartTls(pki.acceptor.clone())).await;
    let overrides = TransportOverrides {
        force_starttls: true,
        ..Default::default()
    };
    let settings = settings_for("localhost", port, true, overrides);

    // The default mailer only trusts public roots.
    let err = mailer()
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::TlsHandshakeFailed);
    let transcript = server.await.unwrap();
    assert!(!transcript.has_command("AUTH"), "credentials must not be sent");
}

#[tokio::test]
async fn test_starttls_failure_after_handshake_is_tls_error() {
    let pki = test_pki();
    let script = Script {
        close_after_tls: true,
        ..starttls_script()
    };
    let (port, _server) = spawn_tls_server(script, ServerTls::StartTls(pki.acceptor.clone())).await;
    let overrides = TransportOverrides {
        force_starttls: true,
        ..Default::default()
    };
    let settings = settings_for("localhost", port, false, overrides);

    let err = tls_mailer(&pki)
        .deliver(&settings, &envelope(), &raw_message("<p>ok</p>"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), TransportErrorKind::TlsHandshakeFailed);
}

#[tokio::test]
async fn test_implicit_tls_delivery() {
    // Arrange
    let pki = test_pki();
    let (port, server) = spawn_tls_server(Script::default(), ServerTls::Implicit(pki.acceptor.clone())).await;
    let overrides = TransportOverrides {
        force_ssl: true,
        ..Default::default()
    };
    let settings = settings_for("localhost", port, true, overrides);
    assert_eq!(settings.security_mode, SecurityMode::ImplicitTls);

    // Act
    let result = tls_mailer(&pki)
        .deliver(&settings, &envelope(), &raw_message("<p>secret body</p>"))
        .await;

    // Assert
    assert!(result.is_ok(), "delivery failed: {:?}", result);
    let transcript = server.await.unwrap();

    assert_eq!(transcript.tls_from, Some(0));
    assert_eq!(transcript.commands[0], "EHLO test.client");
    assert!(!transcript.has_command("STARTTLS"));
    assert!(transcript.commands[1].starts_with("AUTH PLAIN "));
    assert!(transcript.data.ends_with("<p>secret body</p>"));
    assert_eq!(transcript.commands.last().unwrap(), "QUIT");
}

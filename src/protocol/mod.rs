//! SMTP protocol primitives.
//!
//! Commands and replies for the client side of RFC 5321, plus the subset of
//! ESMTP capabilities the relay acts on.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;

/// SMTP commands issued by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Reverse path, without angle brackets.
        address: String,
    },
    /// RCPT TO command.
    RcptTo {
        /// Forward path, without angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// No operation.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom { address } => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never echo credentials into logs.
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {} ***", mechanism),
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

/// SMTP reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Reply code (e.g., 220, 250, 354, 550).
    pub code: u16,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

/// Error produced when reply lines cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyParseError(pub String);

impl fmt::Display for ReplyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed SMTP reply: {}", self.0)
    }
}

impl std::error::Error for ReplyParseError {}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from its raw lines (CRLF already stripped).
    pub fn parse(lines: &[String]) -> Result<Self, ReplyParseError> {
        if lines.is_empty() {
            return Err(ReplyParseError("empty reply".to_string()));
        }

        let mut code = 0u16;
        let mut message = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| ReplyParseError(line.clone()))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(ReplyParseError(
                    "inconsistent codes in multiline reply".to_string(),
                ));
            }

            message.push(line.get(4..).unwrap_or("").to_string());
        }

        Ok(Self { code, message })
    }

    /// Returns true if a reply line continues (`250-...`).
    pub fn is_continuation(line: &str) -> bool {
        line.as_bytes().get(3) == Some(&b'-')
    }

    /// Returns true for 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP capabilities advertised in an EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Advertised authentication mechanisms the relay understands.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS offered.
    pub starttls: bool,
    /// Raw capability lines (greeting line excluded).
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the
    /// server's greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let mut parts = line.splitn(2, [' ', '=']);
            let capability = parts.next().unwrap_or("");
            let params = parts.next().unwrap_or("");

            match capability {
                "AUTH" => {
                    caps.auth_mechanisms
                        .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
                }
                "STARTTLS" => caps.starttls = true,
                _ => {}
            }
            caps.raw.push(line);
        }

        caps
    }
}

/// Reply codes the relay checks for explicitly.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

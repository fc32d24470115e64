//! # SMTP Relay
//!
//! Queued outbound email delivery:
//! - A bounded in-memory queue that never blocks producers
//! - A fixed pool of delivery workers with graceful drain on shutdown
//! - Per-message SMTP server and credential overrides
//! - Plain, implicit TLS and STARTTLS transports
//! - An HTTP front end rendering HTML templates into queued messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use integrations_smtp_relay::{Address, MailService, Message, ServiceConfig, SmtpMailer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let transport = Arc::new(SmtpMailer::from_config(&config));
//!     let service = MailService::new(config, transport)?;
//!
//!     let to = Address::parse("recipient@example.com")?;
//!     service.enqueue(Message::new(to, "Hello", "<p>Hello from Rust!</p>"))?;
//!
//!     // Delivers everything queued so far, then returns.
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Message framing
pub mod mime;

// Delivery
pub mod client;
pub mod resolver;
pub mod queue;
pub mod service;

// HTTP boundary
pub mod api;
pub mod template;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use client::{MailTransport, SmtpMailer};
pub use config::{HttpConfig, ServiceConfig, ServiceConfigBuilder, TransportDefaults};
pub use errors::{
    AddressError, ConfigError, QueueError, TemplateError, TransportError, TransportErrorKind,
    TransportResult,
};
pub use observability::{DeliveryMetrics, LoggingConfig, MetricsSnapshot};
pub use queue::QueueHandle;
pub use resolver::EffectiveTransportSettings;
pub use service::MailService;
pub use types::{Address, ConnectionInfo, Envelope, Message, SecurityMode, TransportOverrides};

//! Mock implementations for testing.
//!
//! [`MockTransport`] stands in for the SMTP transport: it records every
//! attempt, can fail every attempt with a chosen error kind, and can hold
//! workers inside `deliver` until a test releases them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::client::MailTransport;
use crate::errors::{AddressError, TransportError, TransportErrorKind, TransportResult};
use crate::resolver::EffectiveTransportSettings;
use crate::types::{Address, ConnectionInfo, Envelope, Message, SecurityMode};

/// One attempt seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    /// Resolved host.
    pub host: String,
    /// Resolved port.
    pub port: u16,
    /// Resolved username.
    pub username: String,
    /// Resolved security mode.
    pub security_mode: SecurityMode,
    /// Envelope handed to the transport.
    pub envelope: Envelope,
    /// Framed message.
    pub raw: Vec<u8>,
}

/// Mock mail transport.
#[derive(Debug, Default)]
pub struct MockTransport {
    /// Successful deliveries.
    deliveries: Arc<Mutex<Vec<RecordedDelivery>>>,
    /// Attempts, successful or not.
    attempts: AtomicUsize,
    /// Connection tests run.
    connection_tests: AtomicUsize,
    /// Fail every attempt with this kind.
    failure: Mutex<Option<TransportErrorKind>>,
    /// Simulated network time per attempt.
    delay: Option<Duration>,
    /// When set, every attempt waits for a permit.
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    /// Creates a mock that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that fails every attempt with `kind`.
    pub fn failing(kind: TransportErrorKind) -> Self {
        let mock = Self::new();
        mock.fail_with(Some(kind));
        mock
    }

    /// Creates a mock whose attempts block until [`release`](Self::release)
    /// or [`open`](Self::open) is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Adds simulated latency to every attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets or clears the failure mode.
    pub fn fail_with(&self, kind: Option<TransportErrorKind>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = kind;
    }

    /// Lets `count` held attempts proceed.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Lets every current and future attempt proceed.
    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.close();
        }
    }

    /// Returns the successful deliveries in completion order.
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful deliveries.
    pub fn delivered_count(&self) -> usize {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of attempts started, including failed and held ones.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of connection tests run.
    pub fn connection_test_count(&self) -> usize {
        self.connection_tests.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` attempts have started.
    pub async fn wait_for_attempts(&self, count: usize) {
        while self.attempt_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn configured_failure(&self) -> Option<TransportError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|kind| TransportError::new(kind, "simulated failure"))
    }

    async fn wait_turn(&self) {
        if let Some(gate) = &self.gate {
            // A closed gate means the mock was opened for good.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn deliver(
        &self,
        settings: &EffectiveTransportSettings,
        envelope: &Envelope,
        raw: &[u8],
    ) -> TransportResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.wait_turn().await;

        if let Some(error) = self.configured_failure() {
            return Err(error);
        }

        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedDelivery {
                host: settings.host.clone(),
                port: settings.port,
                username: settings.username.clone(),
                security_mode: settings.security_mode,
                envelope: envelope.clone(),
                raw: raw.to_vec(),
            });

        Ok(())
    }

    async fn test_connection(
        &self,
        settings: &EffectiveTransportSettings,
    ) -> TransportResult<ConnectionInfo> {
        self.connection_tests.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.configured_failure() {
            return Err(error);
        }

        Ok(ConnectionInfo {
            host: settings.host.clone(),
            port: settings.port,
            security_mode: settings.security_mode,
            encrypted: settings.security_mode != SecurityMode::Plain,
            banner: "mock.smtp ESMTP ready".to_string(),
            capabilities: vec!["AUTH PLAIN LOGIN".to_string()],
            authenticated: settings.credentials().is_some(),
        })
    }
}

/// Creates a message to `user{n}@example.com` with a numbered subject.
pub fn test_message(n: usize) -> Result<Message, AddressError> {
    let to = Address::parse(&format!("user{}@example.com", n))?;
    Ok(Message::new(to, format!("Test message {}", n), format!("<p>Body {}</p>", n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportDefaults;
    use crate::resolver;
    use crate::types::TransportOverrides;

    fn settings() -> EffectiveTransportSettings {
        let defaults = TransportDefaults {
            host: "smtp.example.com".to_string(),
            port: Some(25),
            ..Default::default()
        };
        resolver::resolve(&defaults, &TransportOverrides::default())
    }

    fn envelope() -> Envelope {
        Envelope {
            sender: "s@example.com".to_string(),
            recipients: vec!["a@example.com".to_string()],
        }
    }

    #[tokio::test]
    async fn test_records_deliveries() {
        let mock = MockTransport::new();
        mock.deliver(&settings(), &envelope(), b"raw").await.unwrap();

        assert_eq!(mock.delivered_count(), 1);
        assert_eq!(mock.attempt_count(), 1);
        assert_eq!(mock.deliveries()[0].raw, b"raw");
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let mock = MockTransport::failing(TransportErrorKind::AuthFailed);
        let err = mock.deliver(&settings(), &envelope(), b"raw").await.unwrap_err();

        assert_eq!(err.kind(), TransportErrorKind::AuthFailed);
        assert_eq!(mock.delivered_count(), 0);
        assert_eq!(mock.attempt_count(), 1);

        mock.fail_with(None);
        assert!(mock.deliver(&settings(), &envelope(), b"raw").await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_holds_until_released() {
        let mock = Arc::new(MockTransport::gated());

        let task = {
            let mock = Arc::clone(&mock);
            tokio::spawn(async move { mock.deliver(&settings(), &envelope(), b"raw").await })
        };

        mock.wait_for_attempts(1).await;
        assert_eq!(mock.delivered_count(), 0);

        mock.release(1);
        task.await.unwrap().unwrap();
        assert_eq!(mock.delivered_count(), 1);
    }

    #[test]
    fn test_message_helper() {
        let message = test_message(7).unwrap();
        assert_eq!(message.to().as_str(), "user7@example.com");
        assert_eq!(message.subject(), "Test message 7");
    }
}

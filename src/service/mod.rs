//! Delivery service: the queue, the worker pool and their lifecycle.
//!
//! A [`MailService`] is constructed once, handed [`QueueHandle`]s to
//! whoever produces mail, and torn down with [`MailService::stop`], which
//! delivers everything already buffered before it returns.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::MailTransport;
use crate::config::ServiceConfig;
use crate::errors::{ConfigError, QueueError, TransportResult};
use crate::mime::MimeEncoder;
use crate::observability::{DeliveryMetrics, MetricsSnapshot};
use crate::queue::{self, QueueHandle, QueueReceiver};
use crate::resolver;
use crate::types::{ConnectionInfo, Envelope, Message, TransportOverrides};

/// Owner of the delivery queue and the worker pool.
///
/// Must be created inside a Tokio runtime. Dropping the service without
/// calling [`stop`](Self::stop) leaves the workers running for as long as
/// some [`QueueHandle`] is alive.
#[derive(Debug)]
pub struct MailService {
    config: Arc<ServiceConfig>,
    transport: Arc<dyn MailTransport>,
    queue: QueueHandle,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    metrics: Arc<DeliveryMetrics>,
}

impl MailService {
    /// Validates the configuration, creates the queue and starts
    /// `config.worker_count` workers.
    pub fn new(config: ServiceConfig, transport: Arc<dyn MailTransport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(DeliveryMetrics::new());
        let (queue, receiver) = queue::bounded(config.queue_capacity, shutdown.clone(), Arc::clone(&metrics));

        let workers = (0..config.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    receiver: receiver.clone(),
                    shutdown: shutdown.clone(),
                    transport: Arc::clone(&transport),
                    config: Arc::clone(&config),
                    metrics: Arc::clone(&metrics),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "Email service started"
        );

        Ok(Self {
            config,
            transport,
            queue,
            shutdown,
            workers,
            metrics,
        })
    }

    /// Offers a message for delivery without waiting.
    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        self.queue.enqueue(message)
    }

    /// Returns a producer handle for the queue.
    pub fn handle(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Delivery counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of workers started.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The configuration the service runs with.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Runs the connection handshake and authentication against the server
    /// the given overrides resolve to, without sending any mail.
    pub async fn test_connection(&self, overrides: &TransportOverrides) -> TransportResult<ConnectionInfo> {
        let settings = resolver::resolve(&self.config.defaults, overrides);
        self.transport.test_connection(&settings).await
    }

    /// Shuts the service down.
    ///
    /// Signals cancellation, closes the queue so further enqueues fail with
    /// [`QueueError::Stopping`], then waits for every worker. Workers deliver
    /// all buffered messages before they exit.
    pub async fn stop(self) {
        tracing::info!(pending = self.queue.len(), "Stopping email service");

        self.shutdown.cancel();
        self.queue.close();

        for result in join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Email worker terminated abnormally");
            }
        }

        let metrics = self.metrics.snapshot();
        tracing::info!(
            delivered = metrics.delivered,
            failed = metrics.failed,
            "Email service stopped"
        );
    }
}

/// One delivery loop.
struct Worker {
    id: usize,
    receiver: QueueReceiver,
    shutdown: CancellationToken,
    transport: Arc<dyn MailTransport>,
    config: Arc<ServiceConfig>,
    metrics: Arc<DeliveryMetrics>,
}

impl Worker {
    async fn run(self) {
        tracing::info!(worker_id = self.id, "Email worker started");

        loop {
            tokio::select! {
                biased;

                message = self.receiver.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => {
                        tracing::info!(worker_id = self.id, "Email worker stopped: queue closed");
                        return;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Cancellation only ends waiting; buffered messages still go out.
        while let Some(message) = self.receiver.recv().await {
            self.process(message).await;
        }
        tracing::info!(worker_id = self.id, "Email worker stopped: shutdown");
    }

    async fn process(&self, message: Message) {
        let settings = resolver::resolve(&self.config.defaults, message.overrides());
        let sender = resolver::sender_address(&self.config.defaults, &settings);

        let raw = MimeEncoder::encode(&sender, message.to().as_str(), message.subject(), message.body());
        let envelope = Envelope {
            sender,
            recipients: vec![message.to().to_string()],
        };

        match self.transport.deliver(&settings, &envelope, &raw).await {
            Ok(()) => {
                self.metrics.record_delivery(true);
                tracing::info!(
                    worker_id = self.id,
                    message_id = %message.id(),
                    recipient = %message.to(),
                    "Email sent successfully"
                );
            }
            Err(e) => {
                self.metrics.record_delivery(false);
                tracing::error!(
                    worker_id = self.id,
                    message_id = %message.id(),
                    recipient = %message.to(),
                    subject = %message.subject(),
                    host = %settings.host,
                    port = settings.port,
                    username = %settings.username,
                    mode = %settings.security_mode,
                    step = e.kind().step(),
                    smtp_code = ?e.smtp_code(),
                    error = %e,
                    timestamp = %Utc::now().to_rfc3339(),
                    "Failed to send email"
                );
            }
        }
    }
}

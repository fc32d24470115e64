//! Email relay server.
//!
//! Reads its configuration from the environment (seeded from `.env` outside
//! production), serves `/send` and drains the delivery queue on Ctrl-C or
//! SIGTERM.

use std::sync::Arc;

use integrations_smtp_relay::{api, config};
use integrations_smtp_relay::{HttpConfig, LoggingConfig, MailService, ServiceConfig, SmtpMailer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Before logging, so LOG_LEVEL and LOG_FORMAT may come from the file.
    let env_file = config::load_env_file()?;
    LoggingConfig::from_env()?.init()?;

    match env_file {
        Some(path) => tracing::info!(path = %path.display(), "Loaded environment file"),
        None => tracing::debug!("No environment file loaded"),
    }

    let config = ServiceConfig::from_env()?;
    let http = HttpConfig::from_env()?;

    if config.defaults.host.is_empty() {
        tracing::warn!("SMTP_HOST is not set; every message must carry its own smtp_server");
    }

    let transport = Arc::new(SmtpMailer::from_config(&config));
    let service = MailService::new(config, transport)?;

    let app = api::router(service.handle());
    let listener = tokio::net::TcpListener::bind(http.bind_address()).await?;
    tracing::info!(address = %listener.local_addr()?, "Email relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining the delivery queue");
    service.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! HTTP boundary.
//!
//! `POST /send` renders a caller-supplied template and queues the result;
//! `GET /send` queues a fixed notification. Both answer `202 Accepted` as
//! soon as the message is in the queue.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::errors::{QueueError, TemplateError};
use crate::queue::QueueHandle;
use crate::template::{self, Placeholder, PlaceholderValue, TemplateData};
use crate::types::{Address, Message, TransportOverrides};

/// Subject used when a POST request has none.
pub const DEFAULT_SUBJECT: &str = "Email Notification";

/// Body template for GET requests.
pub const GET_TEMPLATE: &str = "<h1>Hello!</h1><p>This is a default email for {{ slug }}.</p>";

/// Builds the router. All handlers share the given queue handle.
pub fn router(queue: QueueHandle) -> Router {
    Router::new()
        .route("/send", get(get_send).post(post_send))
        .with_state(queue)
}

/// JSON body of `POST /send`.
#[derive(Debug, Deserialize)]
pub struct SendEmailRequest {
    /// Recipient address.
    #[serde(default)]
    pub to: String,
    /// Subject; defaults to [`DEFAULT_SUBJECT`].
    #[serde(default)]
    pub subject: String,
    /// HTML template.
    #[serde(default)]
    pub template: String,
    /// Template values.
    #[serde(default)]
    pub placeholders: Option<Vec<Placeholder>>,
    /// SMTP host override.
    pub smtp_server: Option<String>,
    /// SMTP port override.
    pub smtp_port: Option<u16>,
    /// SMTP username override.
    pub smtp_username: Option<String>,
    /// SMTP password override.
    pub smtp_password: Option<SecretString>,
    /// Force implicit TLS.
    #[serde(default)]
    pub use_ssl: bool,
    /// Force STARTTLS.
    #[serde(default)]
    pub use_tls: bool,
}

impl SendEmailRequest {
    /// Per-message overrides. Empty strings and a zero port count as absent.
    pub fn overrides(&self) -> TransportOverrides {
        TransportOverrides {
            host: non_empty(&self.smtp_server),
            port: self.smtp_port.filter(|port| *port != 0),
            username: non_empty(&self.smtp_username),
            password: self
                .smtp_password
                .as_ref()
                .filter(|password| !password.expose_secret().is_empty())
                .cloned(),
            force_ssl: self.use_ssl,
            force_starttls: self.use_tls,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Query of `GET /send`.
#[derive(Debug, Deserialize)]
pub struct SendEmailQuery {
    /// Recipient address.
    pub to: Option<String>,
    /// Subject; defaults to `Notification for <slug>`.
    pub subject: Option<String>,
    /// Name substituted into the fixed template.
    pub slug: Option<String>,
    /// JSON object of extra template values.
    pub data: Option<String>,
}

/// Errors returned to HTTP callers.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request itself is unusable.
    #[error("{0}")]
    BadRequest(String),
    /// The template did not render.
    #[error(transparent)]
    Render(#[from] TemplateError),
    /// The queue refused the message.
    #[error("failed to queue email: {0}")]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn post_send(
    State(queue): State<QueueHandle>,
    payload: Result<Json<SendEmailRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| {
        tracing::debug!(error = %e, "Rejected request body");
        ApiError::BadRequest("Invalid request body".to_string())
    })?;

    if request.to.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing 'to' field".to_string()));
    }
    if request.template.is_empty() {
        return Err(ApiError::BadRequest("Missing 'template' field (HTML content)".to_string()));
    }

    let to = parse_recipient(&request.to)?;
    let subject = if request.subject.is_empty() {
        DEFAULT_SUBJECT.to_string()
    } else {
        request.subject.clone()
    };

    let overrides = request.overrides();
    let data = template::data_from_placeholders(request.placeholders.unwrap_or_default());
    let body = template::render(&request.template, &data)?;

    let message = Message::new(to, subject, body).with_overrides(overrides);
    enqueue(&queue, message)?;

    Ok(accepted("Email queued for delivery (POST request)"))
}

async fn get_send(
    State(queue): State<QueueHandle>,
    query: Result<Query<SendEmailQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(format!("Invalid query: {}", e)))?;

    let to = query
        .to
        .as_deref()
        .filter(|to| !to.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing 'to' parameter".to_string()))?;
    let to = parse_recipient(to)?;

    let slug = query.slug.unwrap_or_default();
    let subject = query
        .subject
        .filter(|subject| !subject.is_empty())
        .unwrap_or_else(|| format!("Notification for {}", slug));

    let mut data = match query.data.as_deref().filter(|raw| !raw.is_empty()) {
        Some(raw) => serde_json::from_str::<TemplateData>(raw)
            .map_err(|_| ApiError::BadRequest("Invalid JSON in 'data' parameter".to_string()))?,
        None => TemplateData::new(),
    };
    // The fixed template always sees the query's slug.
    data.insert("slug".to_string(), PlaceholderValue::String(slug));

    let body = template::render(GET_TEMPLATE, &data)?;
    enqueue(&queue, Message::new(to, subject, body))?;

    Ok(accepted("Email queued for delivery (GET request)"))
}

fn parse_recipient(raw: &str) -> Result<Address, ApiError> {
    Address::parse(raw).map_err(|e| ApiError::BadRequest(format!("Invalid 'to' address: {}", e.reason())))
}

fn enqueue(queue: &QueueHandle, message: Message) -> Result<(), ApiError> {
    let id = message.id();
    let recipient = message.to().to_string();

    match queue.enqueue(message) {
        Ok(()) => {
            tracing::info!(message_id = %id, recipient = %recipient, "Email queued");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(message_id = %id, recipient = %recipient, error = %e, "Email rejected by queue");
            Err(e.into())
        }
    }
}

fn accepted(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "success",
            "message": message,
        })),
    )
}

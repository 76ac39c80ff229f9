use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::normalizer::{NormalizationError, PayloadNormalizer};
use super::signature::SignatureVerifier;
use super::Headers;
use crate::dispatch::{DispatchError, EventDispatcher};
use crate::domain::order::Platform;
use crate::metrics::Metrics;

/// What the platform gets back once its event is durably queued
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub event_id: Uuid,
    pub digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook authentication failed")]
    AuthenticationFailure,

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error("Order queue is full, retry later")]
    Overloaded,

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Event could not be persisted")]
    Journal,
}

impl WebhookError {
    pub fn outcome(&self) -> &'static str {
        match self {
            WebhookError::AuthenticationFailure => "unauthorized",
            WebhookError::Normalization(_) => "rejected",
            WebhookError::Overloaded => "overloaded",
            WebhookError::ShuttingDown => "shutting_down",
            WebhookError::Journal => "journal_error",
        }
    }
}

impl From<DispatchError> for WebhookError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Overloaded { .. } => WebhookError::Overloaded,
            DispatchError::ShuttingDown => WebhookError::ShuttingDown,
            DispatchError::Journal(_) => WebhookError::Journal,
        }
    }
}

impl ResponseError for WebhookError {
    fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::AuthenticationFailure => StatusCode::UNAUTHORIZED,
            WebhookError::Normalization(_) => StatusCode::BAD_REQUEST,
            WebhookError::Overloaded | WebhookError::ShuttingDown | WebhookError::Journal => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            WebhookError::Normalization(e) => serde_json::json!({
                "error": e.kind.to_string(),
                "message": e.message,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

/// Verify, normalize, then hand off to the dispatcher.
pub struct WebhookGateway {
    verifier: SignatureVerifier,
    normalizer: PayloadNormalizer,
    dispatcher: EventDispatcher,
    metrics: Arc<Metrics>,
}

impl WebhookGateway {
    pub fn new(
        verifier: SignatureVerifier,
        normalizer: PayloadNormalizer,
        dispatcher: EventDispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { verifier, normalizer, dispatcher, metrics }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn handle(&self, platform: Platform, headers: &Headers, raw_body: &[u8]) -> Result<Accepted, WebhookError> {
        let result = self.accept(platform, headers, raw_body).await;

        match &result {
            Ok(accepted) => {
                self.metrics.record_webhook(platform, "accepted");
                tracing::info!(
                    platform = %platform,
                    event_id = %accepted.event_id,
                    "📥 Webhook accepted"
                );
            }
            Err(e) => {
                self.metrics.record_webhook(platform, e.outcome());
                tracing::warn!(platform = %platform, outcome = e.outcome(), error = %e, "Webhook rejected");
            }
        }

        result
    }

    async fn accept(&self, platform: Platform, headers: &Headers, raw_body: &[u8]) -> Result<Accepted, WebhookError> {
        if !self.verifier.verify(platform, raw_body, headers) {
            return Err(WebhookError::AuthenticationFailure);
        }

        let event = self.normalizer.normalize(platform, raw_body)?;
        let digest = event.raw_payload_digest.clone();
        let event_id = self.dispatcher.submit(event).await?;

        Ok(Accepted { event_id, digest })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

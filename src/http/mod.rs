use actix_web::dev::Server;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;

use crate::domain::order::Platform;
use crate::webhook::{Headers, WebhookError, WebhookGateway};

// ============================================================================
// HTTP Boundary
// ============================================================================
//
// POST /api/webhooks/{platform}          webhook intake
// GET  /api/webhooks/{platform}/verify   endpoint ownership challenge
// GET  /metrics                          Prometheus scrape
// GET  /health                           dispatcher snapshot
//
// ============================================================================

/// Bind the listener. Signals are left to the caller so shutdown can drain
/// the dispatcher after the listener stops.
pub fn build_http_server(gateway: Arc<WebhookGateway>, port: u16) -> std::io::Result<Server> {
    tracing::info!("🌐 Starting HTTP server on http://0.0.0.0:{}", port);

    let gateway = web::Data::from(gateway);
    let server = HttpServer::new(move || App::new().app_data(gateway.clone()).configure(routes))
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    Ok(server)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/webhooks/{platform}", web::post().to(webhook_handler))
        .route("/api/webhooks/{platform}/verify", web::get().to(verify_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/health", web::get().to(health_handler));
}

fn unknown_platform(platform: &str) -> HttpResponse {
    HttpResponse::NotFound().json(serde_json::json!({
        "error": format!("unknown platform `{}`", platform)
    }))
}

fn collect_headers(req: &HttpRequest) -> Headers {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn webhook_handler(
    gateway: web::Data<WebhookGateway>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    let Ok(platform) = path.parse::<Platform>() else {
        return Ok(unknown_platform(&path));
    };

    let accepted = gateway.handle(platform, &collect_headers(&req), &body).await?;
    Ok(HttpResponse::Ok().json(accepted))
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge: Option<String>,
}

async fn verify_handler(path: web::Path<String>, query: web::Query<ChallengeQuery>) -> impl Responder {
    if path.parse::<Platform>().is_err() {
        return unknown_platform(&path);
    }

    match &query.challenge {
        Some(challenge) => HttpResponse::Ok().content_type("text/plain").body(challenge.clone()),
        None => HttpResponse::BadRequest().json(serde_json::json!({ "error": "missing challenge" })),
    }
}

async fn metrics_handler(gateway: web::Data<WebhookGateway>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = gateway.metrics().registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(gateway: web::Data<WebhookGateway>) -> impl Responder {
    let snapshot = gateway.dispatcher().snapshot().await;
    let accepting = snapshot.accepting;

    let body = serde_json::json!({
        "status": if accepting { "healthy" } else { "draining" },
        "service": "order-reconciler",
        "dispatcher": snapshot,
    });

    if accepting {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

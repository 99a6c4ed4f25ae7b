//! HTTP surface.

mod availability;
mod bookings;
mod directory;
pub mod dto;
mod error;

pub use error::ApiError;

use std::time::Instant;

use axum::extract::{FromRequestParts, MatchedPath, Request};
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use ulid::Ulid;

use crate::service::SchedulingService;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub service: SchedulingService,
}

/// Tenant context set by upstream middleware in `X-Tenant-Id`.
#[derive(Debug, Clone, Copy)]
pub struct TenantId(pub Ulid);

impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Forbidden("missing tenant context".into()))?;
        Ulid::from_string(raw.trim())
            .map(TenantId)
            .map_err(|_| ApiError::Forbidden("invalid tenant context".into()))
    }
}

pub fn router(service: SchedulingService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", post(bookings::create).get(bookings::list))
        .route("/bookings/check-availability", post(bookings::check_availability))
        .route("/bookings/available-slots", get(bookings::available_slots))
        .route("/bookings/events", get(bookings::events))
        .route("/bookings/artisan/{id}/schedule", get(bookings::schedule))
        .route("/bookings/{id}", get(bookings::get))
        .route("/bookings/{id}/reschedule", post(bookings::reschedule))
        .route("/bookings/{id}/{action}", post(bookings::transition))
        .route("/availability", post(availability::create).get(availability::list))
        .route("/availability/bulk", post(availability::bulk))
        .route(
            "/availability/{id}",
            get(availability::get)
                .put(availability::update)
                .delete(availability::delete),
        )
        .route("/artisans/{id}", put(directory::put_artisan).get(directory::get_artisan))
        .route("/customers/{id}", put(directory::put_customer))
        .layer(middleware::from_fn(track_metrics))
        .with_state(AppState { service })
}

async fn health() -> Json<Value> {
    Json(json!({ "success": true, "data": { "status": "ok" } }))
}

/// RED metrics per matched route.
async fn track_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();
    let response = next.run(request).await;

    let status = crate::observability::status_label(response.status().as_u16());
    metrics::counter!(crate::observability::HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

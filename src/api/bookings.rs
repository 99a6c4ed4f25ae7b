use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream};
use tokio::sync::broadcast;

use crate::engine::BookingAction;
use crate::limits::DEFAULT_PAGE_SIZE;
use crate::model::*;
use crate::service::{CreateBooking, SlotQuery};

use super::dto::*;
use super::{ApiError, AppState, IDEMPOTENCY_HEADER, TenantId};

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope::ok(data))))
}

pub(super) async fn create(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    headers: HeaderMap,
    body: Result<Json<CreateBookingBody>, JsonRejection>,
) -> ApiResult<BookingView> {
    let Json(body) = body?;
    let idempotency_key = match headers.get(IDEMPOTENCY_HEADER) {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| ApiError::BadRequest("Idempotency-Key must be ASCII".into()))?
                .to_string(),
        ),
        None => None,
    };
    let request = CreateBooking {
        artisan_id: parse_id(&body.artisan_id, "artisan_id")?,
        customer_id: parse_id(&body.customer_id, "customer_id")?,
        service_id: parse_id(&body.service_id, "service_id")?,
        scheduled_at: parse_instant(&body.scheduled_at, "scheduled_at")?,
        duration_minutes: body.duration_minutes,
    };

    let created = state
        .service
        .create_booking(tenant, request, idempotency_key)
        .await?;
    let view = BookingView::from(&created.booking);
    if created.replayed {
        Ok((
            StatusCode::OK,
            Json(Envelope::with_message(view, "existing booking returned for idempotency key")),
        ))
    } else {
        Ok((
            StatusCode::CREATED,
            Json(Envelope::with_message(view, "booking created")),
        ))
    }
}

pub(super) async fn get(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
) -> ApiResult<BookingView> {
    let id = parse_id(&id, "booking id")?;
    let booking = state.service.get_booking(tenant, id).await?;
    ok(BookingView::from(&booking))
}

pub(super) async fn list(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<PageView> {
    let Query(params) = params?;
    let filter = BookingFilter {
        tenant_id: tenant,
        artisan_id: parse_opt_id(params.artisan_id.as_deref(), "artisan_id")?,
        customer_id: parse_opt_id(params.customer_id.as_deref(), "customer_id")?,
        status: params
            .status
            .as_deref()
            .map(str::parse::<BookingStatus>)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        sort: params
            .sort
            .as_deref()
            .map(str::parse::<BookingSort>)
            .transpose()
            .map_err(ApiError::BadRequest)?
            .unwrap_or_default(),
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    };
    let page = state.service.list_bookings(&filter).await?;
    ok(PageView::from(&page))
}

pub(super) async fn transition(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path((id, action)): Path<(String, String)>,
    body: Result<Json<TransitionBody>, JsonRejection>,
) -> ApiResult<BookingView> {
    let action: BookingAction = action
        .parse()
        .map_err(|_| ApiError::NotFound(format!("no booking action named {action:?}")))?;
    let id = parse_id(&id, "booking id")?;
    let Json(body) = body?;
    let booking = state
        .service
        .transition(tenant, id, action, body.version, body.note)
        .await?;
    ok(BookingView::from(&booking))
}

pub(super) async fn reschedule(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
    body: Result<Json<RescheduleBody>, JsonRejection>,
) -> ApiResult<RescheduleView> {
    let id = parse_id(&id, "booking id")?;
    let Json(body) = body?;
    let new_start = parse_instant(&body.scheduled_at, "scheduled_at")?;
    let moved = state
        .service
        .reschedule(tenant, id, body.version, new_start)
        .await?;
    Ok((
        StatusCode::OK,
        Json(Envelope::with_message(
            RescheduleView {
                previous: BookingView::from(&moved.previous),
                booking: BookingView::from(&moved.booking),
            },
            "booking rescheduled",
        )),
    ))
}

pub(super) async fn check_availability(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    body: Result<Json<CheckAvailabilityBody>, JsonRejection>,
) -> ApiResult<AvailabilityView> {
    let Json(body) = body?;
    let artisan_id = parse_id(&body.artisan_id, "artisan_id")?;
    let start = parse_instant(&body.start, "start")?;
    let check = state
        .service
        .check_availability(tenant, artisan_id, start, body.duration)
        .await?;
    ok(AvailabilityView::from(check))
}

pub(super) async fn available_slots(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    params: Result<Query<SlotsParams>, QueryRejection>,
) -> ApiResult<Vec<SlotView>> {
    let Query(params) = params?;
    let query = SlotQuery {
        artisan_id: parse_id(&params.artisan_id, "artisan_id")?,
        from: params.date,
        to: params.end_date.unwrap_or(params.date),
        duration_minutes: params.duration,
        include_booked: params.include_booked,
    };
    let slots = state.service.get_available_slots(tenant, &query).await?;
    ok(slots.iter().map(SlotView::from).collect())
}

pub(super) async fn schedule(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
    params: Result<Query<ScheduleParams>, QueryRejection>,
) -> ApiResult<Vec<BookingView>> {
    let artisan_id = parse_id(&id, "artisan id")?;
    let Query(params) = params?;
    let bookings = state
        .service
        .artisan_schedule(tenant, artisan_id, params.start_date, params.end_date)
        .await?;
    ok(bookings.iter().map(BookingView::from).collect())
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::ArtisanRegistered { .. } => "artisan_registered",
        Event::ArtisanUpdated { .. } => "artisan_updated",
        Event::CustomerRegistered { .. } => "customer_registered",
        Event::RuleUpserted { .. } => "rule_upserted",
        Event::RulesUpserted { .. } => "rules_upserted",
        Event::RuleDeleted { .. } => "rule_deleted",
        Event::BookingCreated { .. } => "booking_created",
        Event::BookingStatusChanged { .. } => "booking_status_changed",
        Event::BookingRescheduled { .. } => "booking_rescheduled",
    }
}

fn is_booking_event(event: &Event) -> bool {
    matches!(
        event,
        Event::BookingCreated { .. } | Event::BookingStatusChanged { .. } | Event::BookingRescheduled { .. }
    )
}

/// Server-sent stream of committed booking events, tenant-wide or for
/// one artisan.
pub(super) async fn events(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    params: Result<Query<EventsParams>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Query(params) = params?;
    let notify = &state.service.engine().notify;
    let rx = match parse_opt_id(params.artisan_id.as_deref(), "artisan_id")? {
        Some(artisan_id) => {
            state.service.get_artisan(tenant, artisan_id).await?;
            notify.subscribe(artisan_id)
        }
        None => notify.subscribe_tenant(tenant),
    };

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) if is_booking_event(&event) => {
                    let sse = SseEvent::default()
                        .event(event_name(&event))
                        .json_data(&event)
                        .unwrap_or_else(|e| SseEvent::default().event("error").data(e.to_string()));
                    return Some((Ok(sse), rx));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

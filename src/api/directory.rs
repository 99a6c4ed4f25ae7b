use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use super::dto::*;
use super::{ApiError, AppState, TenantId};

pub(super) async fn put_artisan(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
    body: Result<Json<ArtisanBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<ArtisanView>>), ApiError> {
    let id = parse_id(&id, "artisan id")?;
    let Json(body) = body?;
    let (info, created) = state
        .service
        .put_artisan(tenant, id, body.name, body.utc_offset_minutes)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(Envelope::ok(ArtisanView::from(info)))))
}

pub(super) async fn get_artisan(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
) -> Result<Json<Envelope<ArtisanView>>, ApiError> {
    let id = parse_id(&id, "artisan id")?;
    let info = state.service.get_artisan(tenant, id).await?;
    Ok(Json(Envelope::ok(ArtisanView::from(info))))
}

pub(super) async fn put_customer(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Envelope<CustomerView>>), ApiError> {
    let id = parse_id(&id, "customer id")?;
    let created = state.service.put_customer(tenant, id).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(Envelope::ok(CustomerView {
            id,
            tenant_id: tenant,
        })),
    ))
}

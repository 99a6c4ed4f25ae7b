use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::dto::*;
use super::{ApiError, AppState, TenantId};

pub(super) async fn create(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    body: Result<Json<RuleBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let artisan_id = parse_id(&body.artisan_id, "artisan_id")?;
    let rule = body.rule.into_rule(artisan_id, None)?;
    let stored = state.service.upsert_rule(tenant, rule).await?;
    Ok((
        StatusCode::CREATED,
        Json(Envelope::with_message(RuleView::from(&stored), "availability rule saved")),
    )
        .into_response())
}

pub(super) async fn bulk(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    body: Result<Json<BulkRulesBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let artisan_id = parse_id(&body.artisan_id, "artisan_id")?;
    let rules = body
        .rules
        .into_iter()
        .map(|fields| fields.into_rule(artisan_id, None))
        .collect::<Result<Vec<_>, _>>()?;
    let stored = state.service.bulk_upsert(tenant, artisan_id, rules).await?;
    let count = stored.len();
    Ok((
        StatusCode::CREATED,
        Json(Envelope::with_message(
            stored.iter().map(RuleView::from).collect::<Vec<_>>(),
            format!("{count} availability rules saved"),
        )),
    )
        .into_response())
}

pub(super) async fn list(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    params: Result<Query<RulesParams>, QueryRejection>,
) -> Result<Json<Envelope<Vec<RuleView>>>, ApiError> {
    let Query(params) = params?;
    let artisan_id = parse_id(&params.artisan_id, "artisan_id")?;
    let range = match (params.from, params.to) {
        (None, None) => None,
        (Some(from), None) => Some((from, from)),
        (None, Some(to)) => Some((to, to)),
        (Some(from), Some(to)) => Some((from, to)),
    };
    let rules = state.service.list_rules(tenant, artisan_id, range).await?;
    Ok(Json(Envelope::ok(rules.iter().map(RuleView::from).collect())))
}

pub(super) async fn get(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
) -> Result<Json<Envelope<RuleView>>, ApiError> {
    let id = parse_id(&id, "rule id")?;
    let rule = state.service.get_rule(tenant, id).await?;
    Ok(Json(Envelope::ok(RuleView::from(&rule))))
}

/// Replace a rule. The rule keeps its artisan.
pub(super) async fn update(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
    body: Result<Json<RuleFields>, JsonRejection>,
) -> Result<Json<Envelope<RuleView>>, ApiError> {
    let id = parse_id(&id, "rule id")?;
    let Json(fields) = body?;
    let existing = state.service.get_rule(tenant, id).await?;
    let rule = fields.into_rule(existing.artisan_id, Some(id))?;
    let stored = state.service.upsert_rule(tenant, rule).await?;
    Ok(Json(Envelope::with_message(
        RuleView::from(&stored),
        "availability rule updated",
    )))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    TenantId(tenant): TenantId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id, "rule id")?;
    state.service.delete_rule(tenant, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

//! Provider webhook endpoints
//!
//! Providers read the outcome from the `error` field, so every handled
//! callback is answered with HTTP 200. Only a provider we are not configured
//! for gets a non-200.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use rentline_billing::{
    HostedCheckoutAdapter, HostedWebhookReply, RawMessage, TwoPhaseAction, TwoPhaseAdapter,
    TwoPhaseReply, HOSTED_SIGNATURE_HEADER,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn two_phase_adapter(state: &AppState) -> ApiResult<&TwoPhaseAdapter> {
    state
        .billing
        .two_phase
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Two-phase provider is not configured".into()))
}

fn hosted_adapter(state: &AppState) -> ApiResult<&HostedCheckoutAdapter> {
    state
        .billing
        .hosted
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Hosted checkout is not configured".into()))
}

pub async fn two_phase_prepare(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<TwoPhaseReply>> {
    let adapter = two_phase_adapter(&state)?;
    Ok(Json(adapter.handle(&body, TwoPhaseAction::Prepare).await))
}

pub async fn two_phase_complete(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<TwoPhaseReply>> {
    let adapter = two_phase_adapter(&state)?;
    Ok(Json(adapter.handle(&body, TwoPhaseAction::Complete).await))
}

pub async fn hosted_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<HostedWebhookReply>> {
    let adapter = hosted_adapter(&state)?;
    let signature = headers
        .get(HOSTED_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let raw = RawMessage::new(&body).with_signature(signature);
    Ok(Json(adapter.handle(&raw).await))
}

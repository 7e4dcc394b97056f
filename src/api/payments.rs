use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::order::{self, OrderDetail, PaymentEvent};

use super::SharedState;

/// Hex keyed-BLAKE3 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-payment-signature";

#[utoipa::path(
    context_path = "/api/payments",
    path = "/webhook",
    method(post),
    request_body = PaymentEvent,
    params(
        ("x-payment-signature" = String, Header, description = "Signature of the raw body")
    ),
    responses(
        (status = 200, description = "Payment outcome applied", body = OrderDetail),
        (status = 400, description = "Malformed event or amount mismatch"),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Unknown payment reference"),
        (status = 409, description = "Payment already settled differently")
    )
)]
pub async fn webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OrderDetail>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("Missing payment signature".to_string()))?;
    if !state.webhook.verify(&body, signature) {
        warn!("rejected payment callback with a bad signature");
        return Err(Error::Unauthorized("Invalid payment signature".to_string()));
    }
    let event: PaymentEvent = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("Malformed payment event: {e}")))?;
    info!("payment callback {} {:?}", event.reference, event.status);
    Ok(Json(order::complete_payment(&state.database, event).await?))
}

pub fn routes() -> Router<SharedState> {
    Router::new().route("/webhook", post(webhook))
}

use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    events::Event,
    services::reconciliation::ReconcileOutcome,
    webhooks::{event, event::CheckoutSession, event::WebhookEvent, signature},
    AppState,
};

/// Acknowledgement body returned for every accepted delivery.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

// POST /api/v1/webhooks/stripe
//
// The body must be read as raw bytes: the signature covers the exact byte
// sequence the provider sent, and nothing is parsed until it verifies.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/stripe",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted (including deliberate no-ops)", body = WebhookAck),
        (status = 400, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 500, description = "Transient store failure; provider should redeliver", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    signature::verify(
        &headers,
        &body,
        &state.config.stripe_webhook_secret,
        state.config.stripe_webhook_tolerance_secs,
    )
    .map_err(|e| {
        warn!(reason = %e, "webhook signature verification failed");
        ServiceError::InvalidSignature(e.to_string())
    })?;

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(ev) => ev,
        Err(e) => {
            // Unparsable after a valid signature: redelivery of the same
            // bytes cannot help, so acknowledge and alert instead.
            error!(error = %e, "webhook payload is not valid JSON; acknowledging to stop redelivery");
            alert(
                &state,
                Event::UnreconcilableEvent {
                    session_id: None,
                    reason: format!("event payload is not valid JSON: {}", e),
                },
            )
            .await;
            return Ok(ack());
        }
    };

    match event.event_type.as_str() {
        event::CHECKOUT_SESSION_COMPLETED => {
            let session: CheckoutSession = match serde_json::from_value(event.data.object.clone())
            {
                Ok(session) => session,
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "checkout session object is malformed; acknowledging to stop redelivery");
                    alert(
                        &state,
                        Event::UnreconcilableEvent {
                            session_id: None,
                            reason: format!("checkout session object is malformed: {}", e),
                        },
                    )
                    .await;
                    return Ok(ack());
                }
            };

            match state
                .reconciliation_service
                .reconcile_completed_session(&session)
                .await
            {
                Ok(ReconcileOutcome::Created { order_id }) => {
                    info!(event_id = %event.id, order_id = %order_id, "order created for completed session");
                    Ok(ack())
                }
                Ok(ReconcileOutcome::AlreadyProcessed { order_id }) => {
                    info!(event_id = %event.id, order_id = %order_id, "completed session already processed");
                    Ok(ack())
                }
                Err(err) if err.is_transient() => {
                    // 5xx invites redelivery; the idempotency guard makes
                    // the retry safe.
                    error!(event_id = %event.id, session_id = %session.id, error = %err, "transient failure while reconciling; requesting redelivery");
                    Err(err)
                }
                Err(err) => {
                    // Business or payload failure: redelivery cannot fix
                    // it. Acknowledge and flag for the operator.
                    error!(event_id = %event.id, session_id = %session.id, error = %err, "unrecoverable reconciliation failure; acknowledging to stop redelivery");
                    if let ServiceError::MalformedPayload(reason) = &err {
                        alert(
                            &state,
                            Event::UnreconcilableEvent {
                                session_id: Some(session.id.clone()),
                                reason: reason.clone(),
                            },
                        )
                        .await;
                    }
                    Ok(ack())
                }
            }
        }
        event::PAYMENT_INTENT_SUCCEEDED => {
            info!(event_id = %event.id, "payment succeeded; no action taken");
            Ok(ack())
        }
        event::PAYMENT_INTENT_FAILED => {
            info!(event_id = %event.id, "payment failed; no action taken");
            Ok(ack())
        }
        other => {
            info!(event_id = %event.id, event_type = %other, "unhandled webhook event type");
            Ok(ack())
        }
    }
}

fn ack() -> (StatusCode, Json<WebhookAck>) {
    (StatusCode::OK, Json(WebhookAck { received: true }))
}

async fn alert(state: &AppState, event: Event) {
    if let Err(e) = state.event_sender.send(event).await {
        warn!(error = %e, "failed to send alert event");
    }
}

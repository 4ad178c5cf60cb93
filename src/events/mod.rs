use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

/// Events emitted by the reconciliation flow.
///
/// `StockShortfall` and `UnreconcilableEvent` are the operator-alert channel:
/// they mark deliveries that were acknowledged to the payment provider (so
/// redelivery stops) but still need manual follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    CheckoutSessionReconciled {
        session_id: String,
        order_id: Uuid,
    },
    DuplicateDeliveryIgnored {
        session_id: String,
        order_id: Uuid,
    },
    StockShortfall {
        session_id: String,
        product_id: Uuid,
        requested: i32,
        available: i32,
    },
    UnreconcilableEvent {
        session_id: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Processes incoming events. Informational events are logged; alert events
/// are logged at error level so they reach the operator's monitoring.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "order created");
            }
            Event::CheckoutSessionReconciled {
                session_id,
                order_id,
            } => {
                info!(session_id = %session_id, order_id = %order_id, "checkout session reconciled");
            }
            Event::DuplicateDeliveryIgnored {
                session_id,
                order_id,
            } => {
                info!(session_id = %session_id, order_id = %order_id, "duplicate webhook delivery ignored");
            }
            Event::StockShortfall {
                session_id,
                product_id,
                requested,
                available,
            } => {
                error!(
                    session_id = %session_id,
                    product_id = %product_id,
                    requested = requested,
                    available = available,
                    "OPERATOR ATTENTION: paid session could not be fulfilled, stock shortfall; manual refund or backorder required"
                );
            }
            Event::UnreconcilableEvent { session_id, reason } => {
                error!(
                    session_id = ?session_id,
                    reason = %reason,
                    "OPERATOR ATTENTION: webhook event acknowledged but could not be reconciled"
                );
            }
        }
    }

    info!("Event processing loop stopped");
}

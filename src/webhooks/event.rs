//! Payment provider event envelope and checkout session payload.
//!
//! The cart snapshot travels as opaque session metadata: a JSON string of
//! `[{"productId": "...", "quantity": n}, ...]` plus the chosen shipping
//! method id (possibly empty). It is the only channel carrying what was
//! actually ordered across the gap between checkout initiation and webhook
//! delivery. Prices are deliberately absent from it; the catalog is the
//! authority (see the reconciliation service).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Event kinds the reconciler distinguishes. Anything else is acknowledged
/// and ignored so new provider event types never break the endpoint.
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";

/// Outer webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// The provider's record of a completed checkout session.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Amount charged, in currency minor units (cents).
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<PostalAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostalAddress {
    #[serde(default)]
    pub line1: Option<String>,
    #[serde(default)]
    pub line2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Opaque metadata attached to the session at checkout initiation.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionMetadata {
    /// JSON-encoded cart snapshot.
    #[serde(default)]
    pub items: Option<String>,
    /// Chosen shipping method id; the initiator sends an empty string when
    /// none was selected.
    #[serde(default, rename = "shippingMethodId")]
    pub shipping_method_id: Option<String>,
}

/// One entry of the cart snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartEntry {
    #[serde(rename = "productId")]
    pub product_id: Uuid,
    pub quantity: i32,
}

impl CheckoutSession {
    /// Deserializes and validates the cart snapshot.
    ///
    /// Missing or unparsable metadata is terminal for this event: the order
    /// cannot be reconstructed from anything else.
    pub fn cart_entries(&self) -> Result<Vec<CartEntry>, ServiceError> {
        let items = self
            .metadata
            .as_ref()
            .and_then(|m| m.items.as_deref())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::MalformedPayload("cart snapshot metadata is missing".to_string())
            })?;

        let entries: Vec<CartEntry> = serde_json::from_str(items).map_err(|e| {
            ServiceError::MalformedPayload(format!("cart snapshot is not valid JSON: {}", e))
        })?;

        if entries.is_empty() {
            return Err(ServiceError::MalformedPayload(
                "cart snapshot is empty".to_string(),
            ));
        }

        if let Some(entry) = entries.iter().find(|e| e.quantity <= 0) {
            return Err(ServiceError::MalformedPayload(format!(
                "cart snapshot has non-positive quantity {} for product {}",
                entry.quantity, entry.product_id
            )));
        }

        Ok(entries)
    }

    /// The authoritative amount charged, converted from minor units.
    ///
    /// This never falls back to a locally computed sum: the provider's
    /// record is what the customer actually paid.
    pub fn total_amount(&self) -> Result<Decimal, ServiceError> {
        let minor = self.amount_total.ok_or_else(|| {
            ServiceError::MalformedPayload("session has no amount_total".to_string())
        })?;
        Ok(Decimal::new(minor, 2))
    }

    /// The shipping method chosen at initiation, if any was recorded and it
    /// parses as an id. Resolution against the store happens later; a
    /// deleted method degrades to no reference.
    pub fn shipping_method_ref(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.shipping_method_id.as_deref())
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn customer_name(&self) -> String {
        self.customer_details
            .as_ref()
            .and_then(|d| d.name.clone())
            .unwrap_or_default()
    }

    pub fn customer_email(&self) -> String {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .unwrap_or_default()
    }

    pub fn shipping_address(&self) -> Option<&PostalAddress> {
        self.customer_details.as_ref().and_then(|d| d.address.as_ref())
    }
}

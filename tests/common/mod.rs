use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use atelier_api::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{product, shipping_method},
    events::{self, EventSender},
    services::reconciliation::ReconciliationService,
    webhooks::signature,
    AppState,
};

pub const TEST_SECRET: &str = "whsec_integration_test_secret";

/// Helper harness for spinning up an application backed by an in-memory
/// SQLite database. The pool is pinned to a single connection so the
/// in-memory database survives for the lifetime of the harness.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let cfg = AppConfig::new("sqlite::memory:", TEST_SECRET, "127.0.0.1", 18_080, "test");

        let db_config = DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(5),
        };

        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("failed to create test database");

        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let reconciliation_service =
            ReconciliationService::new(db_arc.clone(), Some(Arc::new(event_sender.clone())));

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            reconciliation_service,
        };

        let router = atelier_api::app_router().with_state(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    /// Inserts a catalog product with the given price and stock level.
    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Product {}", sku)),
            description: Set(None),
            sku: Set(sku.to_string()),
            price: Set(price),
            currency: Set("EUR".to_string()),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product")
    }

    /// Inserts a shipping method.
    #[allow(dead_code)]
    pub async fn seed_shipping_method(&self, name: &str, price: Decimal) -> shipping_method::Model {
        shipping_method::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            price: Set(price),
            estimated_days: Set(Some(3)),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed shipping method")
    }

    /// Signs the payload with the test secret and delivers it to the webhook
    /// endpoint.
    pub async fn post_webhook(&self, payload: &Value) -> Response {
        let body = serde_json::to_vec(payload).expect("payload serializes");
        let ts = Utc::now().timestamp();
        let sig = signature::signature_header(TEST_SECRET, ts, &body);
        self.post_webhook_raw(body, &sig).await
    }

    /// Delivers raw bytes with an arbitrary signature header.
    pub async fn post_webhook_raw(&self, body: Vec<u8>, sig_header: &str) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/stripe")
            .header(header::CONTENT_TYPE, "application/json")
            .header(signature::SIGNATURE_HEADER, sig_header)
            .body(Body::from(body))
            .expect("request builds");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("request dispatch")
    }
}

/// Builds a `checkout.session.completed` event envelope the way the
/// checkout initiator populates sessions: cart snapshot and shipping method
/// id as string metadata, amount in minor units, customer details captured
/// by the provider.
pub fn checkout_completed_event(
    session_id: &str,
    amount_total_minor: i64,
    items: &Value,
    shipping_method_id: &str,
) -> Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "amount_total": amount_total_minor,
                "currency": "eur",
                "customer_details": {
                    "name": "Claire Fontaine",
                    "email": "claire@example.com",
                    "address": {
                        "line1": "8 quai de la Loire",
                        "line2": null,
                        "city": "Nantes",
                        "postal_code": "44000",
                        "country": "FR"
                    }
                },
                "metadata": {
                    "items": items.to_string(),
                    "shippingMethodId": shipping_method_id
                }
            }
        }
    })
}

/// Extracts the response body as JSON.
pub async fn response_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

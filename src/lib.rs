//! Atelier API Library
//!
//! Order reconciliation backend for the Atelier storefront: verifies payment
//! provider webhooks and materializes orders, line items and stock movements
//! from completed checkout sessions.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Json, Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub reconciliation_service: services::reconciliation::ReconciliationService,
}

/// Builds the application router. State is supplied by the caller so tests
/// can assemble the same surface against their own store.
pub fn app_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/api/v1/webhooks/stripe",
            post(handlers::stripe_webhooks::stripe_webhook),
        )
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(openapi::openapi()) }),
        )
}

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::stripe_webhooks::stripe_webhook,
        crate::handlers::health::health,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::handlers::stripe_webhooks::WebhookAck,
        crate::handlers::health::HealthReport,
    )),
    tags(
        (name = "Webhooks", description = "Payment provider webhook intake"),
        (name = "Health", description = "Service health"),
    ),
    info(
        title = "atelier-api",
        description = "Order reconciliation backend for the Atelier storefront"
    )
)]
pub struct ApiDoc;

/// The assembled OpenAPI document, served as plain JSON.
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

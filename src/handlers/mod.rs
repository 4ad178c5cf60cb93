pub mod health;
pub mod stripe_webhooks;

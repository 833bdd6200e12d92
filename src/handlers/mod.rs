pub mod health;
pub mod orders;
pub mod payment_callback;
pub mod payment_webhooks;
pub mod payments;
pub mod session;

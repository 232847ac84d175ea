pub mod async_webhook;
pub mod handler;
pub mod models;

//! Data models shared across stores, services and API handlers.

pub mod chat;
pub mod metrics;
pub mod user;

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod http;
pub mod metrics;
pub mod reconciliation;
pub mod store;
pub mod utils;
pub mod webhook;

pub mod app;
pub mod config;
pub mod error;
pub mod notifier;
pub mod rate_limit;
pub mod store;
pub mod telegram;
pub mod validation;

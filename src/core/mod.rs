pub mod app;
pub mod config;
pub mod reconciliation;
pub mod store;
pub mod terminal;

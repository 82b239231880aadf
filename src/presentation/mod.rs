// Presentation layer - HTTP surface over per-view state
pub mod app_state;
pub mod handlers;

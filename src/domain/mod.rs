// Domain layer - Pure telemetry types and transforms
pub mod date_window;
pub mod error;
pub mod export;
pub mod merger;
pub mod telemetry;
pub mod validation;

// Application layer - Polling, retry and per-view orchestration
pub mod orchestrator;
pub mod polling_clock;
pub mod retry_scheduler;
pub mod telemetry_provider;

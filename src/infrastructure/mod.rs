// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod http_response;
pub mod payload_decoder;
pub mod provider_client;

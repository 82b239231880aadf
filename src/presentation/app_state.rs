// Application state for HTTP handlers
use crate::application::orchestrator::OrchestratorRegistry;

#[derive(Clone)]
pub struct AppState {
    pub views: OrchestratorRegistry,
}
